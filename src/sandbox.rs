mod bridge;
pub mod diagnostics;
mod engine;
mod executor;
mod figures;
mod pipeline;

pub use engine::Limits;
pub use pipeline::Pipeline;
