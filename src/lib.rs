pub mod config;
pub mod feedback;
pub mod protocol;
pub mod routes;
pub mod sandbox;
pub mod value;
pub mod web_server;
pub mod worker;
