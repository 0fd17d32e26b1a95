use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::protocol::{Request, Response};
use crate::sandbox::Pipeline;

/// Runs one request on the blocking pool, bounded by an optional wall-clock
/// limit.
///
/// A run that exceeds the limit cannot be cancelled: its thread keeps the
/// pipeline busy, so the caller is expected to terminate the process after
/// reporting the timeout.
pub async fn grade(pipeline: Arc<Pipeline>, request: Request, limit: Option<Duration>) -> Response {
    let handle = tokio::task::spawn_blocking(move || pipeline.run(request));

    let joined = match limit {
        Some(limit) => match tokio::time::timeout(limit, handle).await {
            Ok(joined) => joined,
            Err(_) => {
                log::error!("Grading did not finish within {limit:?}");
                return Response::timeout(limit);
            }
        },
        None => handle.await,
    };

    match joined {
        Ok(response) => response,
        Err(e) => {
            log::error!("Grading task failed: {e}");
            Response::uncaught(&anyhow::anyhow!("grading task failed: {e}"))
        }
    }
}

/// Shared entry point of the HTTP server; requests are graded one at a time
pub struct Grader {
    pipeline: Arc<Pipeline>,
    timeout: Option<Duration>,
    turn: Mutex<()>,
}

impl Grader {
    pub fn new(pipeline: Arc<Pipeline>, timeout: Option<Duration>) -> Self {
        Self {
            pipeline,
            timeout,
            turn: Mutex::new(()),
        }
    }

    pub async fn grade(&self, request: Request) -> Response {
        let _turn = self.turn.lock().await;
        grade(Arc::clone(&self.pipeline), request, self.timeout).await
    }
}
