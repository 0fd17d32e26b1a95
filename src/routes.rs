use std::time::Duration;

use actix_web::error::{InternalError, JsonPayloadError};
use actix_web::{HttpRequest, HttpResponse, Responder, post, web};
use serde::Serialize;

use crate::protocol::{Request, ResultKind};
use crate::worker::Grader;

#[derive(Serialize)]
struct ErrorResponse {
    reason: &'static str,
    code: u32,
}

pub fn json_error_handler(err: JsonPayloadError, _req: &HttpRequest) -> actix_web::Error {
    let response = HttpResponse::BadRequest().json(ErrorResponse {
        reason: "ERR_INVALID_ARGUMENT",
        code: 1,
    });
    InternalError::from_response(err, response).into()
}

#[post("/run")]
pub async fn run_handler(grader: web::Data<Grader>, body: web::Json<Request>) -> impl Responder {
    let response = grader.grade(body.into_inner()).await;

    if response.result == ResultKind::Timeout {
        // The timed-out run still holds the pipeline; give the response a
        // moment to flush, then let the supervisor restart us.
        log::warn!("Shutting down after a timed-out run");
        actix_web::rt::spawn(async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            std::process::exit(1);
        });
    }

    HttpResponse::Ok().json(response)
}
