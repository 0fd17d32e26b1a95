use actix_web::{App, HttpServer, dev::Server, middleware, web};

use crate::config::ServerConfig;
use crate::routes::{json_error_handler, run_handler};
use crate::worker::Grader;

/// Submissions with data files easily exceed actix's default JSON limit
const REQUEST_LIMIT: usize = 16 * 1024 * 1024;

pub fn build_server(server_config: ServerConfig, grader: Grader) -> std::io::Result<Server> {
    let grader = web::Data::new(grader);

    let server = HttpServer::new(move || {
        App::new()
            .app_data(grader.clone())
            .app_data(
                web::JsonConfig::default()
                    .limit(REQUEST_LIMIT)
                    .error_handler(json_error_handler),
            )
            .wrap(middleware::Logger::default())
            .service(run_handler)
    })
    .workers(1)
    .bind((
        server_config
            .bind_address
            .unwrap_or("127.0.0.1".to_string()),
        server_config.bind_port.unwrap_or(12345),
    ))?
    .run();

    Ok(server)
}
