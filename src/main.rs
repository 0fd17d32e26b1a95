use std::io::{Read, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use coderun::config::{CliArgs, Command, Config};
use coderun::protocol::{Request, Response};
use coderun::sandbox::Pipeline;
use coderun::web_server::build_server;
use coderun::worker::{Grader, grade};

fn read_request(input: Option<&str>, correct_code: Option<&str>) -> Result<Request> {
    let text = match input {
        Some(path) => std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?,
        None => {
            let mut text = String::new();
            std::io::stdin()
                .read_to_string(&mut text)
                .context("Failed to read request from stdin")?;
            text
        }
    };
    let request: Request = serde_json::from_str(&text).context("Malformed request")?;
    match correct_code {
        Some(path) => {
            let correct_code =
                std::fs::read_to_string(path).with_context(|| format!("Failed to read {path}"))?;
            Ok(request.with_correct_code(&correct_code))
        }
        None => Ok(request),
    }
}

#[actix_web::main]
async fn main() -> Result<()> {
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = CliArgs::parse();
    let Config {
        server: server_config,
        limits: limits_config,
    } = cli.to_config().context("Failed to load configuration")?;

    let pipeline = Arc::new(Pipeline::new(limits_config.to_limits()));
    let timeout = limits_config.timeout();
    log::debug!("Limits: {:?}, timeout: {timeout:?}", pipeline.limits());

    match cli.command {
        Command::Run { input, correct_code } => {
            let response = match read_request(input.as_deref(), correct_code.as_deref()) {
                Ok(request) => grade(pipeline, request, timeout).await,
                Err(e) => {
                    log::error!("{e:#}");
                    Response::uncaught(&e)
                }
            };

            let mut stdout = std::io::stdout().lock();
            serde_json::to_writer(&mut stdout, &response)?;
            writeln!(stdout)?;
            stdout.flush()?;

            // A timed-out run may still occupy the blocking pool
            std::process::exit(0);
        }
        Command::Serve => {
            let server = build_server(server_config, Grader::new(pipeline, timeout))
                .context("Failed to build server")?;
            let server_handle = server.handle();
            let server_task = actix_web::rt::spawn(server);

            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    log::info!("Ctrl-c received, shutting down...");
                }
                res_server = server_task => {
                    log::error!("Server terminated unexpectedly: {:?}", res_server);
                }
            }

            server_handle.stop(true).await;
            log::info!("Shutdown complete");
            Ok(())
        }
    }
}
