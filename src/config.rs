use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::Deserialize;

use crate::sandbox::Limits;

#[derive(Parser)]
#[command(name = "coderun", version = "1.0", about, long_about = None)]
pub struct CliArgs {
    /// Path to the configuration file
    #[arg(long = "config", short = 'c', global = true)]
    pub config_path: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
pub enum Command {
    /// Grade one request and print the response as JSON
    Run {
        /// Request file; stdin when omitted
        #[arg(long = "input", short = 'i')]
        input: Option<String>,
        /// Reference solution substituted for `###CORRECT_CODE###` lines of
        /// the test code
        #[arg(long = "correct-code")]
        correct_code: Option<String>,
    },
    /// Serve grading requests over HTTP
    Serve,
}

impl CliArgs {
    /// Load the configuration from the specified file, if any
    pub fn to_config(&self) -> std::io::Result<Config> {
        let Some(path) = &self.config_path else {
            return Ok(Config::default());
        };
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        serde_json::from_reader(reader).map_err(|e| e.into())
    }
}

#[derive(Deserialize, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub limits: LimitsConfig,
}

#[derive(Deserialize, Debug, Default)]
pub struct ServerConfig {
    pub bind_address: Option<String>,
    pub bind_port: Option<u16>,
}

#[derive(Deserialize, Debug, Default)]
pub struct LimitsConfig {
    /// Wall-clock limit of a whole run, enforced by the supervisor
    pub timeout: Option<MilliSecond>,
    pub max_call_levels: Option<usize>,
    pub max_expr_depth: Option<usize>,
    pub max_operations: Option<u64>,
    pub worker_stack_size: Option<ByteSize>,
}

impl LimitsConfig {
    pub fn to_limits(&self) -> Limits {
        let default = Limits::default();
        Limits {
            max_call_levels: self.max_call_levels.unwrap_or(default.max_call_levels),
            max_expr_depth: self.max_expr_depth.unwrap_or(default.max_expr_depth),
            max_operations: self.max_operations.unwrap_or(default.max_operations),
            worker_stack_size: self
                .worker_stack_size
                .map_or(default.worker_stack_size, |ByteSize(b)| b as usize),
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout.map(|MilliSecond(ms)| Duration::from_millis(ms))
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MilliSecond(pub u64);

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ByteSize(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_deserialization() {
        let file = std::fs::File::open("data/example.json").unwrap();
        let reader = std::io::BufReader::new(file);
        let config: Config = serde_json::from_reader(reader).unwrap();
        assert_eq!(config.server.bind_address, Some("127.0.0.1".to_string()));
        assert_eq!(config.limits.timeout, Some(MilliSecond(10000)));
        assert_eq!(config.limits.worker_stack_size, Some(ByteSize(33554432)));

        let limits = config.limits.to_limits();
        assert_eq!(limits.max_operations, 50000000);
        assert_eq!(limits.max_call_levels, Limits::default().max_call_levels);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(config.limits.to_limits(), Limits::default());
        assert_eq!(config.limits.timeout(), None);
    }

    #[test]
    fn test_cli_subcommands() {
        let cli = CliArgs::parse_from(["coderun", "run", "--input", "request.json", "-c", "cfg.json"]);
        assert_eq!(
            cli.command,
            Command::Run {
                input: Some("request.json".to_string()),
                correct_code: None,
            }
        );

        let cli = CliArgs::parse_from(["coderun", "run", "--correct-code", "solution.rhai"]);
        assert_eq!(
            cli.command,
            Command::Run {
                input: None,
                correct_code: Some("solution.rhai".to_string()),
            }
        );
        assert_eq!(cli.config_path, Some("cfg.json".to_string()));

        let cli = CliArgs::parse_from(["coderun", "serve"]);
        assert_eq!(cli.command, Command::Serve);
        assert_eq!(cli.config_path, None);
    }
}
