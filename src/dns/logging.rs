//! Logging setup
//!
//! The library itself only talks to the `log` facade. Binaries call
//! `StructuredLogger::init` once at startup, which installs a `tracing`
//! subscriber that also picks up `log` records, either as human readable
//! lines or as JSON. `RUST_LOG` overrides the configured level.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }
}

impl LogLevel {
    /// Level for a `-v` count: warnings by default, then info, debug, trace
    pub fn from_verbosity(verbose: u8) -> LogLevel {
        match verbose {
            0 => LogLevel::Warn,
            1 => LogLevel::Info,
            2 => LogLevel::Debug,
            _ => LogLevel::Trace,
        }
    }

    fn directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggerConfig {
    pub level: LogLevel,
    pub json_format: bool,
    pub console_output: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Warn,
            json_format: false,
            console_output: true,
        }
    }
}

/// Outcome of one lookup, as recorded in the log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupLog {
    pub name: String,
    pub query_type: String,
    pub outcome: String,
    pub answers: usize,
    pub elapsed_ms: u64,
}

impl LookupLog {
    pub fn new(name: &str, query_type: &str, outcome: &str, answers: usize, elapsed: Duration) -> LookupLog {
        LookupLog {
            name: name.to_string(),
            query_type: query_type.to_string(),
            outcome: outcome.to_string(),
            answers,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

pub struct StructuredLogger {
    config: LoggerConfig,
}

impl StructuredLogger {
    pub fn init(config: LoggerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(config.level.directive()))
            .unwrap_or_else(|_| EnvFilter::new("warn"));

        let init_result = if !config.console_output {
            tracing_subscriber::fmt()
                .with_env_filter(EnvFilter::new("off"))
                .try_init()
        } else if config.json_format {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
        } else {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init()
        };

        // a second init, e.g. from tests, keeps the first subscriber
        if let Err(e) = init_result {
            if config.console_output {
                eprintln!("Warning: tracing subscriber already initialized: {}", e);
            }
        }

        Ok(Self { config })
    }

    pub fn config(&self) -> &LoggerConfig {
        &self.config
    }

    pub fn log_lookup(&self, lookup: &LookupLog) {
        if lookup.outcome == "NOERROR" {
            info!(
                name = %lookup.name,
                query_type = %lookup.query_type,
                answers = lookup.answers,
                elapsed_ms = lookup.elapsed_ms,
                "lookup completed"
            );
        } else {
            warn!(
                name = %lookup.name,
                query_type = %lookup.query_type,
                outcome = %lookup.outcome,
                elapsed_ms = lookup.elapsed_ms,
                "lookup failed"
            );
        }
    }
}
