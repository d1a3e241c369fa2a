//! Structured logging with rotation and run correlation.
//!
//! Dual output (console + daily-rotating file), pretty or JSON format,
//! and a UUID run id stamped on the root span so every line of a run can
//! be correlated after the fact.
//!
//! Environment variables:
//! - LOG_FORMAT=pretty|json (default: pretty)
//! - LOG_DIR=/path/to/logs (default: ./logs)
//! - RUN_ID=<uuid> (default: auto-generated)
//! - RUST_LOG=level (default: info)

use std::io;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match std::env::var("LOG_FORMAT")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            _ => LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub format: LogFormat,
    pub log_dir: String,
    pub run_id: Uuid,
    pub filter: String,
}

impl LogConfig {
    pub fn from_env() -> Self {
        Self {
            format: LogFormat::from_env(),
            log_dir: std::env::var("LOG_DIR").unwrap_or_else(|_| "./logs".to_string()),
            run_id: run_id(),
            filter: std::env::var("RUST_LOG").unwrap_or_else(|_| {
                "info,cross_venue_arbitrage=info,hyper=warn,reqwest=warn".to_string()
            }),
        }
    }
}

/// Initialize logging. The returned guard must be kept alive for the
/// program lifetime so the non-blocking file writer flushes before exit.
pub fn init_logging() -> WorkerGuard {
    let config = LogConfig::from_env();

    if let Err(e) = std::fs::create_dir_all(&config.log_dir) {
        eprintln!("Failed to create log directory: {}", e);
    }

    let file_appender = tracing_appender::rolling::daily(&config.log_dir, "arb_engine.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    match config.format {
        LogFormat::Pretty => {
            let console_layer = fmt::layer()
                .with_writer(io::stdout)
                .with_target(false)
                .with_ansi(true)
                .compact()
                .with_filter(env_filter.clone());

            let file_layer = fmt::layer()
                .with_writer(non_blocking_file)
                .with_target(true)
                .with_line_number(true)
                .with_ansi(false)
                .compact()
                .with_filter(env_filter);

            tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer)
                .init();
        }
        LogFormat::Json => {
            let console_layer = fmt::layer()
                .with_writer(io::stdout)
                .with_ansi(false)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .with_filter(env_filter.clone());

            let file_layer = fmt::layer()
                .with_writer(non_blocking_file)
                .with_ansi(false)
                .json()
                .flatten_event(true)
                .with_current_span(true)
                .with_span_list(false)
                .with_filter(env_filter);

            tracing_subscriber::registry()
                .with(console_layer)
                .with(file_layer)
                .init();
        }
    }

    tracing::info!(
        run_id = %config.run_id,
        log_format = ?config.format,
        log_dir = %config.log_dir,
        "Logging initialized"
    );

    guard
}

/// Run id from the environment, or a fresh UUID.
pub fn run_id() -> Uuid {
    std::env::var("RUN_ID")
        .ok()
        .and_then(|s| Uuid::parse_str(&s).ok())
        .unwrap_or_else(Uuid::new_v4)
}
