pub mod config;
pub mod conflict;
pub mod db;
pub mod demo;
pub mod errors;
pub mod grid;
pub mod journal;
pub mod models;
pub mod notify;
pub mod recency;
pub mod reconciler;
pub mod service;

use crate::config::ServiceConfig;
use crate::errors::{AppError, AppResult};
use crate::service::TimetableService;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing_appender::non_blocking::WorkerGuard;

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

/// Opens the service described by `config`, installing logging first.
pub fn bootstrap(config: ServiceConfig) -> AppResult<Arc<TimetableService>> {
    config.validate()?;
    let log_dir = config.log_to_file.then(|| config.log_dir());
    if let Err(error) = init_tracing(log_dir.as_deref(), &config.log_filter) {
        eprintln!("failed to initialize tracing: {}", error);
    }

    let service = TimetableService::new(config)?;
    tracing::info!(
        database = %service.config().database_path().display(),
        "timetable service ready"
    );
    Ok(service)
}

/// JSON logs filtered by `RUST_LOG`, falling back to `filter`. With a log
/// directory the output goes to a daily rolling file, otherwise to stderr.
pub fn init_tracing(log_dir: Option<&Path>, filter: &str) -> AppResult<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));

    match log_dir {
        Some(log_dir) => {
            std::fs::create_dir_all(log_dir)?;
            let file_appender = tracing_appender::rolling::daily(log_dir, "timetable.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = LOG_GUARD.set(guard);

            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .json()
                .with_writer(non_blocking)
                .try_init()
                .map_err(|error| AppError::Internal(error.to_string()))
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .json()
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|error| AppError::Internal(error.to_string())),
    }
}
