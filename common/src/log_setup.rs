//! Tracing subscriber setup for binaries and tests.

use std::path::PathBuf;
use std::sync::{Once, OnceLock};

use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();
static TEST_LOG_INIT: Once = Once::new();

#[derive(Debug, thiserror::Error)]
pub enum LogSetupError {
    #[error("Invalid log filter: {0}")]
    InvalidFilter(#[from] tracing_subscriber::filter::ParseError),

    #[error("Failed to create log directory {path:?}: {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to create log file appender: {0}")]
    Appender(#[from] tracing_appender::rolling::InitError),

    #[error("Logging already initialized")]
    AlreadyInitialized,
}

/// Where and how verbosely to log.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Filter used when `RUST_LOG` is unset, e.g. `"info"` or `"tiepoints=debug"`.
    pub base_level: String,
    pub directory: PathBuf,
    pub file_prefix: String,
    /// Rolled files kept on disk.
    pub max_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            base_level: "info".to_string(),
            directory: PathBuf::from("logs"),
            file_prefix: "tiepoints".to_string(),
            max_files: 5,
        }
    }
}

/// Console + daily rolling file logging. `RUST_LOG` overrides `base_level`.
///
/// Warnings and errors also go to stderr.
pub fn setup_logging(config: &LogConfig) -> Result<(), LogSetupError> {
    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.base_level)?,
    };

    std::fs::create_dir_all(&config.directory).map_err(|source| {
        LogSetupError::CreateDirectory {
            path: config.directory.clone(),
            source,
        }
    })?;

    let file_appender = tracing_appender::rolling::Builder::new()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .max_log_files(config.max_files.max(1))
        .build(&config.directory)?;

    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);
    LOG_GUARD
        .set(guard)
        .map_err(|_| LogSetupError::AlreadyInitialized)?;

    let console_writer = std::io::stdout.and(std::io::stderr.with_min_level(Level::WARN));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true)
                .with_writer(console_writer),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_line_number(true)
                .with_file(true)
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .try_init()
        .map_err(|_| LogSetupError::AlreadyInitialized)
}

/// Captured-output logging for tests. Safe to call from every test.
pub fn setup_test_logging() {
    TEST_LOG_INIT.call_once(|| {
        let env_filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

        // Another harness may have installed a global subscriber already.
        let _ = tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}
