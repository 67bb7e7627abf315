use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_core::LevelFilter;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::error::DeployError;

const DEFAULT_MAX_LOG_FILES: usize = 5;
const LOG_FILE_PREFIX: &str = "couch-deploy";

/// Emit an event at the agent's CRITICAL severity.
///
/// tracing has no level above ERROR, so critical events are ERROR events
/// tagged with `severity = "critical"`.
#[macro_export]
macro_rules! critical {
    ($($arg:tt)+) => {
        ::tracing::error!(severity = "critical", $($arg)+)
    };
}

/// Log level as written in the configuration file.
///
/// Accepts DEBUG, INFO, WARNING, ERROR and CRITICAL in any case. Anything
/// else falls back to INFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(from = "String")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl From<String> for LogLevel {
    fn from(value: String) -> Self {
        match value.to_ascii_uppercase().as_str() {
            "DEBUG" => LogLevel::Debug,
            "WARNING" | "WARN" => LogLevel::Warning,
            "ERROR" => LogLevel::Error,
            "CRITICAL" => LogLevel::Critical,
            _ => LogLevel::Info,
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warning => LevelFilter::WARN,
            // CRITICAL events are ERROR events, see `critical!`
            LogLevel::Error | LogLevel::Critical => LevelFilter::ERROR,
        }
    }
}

pub struct FileLogger {
    log_directory: PathBuf,
    max_files: usize,
    rotation: Rotation,
}

impl FileLogger {
    pub fn new(log_directory: impl Into<PathBuf>) -> Self {
        Self {
            log_directory: log_directory.into(),
            max_files: DEFAULT_MAX_LOG_FILES,
            rotation: Rotation::DAILY,
        }
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = max_files;
        self
    }

    pub fn with_rotation(mut self, rotation: Rotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn setup_file_logging(
        &self,
    ) -> Result<
        (
            tracing_appender::non_blocking::NonBlocking,
            tracing_appender::non_blocking::WorkerGuard,
        ),
        DeployError,
    > {
        // Ensure log directory exists
        std::fs::create_dir_all(&self.log_directory)?;

        let file_appender = RollingFileAppender::builder()
            .rotation(self.rotation.clone())
            .filename_prefix(LOG_FILE_PREFIX)
            .filename_suffix("log")
            .max_log_files(self.max_files)
            .build(&self.log_directory)
            .map_err(|e| DeployError::LoggingError(e.to_string()))?;

        Ok(tracing_appender::non_blocking(file_appender))
    }
}

/// Install the global subscriber: console output, plus a rolling log file
/// when `log_dir` is set. `RUST_LOG` takes precedence over `level`.
///
/// The returned guard flushes the file writer on drop and must be kept alive
/// for as long as the process logs.
pub fn setup_logging(
    level: LogLevel,
    log_dir: Option<&Path>,
) -> Result<Option<WorkerGuard>, DeployError> {
    let default_filter: LevelFilter = level.into();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter.to_string()));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let (writer, guard) = FileLogger::new(dir).setup_file_logging()?;
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false); // Disable ANSI colors for file logs
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer()) // Console output
        .with(file_layer)
        .try_init()
        .map_err(|e| DeployError::LoggingError(e.to_string()))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn log_level_parses_case_insensitively() {
        assert_eq!(LogLevel::from("debug".to_string()), LogLevel::Debug);
        assert_eq!(LogLevel::from("WARNING".to_string()), LogLevel::Warning);
        assert_eq!(LogLevel::from("Critical".to_string()), LogLevel::Critical);
    }

    #[test]
    fn unknown_log_level_falls_back_to_info() {
        assert_eq!(LogLevel::from("verbose".to_string()), LogLevel::Info);
        assert_eq!(LogLevel::from(String::new()), LogLevel::Info);
    }

    #[test]
    fn critical_maps_to_error_filter() {
        assert_eq!(LevelFilter::from(LogLevel::Critical), LevelFilter::ERROR);
        assert_eq!(LevelFilter::from(LogLevel::Warning), LevelFilter::WARN);
    }

    #[test]
    fn file_logger_creates_missing_directory() {
        let root = tempdir().unwrap();
        let dir = root.path().join("nested").join("logs");

        let (_writer, _guard) = FileLogger::new(&dir)
            .with_max_files(2)
            .with_rotation(Rotation::NEVER)
            .setup_file_logging()
            .unwrap();

        assert!(dir.is_dir());
    }
}
