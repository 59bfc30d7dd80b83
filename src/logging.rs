use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

/// Configuration for the logging system.
pub struct LogConfig {
    pub log_dir: PathBuf,
    pub file_prefix: String,
    pub max_files: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        let log_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("filechunk-pro")
            .join("logs");

        Self {
            log_dir,
            file_prefix: "filechunk-pro".to_string(),
            max_files: 5,
        }
    }
}

/// Initializes file + stdout logging.
///
/// # Log targets
/// - `plan`, `digest`, `gate`, `retry`, `protocol`, `scheduler`, `queue`,
///   `engine` — one per core component.
///
/// # Example
/// ```bash
/// RUST_LOG=scheduler=debug,gate=trace cargo run
/// ```
pub fn init_logging(config: LogConfig) -> Result<LogGuard> {
    std::fs::create_dir_all(&config.log_dir).context("failed to create log directory")?;

    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix(&config.file_prefix)
        .filename_suffix("log")
        .max_log_files(config.max_files)
        .build(&config.log_dir)
        .context("failed to create file appender")?;

    // IMPORTANT: the guard must be kept alive for the entire engine lifetime.
    let (non_blocking_file, worker_guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let file_layer = fmt::layer()
        .json()
        .with_writer(non_blocking_file)
        .with_target(true)
        .with_thread_ids(true)
        .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
        .with_filter(env_filter.clone());

    let stdout_layer = fmt::layer()
        .compact()
        .with_target(true)
        .with_line_number(true)
        .with_ansi(true)
        .with_filter(env_filter);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stdout_layer)
        .init();

    tracing::info!(
        target: "engine",
        log_dir = %config.log_dir.display(),
        max_files = config.max_files,
        "logging system initialized"
    );

    Ok(LogGuard {
        _worker_guard: worker_guard,
    })
}

/// Keeps the non-blocking writer's worker thread alive; drop this last.
pub struct LogGuard {
    _worker_guard: tracing_appender::non_blocking::WorkerGuard,
}

impl Drop for LogGuard {
    fn drop(&mut self) {
        tracing::info!(target: "engine", "flushing logs before shutdown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_log_config_uses_crate_prefix() {
        let config = LogConfig::default();
        assert_eq!(config.file_prefix, "filechunk-pro");
        assert_eq!(config.max_files, 5);
    }

    #[test]
    fn log_directory_is_created() {
        let temp_dir = std::env::temp_dir().join("filechunk_pro_test_logs");
        let config = LogConfig {
            log_dir: temp_dir.clone(),
            file_prefix: "test".to_string(),
            max_files: 3,
        };

        let result = init_logging(config);
        assert!(result.is_ok());
        assert!(temp_dir.exists());

        let _guard = result.unwrap();
        let _ = std::fs::remove_dir_all(temp_dir);
    }
}
