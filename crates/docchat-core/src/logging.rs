//! File logging setup.
//!
//! Logs go to a daily-rotated file under the docchat home, never to
//! stdout/stderr.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter directives.
pub const LOG_ENV: &str = "DOCCHAT_LOG";
const DEFAULT_FILTER: &str = "info";
const LOG_FILE_PREFIX: &str = "docchat.log";

/// Builds the filter from `DOCCHAT_LOG`, falling back to `info`.
pub fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Installs the global subscriber writing to `logs_dir`.
///
/// The returned guard flushes buffered lines when dropped; keep it alive for
/// the lifetime of the process.
///
/// # Errors
/// Returns an error if the log directory cannot be created or a global
/// subscriber is already installed.
pub fn init(logs_dir: &Path) -> Result<WorkerGuard> {
    fs::create_dir_all(logs_dir)
        .with_context(|| format!("Failed to create log directory {}", logs_dir.display()))?;

    let appender = tracing_appender::rolling::daily(logs_dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter())
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {e}"))?;

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn test_init_creates_log_dir() {
        let dir = tempdir().unwrap();
        let logs = dir.path().join("nested").join("logs");
        let guard = init(&logs);
        assert!(logs.is_dir());
        // A second subscriber cannot be installed in the same process.
        if guard.is_ok() {
            assert!(init(&logs).is_err());
        }
    }
}
