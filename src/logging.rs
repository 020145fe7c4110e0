use std::fs;
use std::path::Path;
use std::sync::Once;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::{FleetError, Result};

static INIT: Once = Once::new();

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs the global subscriber: a console layer and, when a directory is
/// configured, a JSON layer writing to a daily rolling file.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the life of the process. Calling this more than once is a no-op.
pub fn init(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let mut guard = None;
    let mut outcome: Result<()> = Ok(());

    INIT.call_once(|| {
        outcome = install(config).map(|g| guard = g);
    });

    outcome.map(|_| guard)
}

fn install(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let console = fmt::Layer::new()
        .with_target(true)
        .with_thread_ids(true)
        .with_ansi(true)
        .with_filter(filter(&config.level));

    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            cleanup_old_logs(dir, &config.file_prefix, config.files_to_keep);

            let appender = tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix(&config.file_prefix)
                .filename_suffix("log")
                .build(dir)
                .map_err(|e| FleetError::config(format!("Failed to create log file: {}", e)))?;
            let (writer, guard) = tracing_appender::non_blocking(appender);

            let layer = fmt::Layer::new()
                .json()
                .with_writer(writer)
                .with_file(true)
                .with_line_number(true)
                .with_thread_ids(true)
                .with_target(true)
                .with_ansi(false)
                .with_filter(filter(&config.level));
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| FleetError::internal(format!("Failed to set tracing subscriber: {}", e)))?;

    // Route `log` records from dependencies through tracing as well
    if let Err(e) = tracing_log::LogTracer::init() {
        tracing::debug!(error = %e, "log bridge not installed, a logger is already set");
    }

    Ok(guard)
}

/// Keeps the newest `keep` log files with the given prefix.
pub fn cleanup_old_logs(log_dir: &Path, prefix: &str, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };
    let mut log_files: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            let path = entry.path();
            let is_log = path.extension().map(|ext| ext == "log").unwrap_or(false);
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(prefix))
                .unwrap_or(false);
            is_log && matches
        })
        .collect();

    // Newest first
    log_files.sort_by_key(|entry| {
        std::cmp::Reverse(
            entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        )
    });

    let mut removed = 0;
    for old_file in log_files.iter().skip(keep) {
        if fs::remove_file(old_file.path()).is_ok() {
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_keeps_newest_matching_files() {
        let dir = tempfile::tempdir().unwrap();
        for day in 1..=5 {
            let path = dir.path().join(format!("fleet.2026-01-0{}.log", day));
            fs::write(&path, "{}").unwrap();
            let mtime = std::time::SystemTime::UNIX_EPOCH
                + std::time::Duration::from_secs(1_700_000_000 + day * 86_400);
            fs::File::options()
                .write(true)
                .open(&path)
                .unwrap()
                .set_modified(mtime)
                .unwrap();
        }
        fs::write(dir.path().join("other.log"), "").unwrap();
        fs::write(dir.path().join("fleet.yml"), "").unwrap();

        let removed = cleanup_old_logs(dir.path(), "fleet", 2);
        assert_eq!(removed, 3);
        assert!(dir.path().join("fleet.2026-01-05.log").exists());
        assert!(dir.path().join("fleet.2026-01-04.log").exists());
        assert!(!dir.path().join("fleet.2026-01-01.log").exists());
        assert!(dir.path().join("other.log").exists());
        assert!(dir.path().join("fleet.yml").exists());
    }

    #[test]
    fn repeated_init_is_a_no_op() {
        let config = LoggingConfig::default();
        assert!(init(&config).unwrap().is_none());
        assert!(init(&config).unwrap().is_none());
        tracing::info!("still routed after a second init");
    }

    #[test]
    fn missing_directory_removes_nothing() {
        assert_eq!(cleanup_old_logs(Path::new("/nonexistent/logs"), "fleet", 1), 0);
    }
}
