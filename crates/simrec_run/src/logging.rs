//! Tracing setup for a worker process.
//!
//! Every worker logs to stdout. The leader additionally appends to the run
//! log file without ANSI colours. `RUST_LOG` overrides the configured level.

use crate::config::LogLevel;
use crate::error::{RunError, RunResult};
use simrec_core::Worker;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Mutex;
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Builds the subscriber of one worker: stdout for everyone plus the run
/// log file for the leader.
///
/// [`Driver::run`](crate::Driver::run) installs it as the thread's default
/// for the length of the run, so each in-process worker keeps its own.
pub fn run_subscriber(
    worker: &Worker,
    log_file: Option<&Path>,
    level: LogLevel,
) -> RunResult<impl Subscriber + Send + Sync + 'static> {
    let file_layer = match log_file.filter(|_| worker.is_leader()) {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .map_err(|source| RunError::LogFile {
                    path: path.to_path_buf(),
                    source,
                })?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    Ok(tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(level.as_filter_str())),
        )
        .with(tracing_subscriber::fmt::layer())
        .with(file_layer))
}

/// Installs [`run_subscriber`] as the global subscriber.
///
/// Returns `false` when a subscriber was already installed (a second run in
/// the same process, or tests); the existing one is kept.
pub fn init_tracing(worker: &Worker, log_file: Option<&Path>, level: LogLevel) -> RunResult<bool> {
    Ok(run_subscriber(worker, log_file, level)?.try_init().is_ok())
}

/// Logs `message` once per group, from the leader, with a wall-clock stamp.
pub fn leader_milestone(worker: &Worker, message: &str) {
    if worker.is_leader() {
        let now = chrono::Local::now().format("%Y-%m-%d %H:%M:%S");
        tracing::info!(wall_clock = %now, "{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_non_leader_does_not_touch_log_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let worker = Worker::new(1, 2).unwrap();

        init_tracing(&worker, Some(&path), LogLevel::Info).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_leader_opens_log_file_and_repeat_init_is_harmless() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let worker = Worker::solo();

        init_tracing(&worker, Some(&path), LogLevel::Debug).unwrap();
        assert!(path.exists());
        assert!(!init_tracing(&worker, None, LogLevel::Info).unwrap());
        leader_milestone(&worker, "milestone reached");
    }

    #[test]
    fn test_scoped_subscriber_writes_leader_log() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.txt");
        let worker = Worker::solo();

        let subscriber = run_subscriber(&worker, Some(&path), LogLevel::Info).unwrap();
        tracing::subscriber::with_default(subscriber, || {
            leader_milestone(&worker, "scoped milestone");
        });

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("scoped milestone"));
        assert!(!text.contains('\u{1b}'));
    }

    #[test]
    fn test_unopenable_log_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("missing/dir/log.txt");
        assert!(matches!(
            init_tracing(&Worker::solo(), Some(&path), LogLevel::Info),
            Err(RunError::LogFile { .. })
        ));
    }
}
