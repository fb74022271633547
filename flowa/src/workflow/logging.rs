//! Event-scoped logging
//!
//! Each event gets its own subscriber: a plain-text file at the configured
//! level plus console output at the console level. The subscriber is attached
//! to the event's future with `WithSubscriber` instead of being installed
//! globally, so concurrent or repeated events in one process never share or
//! duplicate a sink. Dropping the [`EventLog`] closes the file.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::Dispatch;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, Layer};

use flowa_common::config::LoggingConfig;

use crate::error::Result;

pub struct EventLog {
    path: PathBuf,
    dispatch: Dispatch,
}

impl EventLog {
    /// Create (truncating) the log file and build the event's subscriber
    pub fn create(path: &Path, config: &LoggingConfig) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::File::create(path)?;

        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(Mutex::new(file))
            .with_filter(level_filter(&config.level));
        let console_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_filter(level_filter(&config.console_level));

        let subscriber = tracing_subscriber::registry()
            .with(file_layer)
            .with(console_layer);

        Ok(Self {
            path: path.to_path_buf(),
            dispatch: Dispatch::new(subscriber),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Handle to attach to the event's future
    pub fn dispatch(&self) -> Dispatch {
        self.dispatch.clone()
    }
}

fn level_filter(level: &str) -> LevelFilter {
    level.parse().unwrap_or(LevelFilter::INFO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::instrument::WithSubscriber;

    fn config(level: &str) -> LoggingConfig {
        LoggingConfig {
            level: level.to_string(),
            console_level: "off".to_string(),
        }
    }

    #[tokio::test]
    async fn test_events_go_to_their_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = EventLog::create(&dir.path().join("a.log"), &config("debug")).unwrap();
        let b = EventLog::create(&dir.path().join("b.log"), &config("warn")).unwrap();

        async { tracing::info!("hello from a") }
            .with_subscriber(a.dispatch())
            .await;
        async {
            tracing::info!("quiet in b");
            tracing::warn!("loud in b");
        }
        .with_subscriber(b.dispatch())
        .await;
        drop((a, b));

        let a_text = std::fs::read_to_string(dir.path().join("a.log")).unwrap();
        let b_text = std::fs::read_to_string(dir.path().join("b.log")).unwrap();
        assert!(a_text.contains("hello from a"));
        assert!(!a_text.contains("loud in b"));
        assert!(!b_text.contains("quiet in b"));
        assert!(b_text.contains("loud in b"));
    }

    #[test]
    fn test_recreate_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ev.log");
        std::fs::write(&path, "old run\n").unwrap();
        let log = EventLog::create(&path, &config("info")).unwrap();
        tracing::dispatcher::with_default(&log.dispatch(), || tracing::info!("new run"));
        drop(log);

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(!text.contains("old run"));
        assert_eq!(text.matches("new run").count(), 1);
    }
}
