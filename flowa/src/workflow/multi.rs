//! Multi-event processing with one worker process per event
//!
//! The parent re-invokes the `flowa` binary as `flowa worker --source NAME`
//! for each event, at most `max_workers` at a time. A worker processes its
//! event in isolation and prints one [`WorkerReport`] as a JSON line on
//! stdout. A worker that crashes, exits non-zero or prints no report only
//! loses its own event, which is reported with no misfit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::error::{FlowaError, Result};
use crate::workflow::{EventOutcome, RunStats};

/// What a worker process reports back for its event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReport {
    pub source: String,
    pub misfit: Option<f64>,
    #[serde(default)]
    pub stats: Option<RunStats>,
    /// Fatal error that stopped the event
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkerReport {
    pub fn from_outcome(source: &str, outcome: Result<EventOutcome>) -> Self {
        match outcome {
            Ok(outcome) => Self {
                source: source.to_string(),
                misfit: outcome.misfit,
                stats: Some(outcome.stats),
                error: None,
            },
            Err(e) => Self::failed(source, e.to_string()),
        }
    }

    pub fn failed(source: &str, error: String) -> Self {
        Self {
            source: source.to_string(),
            misfit: None,
            stats: None,
            error: Some(error),
        }
    }

    /// Report printed by a worker: the last JSON line of its stdout
    pub fn parse(stdout: &str) -> Option<Self> {
        stdout
            .lines()
            .rev()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .and_then(|l| serde_json::from_str(l).ok())
    }
}

/// Launches and collects worker processes
#[derive(Debug, Clone)]
pub struct WorkerPool {
    program: PathBuf,
    config_path: PathBuf,
    max_workers: usize,
}

impl WorkerPool {
    /// `max_workers` defaults to the available parallelism
    pub fn new(program: PathBuf, config_path: PathBuf, max_workers: Option<usize>) -> Self {
        let max_workers = max_workers
            .or_else(|| std::thread::available_parallelism().ok().map(|n| n.get()))
            .unwrap_or(1)
            .max(1);
        Self {
            program,
            config_path,
            max_workers,
        }
    }

    /// Pool that re-invokes the running executable
    pub fn for_current_exe(config_path: &Path, max_workers: Option<usize>) -> Result<Self> {
        let program = std::env::current_exe()
            .map_err(|e| FlowaError::Worker(format!("Cannot locate own executable: {}", e)))?;
        Ok(Self::new(program, config_path.to_path_buf(), max_workers))
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Run every source in its own worker process
    pub async fn run(&self, sources: &[String]) -> BTreeMap<String, WorkerReport> {
        info!(
            events = sources.len(),
            max_workers = self.max_workers,
            "Starting worker processes"
        );
        let permits = Arc::new(Semaphore::new(self.max_workers));

        let mut in_flight = FuturesUnordered::new();
        for source in sources {
            let permits = Arc::clone(&permits);
            in_flight.push(async move {
                let report = match permits.acquire_owned().await {
                    Ok(_permit) => self.run_worker(source).await,
                    Err(e) => WorkerReport::failed(source, format!("Worker pool closed: {}", e)),
                };
                (source.clone(), report)
            });
        }

        let mut reports = BTreeMap::new();
        while let Some((source, report)) = in_flight.next().await {
            match &report.error {
                Some(e) => warn!(source = %source, "Event failed: {}", e),
                None => info!(source = %source, misfit = ?report.misfit, "Event finished"),
            }
            reports.insert(source, report);
        }
        reports
    }

    /// Source → scaled misfit
    pub async fn run_misfits(&self, sources: &[String]) -> BTreeMap<String, Option<f64>> {
        self.run(sources)
            .await
            .into_iter()
            .map(|(source, report)| (source, report.misfit))
            .collect()
    }

    async fn run_worker(&self, source: &str) -> WorkerReport {
        let output = Command::new(&self.program)
            .arg("--config")
            .arg(&self.config_path)
            .arg("worker")
            .arg("--source")
            .arg(source)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .output()
            .await;

        let output = match output {
            Ok(output) => output,
            Err(e) => {
                return WorkerReport::failed(
                    source,
                    format!("Failed to launch worker {}: {}", self.program.display(), e),
                )
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        match WorkerReport::parse(&stdout) {
            Some(report) if report.source == source => report,
            Some(report) => WorkerReport::failed(
                source,
                format!("Worker reported for '{}' instead", report.source),
            ),
            None => WorkerReport::failed(
                source,
                format!("Worker exited with {} without a report", output.status),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_takes_last_json_line() {
        let line = serde_json::to_string(&WorkerReport::failed("ev1", "boom".into())).unwrap();
        let stdout = format!("noise\n{}\n\n", line);
        let report = WorkerReport::parse(&stdout).unwrap();
        assert_eq!(report.source, "ev1");
        assert_eq!(report.error.as_deref(), Some("boom"));

        assert!(WorkerReport::parse("not json\n").is_none());
        assert!(WorkerReport::parse("").is_none());
    }

    #[test]
    fn test_none_misfit_survives_the_wire() {
        let report = WorkerReport {
            source: "ev1".into(),
            misfit: None,
            stats: Some(RunStats::new("ev1")),
            error: None,
        };
        let line = serde_json::to_string(&report).unwrap();
        assert_eq!(WorkerReport::parse(&line), Some(report));
    }

    #[test]
    fn test_default_worker_count() {
        let pool = WorkerPool::new("flowa".into(), "flowa.toml".into(), None);
        assert!(pool.max_workers() >= 1);
        let pool = WorkerPool::new("flowa".into(), "flowa.toml".into(), Some(0));
        assert_eq!(pool.max_workers(), 1);
    }

    #[tokio::test]
    async fn test_missing_program_fails_only_that_event() {
        let pool = WorkerPool::new(
            "/nonexistent/flowa-worker".into(),
            "flowa.toml".into(),
            Some(2),
        );
        let reports = pool.run(&["ev1".to_string(), "ev2".to_string()]).await;
        assert_eq!(reports.len(), 2);
        assert!(reports.values().all(|r| r.misfit.is_none() && r.error.is_some()));
    }
}
