//! Per-event run statistics

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Counters accumulated while processing one event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub source: String,
    /// Stations where processing was attempted
    pub stations: usize,
    /// Stations that produced adjoint sources
    pub processed: usize,
    pub windows: usize,
    /// Sum of the raw station misfits
    pub raw_misfit: f64,
    /// Stations that failed with an uncategorized error
    pub exceptions: usize,
    /// Per-station plot artifacts, in processing order
    #[serde(default)]
    pub plots: Vec<PathBuf>,
}

impl RunStats {
    pub fn new(source: &str) -> Self {
        Self {
            source: source.to_string(),
            ..Default::default()
        }
    }

    /// Account for one successfully processed station
    pub fn record_station(&mut self, misfit: f64, windows: usize, plot: Option<PathBuf>) {
        self.processed += 1;
        self.raw_misfit += misfit;
        self.windows += windows;
        self.plots.extend(plot);
    }

    /// Event misfit of Tape et al. (2010), eq. 6: `0.5 * raw / windows`
    ///
    /// `None` when nothing was processed, so that "no result" is never
    /// confused with a computed zero.
    pub fn scaled_misfit(&self) -> Option<f64> {
        if self.processed == 0 || self.windows == 0 {
            return None;
        }
        Some(0.5 * self.raw_misfit / self.windows as f64)
    }

    /// Multi-line summary for the end of the event log
    pub fn summary(&self) -> String {
        let rule = "=".repeat(80);
        format!(
            "\n{rule}\n\nSUMMARY\n\n{rule}\n\
             SOURCE NAME: {}\n\
             STATIONS: {} / {}\n\
             WINDOWS: {}\n\
             RAW MISFIT: {:.2}\n\
             UNEXPECTED ERRORS: {}",
            self.source, self.processed, self.stations, self.windows, self.raw_misfit, self.exceptions
        )
    }
}
