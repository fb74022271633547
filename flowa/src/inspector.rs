//! Misfit and window statistics across event archives
//!
//! Reads every `*.db` archive in a datasets directory and aggregates the
//! stored misfit windows and adjoint sources per evaluation (`m00s00`):
//! - per station: window count and misfit scaled by its own windows
//! - per event: window count, raw misfit and scaled event misfit
//! - per evaluation: totals over events and the mean event misfit

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::archive::{AdjointRecord, Archive, ADJOINT_SOURCES, MISFIT_WINDOWS};
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StationSummary {
    pub windows: usize,
    pub raw_misfit: f64,
    /// `raw_misfit / (2 * windows)`, `None` without windows
    pub misfit: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventSummary {
    pub windows: usize,
    pub raw_misfit: f64,
    pub misfit: Option<f64>,
    pub stations: BTreeMap<String, StationSummary>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EvaluationSummary {
    pub events: usize,
    pub stations: usize,
    pub windows: usize,
    /// Mean of the event misfits that have a value
    pub misfit: Option<f64>,
}

/// Everything collected from one datasets directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Inspection {
    /// Evaluation tag → event id → event summary
    pub events: BTreeMap<String, BTreeMap<String, EventSummary>>,
    pub evaluations: BTreeMap<String, EvaluationSummary>,
}

impl Inspection {
    /// Scan `datasets` for archives; unreadable archives are skipped
    pub async fn collect(datasets: &Path) -> Result<Self> {
        let mut files: Vec<_> = std::fs::read_dir(datasets)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some("db"))
            .collect();
        files.sort();

        let mut inspection = Inspection::default();
        for file in files {
            let Some(event_id) = file.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            match Archive::open(&file).await {
                Ok(archive) => {
                    let result = inspection.add_archive(&event_id, &archive).await;
                    archive.close().await;
                    if let Err(e) = result {
                        warn!("Skipping {}: {}", file.display(), e);
                    }
                }
                Err(e) => warn!("Skipping {}: {}", file.display(), e),
            }
        }
        inspection.summarize();
        Ok(inspection)
    }

    async fn add_archive(&mut self, event_id: &str, archive: &Archive) -> Result<()> {
        for entry in archive.list_auxiliary(MISFIT_WINDOWS).await? {
            let station = self.station_entry(&entry.model, &entry.step, event_id, &entry.network, &entry.station);
            station.windows += 1;
        }
        for entry in archive.list_auxiliary(ADJOINT_SOURCES).await? {
            let record: AdjointRecord = serde_json::from_value(entry.payload)?;
            let station = self.station_entry(&entry.model, &entry.step, event_id, &entry.network, &entry.station);
            station.raw_misfit += record.misfit;
        }
        debug!(event = %event_id, "Inspected archive");
        Ok(())
    }

    fn station_entry(
        &mut self,
        model: &str,
        step: &str,
        event_id: &str,
        network: &str,
        station: &str,
    ) -> &mut StationSummary {
        self.events
            .entry(format!("{}{}", model, step))
            .or_default()
            .entry(event_id.to_string())
            .or_default()
            .stations
            .entry(format!("{}.{}", network, station))
            .or_default()
    }

    fn summarize(&mut self) {
        self.evaluations.clear();
        for (evaluation, events) in self.events.iter_mut() {
            let mut summary = EvaluationSummary::default();
            let mut event_misfits = Vec::new();

            for event in events.values_mut() {
                event.windows = 0;
                event.raw_misfit = 0.0;
                for station in event.stations.values_mut() {
                    station.misfit = scaled(station.raw_misfit, station.windows);
                    event.windows += station.windows;
                    event.raw_misfit += station.raw_misfit;
                }
                event.misfit = scaled(event.raw_misfit, event.windows);
                event_misfits.extend(event.misfit);

                summary.events += 1;
                summary.stations += event.stations.len();
                summary.windows += event.windows;
            }

            if !event_misfits.is_empty() {
                summary.misfit = Some(event_misfits.iter().sum::<f64>() / event_misfits.len() as f64);
            }
            self.evaluations.insert(evaluation.clone(), summary);
        }
    }

    /// Write as pretty JSON
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

fn scaled(raw_misfit: f64, windows: usize) -> Option<f64> {
    (windows > 0).then(|| 0.5 * raw_misfit / windows as f64)
}
