//! Shared fixtures for integration tests
//!
//! A [`Fixture`] is a temporary standalone workdir:
//!
//! ```text
//! {workdir}/input/STATIONS
//! {workdir}/input/sources/CMTSOLUTION_{source}
//! {workdir}/input/synthetics/{source}/NZ.{STA}.BX?.semd
//! {workdir}/input/waveforms/{source}/NZ.{STA}.HH?.semd
//! ```
//!
//! Collaborators are in-process mocks whose behavior is keyed on station and
//! component names.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;

use flowa::archive::Archive;
use flowa::config::{PathStructureKind, RunConfig};
use flowa::models::Window;
use flowa::services::gatherer::GatherSources;
use flowa::services::{
    MisfitMeasurement, MisfitQuantifier, MisfitRequest, PassthroughPreprocessor, ReportPlotter,
    ServiceError, ServiceResult, Services, WindowPicker, WindowRequest, WindowSelection,
};

pub const STATIONS: &str = "\
BFZ NZ -40.6796 176.2462 283.0 0.0
KNZ NZ -39.0213 177.6737 95.0 0.0
";

/// Synthetic samples per component
pub const SYNTHETIC_NPTS: usize = 600;
pub const DT: f64 = 0.05;
/// Synthetics start this many seconds after the origin
pub const SYNTHETIC_START: f64 = -20.0;

pub fn cmtsolution(event_name: &str) -> String {
    format!(
        "\
 PDE 2018 02 18 07 43 48.00 -40.0000 176.0000  20.0 4.2 4.2 NEW ZEALAND
event name:     {}
time shift:      0.0000
half duration:   0.6000
latitude:      -39.9490
longitude:     176.2995
depth:          20.5900
Mrr:       -2.479380e+22
Mtt:        1.050640e+23
Mpp:       -8.026830e+22
Mrt:        1.184060e+22
Mrp:        1.065860e+22
Mtp:        3.321810e+22
",
        event_name
    )
}

/// Write a `time amplitude` file starting at `t0` seconds after the origin
pub fn write_trace(dir: &Path, name: &str, t0: f64, npts: usize) {
    std::fs::create_dir_all(dir).unwrap();
    let body: String = (0..npts)
        .map(|i| {
            let t = t0 + i as f64 * DT;
            format!("{:.4} {:.6}\n", t, (t * 0.7).sin())
        })
        .collect();
    std::fs::write(dir.join(name), body).unwrap();
}

pub struct Fixture {
    pub dir: tempfile::TempDir,
    pub config: RunConfig,
}

impl Fixture {
    /// Workdir with the given sources, each with data for the listed stations
    pub fn new(events: &[(&str, &[&str])]) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let workdir = dir.path();
        let input = workdir.join("input");
        std::fs::create_dir_all(input.join("sources")).unwrap();
        std::fs::write(input.join("STATIONS"), STATIONS).unwrap();

        for (source, stations) in events {
            std::fs::write(
                input.join("sources").join(format!("CMTSOLUTION_{}", source)),
                cmtsolution(source),
            )
            .unwrap();
            for station in stations.iter() {
                add_station_data(workdir, source, station);
            }
        }

        let mut config = RunConfig::default();
        config.paths.structure = PathStructureKind::Standalone;
        config.paths.workdir = workdir.to_path_buf();
        config.processing.pad_length_s = 0.0;
        config.logging.console_level = "off".to_string();

        Self { dir, config }
    }

    pub fn workdir(&self) -> &Path {
        self.dir.path()
    }

    pub fn adj_dir(&self, source: &str) -> PathBuf {
        self.workdir().join("adjsrcs").join(source)
    }

    pub fn event_file(&self, source: &str) -> PathBuf {
        self.workdir()
            .join("input")
            .join("sources")
            .join(format!("CMTSOLUTION_{}", source))
    }

    /// Gather sources pointing at the fixture's input tree
    pub fn gather_sources(&self, source: &str, archive: Option<Arc<Archive>>) -> GatherSources {
        let input = self.workdir().join("input");
        GatherSources {
            event_id: source.to_string(),
            event_file: Some(self.event_file(source)),
            stations_file: Some(input.join("STATIONS")),
            responses: vec![input.join("responses")],
            waveforms: vec![input.join("waveforms").join(source)],
            synthetics: vec![input.join("synthetics").join(source)],
            archive,
            client: None,
            model: self.config.model_tag(),
            step: self.config.step_tag(),
            pad_length_s: 0.0,
        }
    }
}

/// Three-component synthetics and observations for one station
pub fn add_station_data(workdir: &Path, source: &str, station: &str) {
    let input = workdir.join("input");
    for c in ["N", "E", "Z"] {
        write_trace(
            &input.join("synthetics").join(source),
            &format!("NZ.{}.BX{}.semd", station, c),
            SYNTHETIC_START,
            SYNTHETIC_NPTS,
        );
        // Observations start earlier and end later than the synthetics
        write_trace(
            &input.join("waveforms").join(source),
            &format!("NZ.{}.HH{}.semd", station, c),
            SYNTHETIC_START - 10.0,
            SYNTHETIC_NPTS + 400,
        );
    }
}

pub fn window(left: usize, right: usize) -> Window {
    Window {
        left,
        right,
        cc_shift: 2,
        dlna: 0.1,
        max_cc_value: 0.95,
        weight: 1.0,
    }
}

/// Picks one window on the listed components
#[derive(Debug, Clone, Default)]
pub struct MockPicker {
    pub components: Vec<String>,
    /// Stations that never get windows
    pub empty_stations: Vec<String>,
    /// Stations whose selection panics
    pub panic_stations: Vec<String>,
}

impl MockPicker {
    pub fn on(components: &[&str]) -> Self {
        Self {
            components: components.iter().map(|c| c.to_string()).collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl WindowPicker for MockPicker {
    async fn select_windows(&self, request: &WindowRequest) -> ServiceResult<WindowSelection> {
        let station = &request.observed.station;
        if self.panic_stations.contains(station) {
            panic!("window selection blew up on {}", station);
        }
        if self.empty_stations.contains(station) || !self.components.contains(&request.component) {
            return Ok(WindowSelection::default());
        }
        Ok(WindowSelection {
            windows: vec![window(10, 100)],
            stalta: vec![0.0; request.synthetic.data.len()],
        })
    }
}

/// Fixed misfit per measured component
#[derive(Debug, Clone)]
pub struct MockMisfit {
    pub misfit: f64,
    /// Stations whose measurement fails unexpectedly
    pub unexpected_stations: Vec<String>,
}

impl MockMisfit {
    pub fn new(misfit: f64) -> Self {
        Self {
            misfit,
            unexpected_stations: Vec::new(),
        }
    }
}

#[async_trait]
impl MisfitQuantifier for MockMisfit {
    async fn calculate(&self, request: &MisfitRequest) -> ServiceResult<MisfitMeasurement> {
        let station = &request.synthetic.station;
        if self.unexpected_stations.contains(station) {
            return Err(ServiceError::Unexpected(anyhow::anyhow!(
                "measurement library crashed on {}",
                station
            )));
        }
        let adjoint_source = (0..request.synthetic.data.len())
            .map(|i| if (10..=100).contains(&i) { 1.0 } else { 0.0 })
            .collect();
        Ok(MisfitMeasurement {
            adjoint_source,
            misfit: self.misfit,
        })
    }
}

pub fn services(picker: MockPicker, misfit: MockMisfit) -> Services {
    Services {
        preprocessor: Arc::new(PassthroughPreprocessor),
        window_picker: Arc::new(picker),
        misfit: Arc::new(misfit),
        plotter: Arc::new(ReportPlotter),
    }
}

/// Files in `dir` with the given extension, sorted by name
pub fn files_with_extension(dir: &Path, extension: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(extension))
        .collect();
    files.sort();
    files
}
