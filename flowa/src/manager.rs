//! Per-station processing state machine
//!
//! The Manager drives one station's [`Crate`] forward through
//! gather → preprocess → window → measure → persist. States only move
//! forward; each stage checks its precondition on the current variant and
//! leaves the crate untouched when it fails.
//!
//! | Stage | Needs | On failure |
//! |---|---|---|
//! | gather | nothing | `ManagerError::Gather`, partial inputs kept |
//! | preprocess | both streams | `ManagerError::Preprocess` |
//! | window | preprocessed streams | missing component → empty list |
//! | measure | at least one window | `ManagerError::NoWindows` |
//! | persist | adjoint sources | logged, never propagated |
//!
//! One Manager is reused for every station of an event. [`Manager::reset`]
//! with [`ResetMode::Soft`] clears the crate but keeps the gatherer, and with
//! it the resolved event.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use flowa_common::StationCode;

use crate::archive::{AdjointRecord, AuxRecord, WindowRecord, ADJOINT_SOURCES, MISFIT_WINDOWS};
use crate::config::RunConfig;
use crate::error::{FlowError, ManagerError, Result};
use crate::files::adjoint::{adjoint_file_name, write_adjoint};
use crate::files::band_code;
use crate::files::traces::write_sem;
use crate::models::waveform::{secs_between, trim_to_synthetic};
use crate::models::window::count_windows;
use crate::models::{
    AdjointSource, Crate, GatherSet, Gathered, Preprocessed, Quantified, Stream, WindowSet,
    Windowed,
};
use crate::services::gatherer::{GatherSources, Gatherer};
use crate::services::{
    MisfitRequest, PlotRequest, PreprocessParams, ServiceError, Services, StreamKind,
    WindowRequest,
};

/// What [`Manager::reset`] discards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetMode {
    /// Crate and gatherer; the event is resolved again on the next gather
    Hard,
    /// Crate only
    Soft,
}

type FlowResult<T> = std::result::Result<T, FlowError>;

/// Map a collaborator failure onto the workflow taxonomy
fn categorize(err: ServiceError, category: fn(String) -> ManagerError) -> FlowError {
    match err {
        ServiceError::MissingData(msg) | ServiceError::Rejected(msg) => category(msg).into(),
        ServiceError::Unexpected(e) => FlowError::Unexpected(e),
    }
}

/// Drives one station at a time through the workflow
pub struct Manager {
    config: Arc<RunConfig>,
    services: Services,
    sources: GatherSources,
    gatherer: Option<Gatherer>,
    station: Crate,
    window_parameters: BTreeMap<String, serde_json::Value>,
}

impl Manager {
    pub fn new(config: Arc<RunConfig>, services: Services, sources: GatherSources) -> Self {
        let window_parameters = config
            .processing
            .window_parameters
            .iter()
            .filter_map(|(key, value)| match serde_json::to_value(value) {
                Ok(v) => Some((key.clone(), v)),
                Err(e) => {
                    warn!("Dropping window parameter '{}': {}", key, e);
                    None
                }
            })
            .collect();

        Self {
            config,
            services,
            sources,
            gatherer: None,
            station: Crate::Empty,
            window_parameters,
        }
    }

    /// The current station's working set
    pub fn station(&self) -> &Crate {
        &self.station
    }

    pub fn gatherer(&self) -> Option<&Gatherer> {
        self.gatherer.as_ref()
    }

    pub fn reset(&mut self, mode: ResetMode) {
        self.station = Crate::Empty;
        if mode == ResetMode::Hard {
            self.gatherer = None;
        }
    }

    /// Synthetic and observed traces together, or whichever exists
    pub fn stream(&self) -> Stream {
        match (self.station.synthetic(), self.station.observed()) {
            (Some(syn), Some(obs)) => syn.merged(obs),
            (Some(syn), None) => syn.clone(),
            (None, Some(obs)) => obs.clone(),
            (None, None) => Stream::default(),
        }
    }

    /// Fetch event, station metadata and both streams
    ///
    /// Inputs already present for the same station are not fetched again
    /// unless `overwrite` is set. Partially gathered inputs are kept when one
    /// of them cannot be found.
    pub async fn gather(&mut self, code: &StationCode, overwrite: bool) -> std::result::Result<(), ManagerError> {
        let same_station = self.station.station_code() == Some(code);
        if same_station && !overwrite && self.station.gathered().is_some() {
            debug!(station = %code, "Already gathered");
            return Ok(());
        }

        let mut set = match std::mem::take(&mut self.station) {
            Crate::Gathering(set) if same_station && !overwrite => set,
            _ => GatherSet::new(code.clone()),
        };

        let result = self.fill(&mut set).await;
        self.station = match set.into_gathered() {
            Ok(gathered) => {
                info!(
                    station = %code,
                    observed = gathered.observed.len(),
                    synthetic = gathered.synthetic.len(),
                    "Gathered"
                );
                Crate::Gathered(gathered)
            }
            Err(partial) => Crate::Gathering(partial),
        };
        result
    }

    async fn fill(&mut self, set: &mut GatherSet) -> std::result::Result<(), ManagerError> {
        let sources = &self.sources;
        let gatherer = self
            .gatherer
            .get_or_insert_with(|| Gatherer::new(sources.clone()));
        let code = set.station_code.clone();

        let event = match &set.event {
            Some(event) => Arc::clone(event),
            None => {
                let event = gatherer.gather_event().await?;
                set.event = Some(Arc::clone(&event));
                event
            }
        };
        if set.inventory.is_none() {
            set.inventory = Some(gatherer.gather_station(&code).await?);
        }
        if set.synthetic.is_none() {
            set.synthetic = Some(gatherer.gather_synthetic(&code, event.origin_time).await?);
        }
        if set.observed.is_none() {
            let span = set.synthetic.as_ref().and_then(Stream::span);
            set.observed = Some(
                gatherer
                    .gather_observed(&code, event.origin_time, span)
                    .await?,
            );
        }
        Ok(())
    }

    /// Standardize both streams and bring them onto the synthetic time axis
    pub async fn preprocess(&mut self) -> FlowResult<()> {
        let Crate::Gathered(gathered) = &self.station else {
            return Err(ManagerError::InvalidState(format!(
                "preprocess needs gathered data, crate is {}",
                self.station.stage()
            ))
            .into());
        };
        let gathered = gathered.clone();
        let code = gathered.station_code.clone();

        check_stream_types(&gathered)?;

        let processing = &self.config.processing;
        let back_azimuth = processing
            .rotate_to_rtz
            .then(|| gathered.inventory.back_azimuth(&gathered.event));
        let synthetic_rate = gathered.synthetic.first().map(|t| t.sampling_rate);

        let params = |kind: StreamKind| PreprocessParams {
            kind,
            min_period: processing.min_period,
            max_period: processing.max_period,
            filter_corners: processing.filter_corners,
            pad_length_s: processing.pad_length_s,
            unit_output: processing.unit_output.clone(),
            sampling_rate: match kind {
                StreamKind::Observed => synthetic_rate,
                StreamKind::Synthetic => None,
            },
            back_azimuth,
            inventory: match kind {
                StreamKind::Observed => Some(gathered.inventory.clone()),
                StreamKind::Synthetic => None,
            },
        };

        let preprocessor = &self.services.preprocessor;
        let mut observed = preprocessor
            .preprocess(&gathered.observed, &params(StreamKind::Observed))
            .await
            .map_err(|e| categorize(e, ManagerError::Preprocess))?;
        let mut synthetic = preprocessor
            .preprocess(&gathered.synthetic, &params(StreamKind::Synthetic))
            .await
            .map_err(|e| categorize(e, ManagerError::Preprocess))?;

        trim_to_synthetic(&mut observed, &mut synthetic);
        if observed.is_empty() || synthetic.is_empty() {
            return Err(ManagerError::Preprocess(format!(
                "{}: observed data does not overlap the synthetics",
                code
            ))
            .into());
        }

        let Some((syn_start, _)) = synthetic.span() else {
            return Err(ManagerError::Preprocess(format!("{}: empty synthetics", code)).into());
        };
        let time_offset = secs_between(gathered.event.origin_time, syn_start);

        let half_duration = gathered
            .event
            .moment_tensor
            .as_ref()
            .and_then(|mt| mt.half_duration);
        let convolved = match half_duration {
            Some(half_duration) => {
                synthetic = preprocessor
                    .convolve_stf(&synthetic, half_duration)
                    .await
                    .map_err(|e| categorize(e, ManagerError::Preprocess))?;
                true
            }
            None => {
                debug!(station = %code, "No source time function duration, synthetics left unconvolved");
                false
            }
        };

        debug!(station = %code, time_offset, convolved, "Preprocessed");
        self.station = Crate::Preprocessed(Preprocessed {
            data: Gathered {
                observed,
                synthetic,
                ..gathered
            },
            time_offset,
            convolved,
        });
        Ok(())
    }

    /// Pick misfit windows, or reuse the previous evaluation's when `fix` is set
    ///
    /// Components without data get an empty list. A window set that is empty
    /// on every component is kept with a warning.
    pub async fn window(&mut self, fix: bool) -> FlowResult<()> {
        let Some(preprocessed) = self.station.preprocessed().cloned() else {
            return Err(ManagerError::InvalidState(format!(
                "window needs preprocessed data, crate is {}",
                self.station.stage()
            ))
            .into());
        };
        let code = preprocessed.data.station_code.clone();

        if fix {
            if let Some(windows) = self.previous_windows(&preprocessed).await {
                info!(station = %code, windows = count_windows(&windows), "Reusing fixed windows");
                self.station = Crate::Windowed(Windowed {
                    preprocessed,
                    windows,
                    staltas: BTreeMap::new(),
                    fixed: true,
                });
                return Ok(());
            }
            warn!(station = %code, "No previous windows to fix, picking new windows");
        }

        let mut windows = WindowSet::new();
        let mut staltas = BTreeMap::new();
        for component in &self.config.processing.component_list {
            let data = &preprocessed.data;
            let (Some(observed), Some(synthetic)) = (
                data.observed.select(component).first().cloned(),
                data.synthetic.select(component).first().cloned(),
            ) else {
                debug!(station = %code, component = %component, "No data for component");
                windows.insert(component.clone(), Vec::new());
                continue;
            };

            let request = WindowRequest {
                component: component.clone(),
                observed,
                synthetic,
                event: (*data.event).clone(),
                inventory: data.inventory.clone(),
                time_offset: preprocessed.time_offset,
                min_period: self.config.processing.min_period,
                max_period: self.config.processing.max_period,
                parameters: self.window_parameters.clone(),
            };

            let selection = match self.services.window_picker.select_windows(&request).await {
                Ok(selection) => selection,
                Err(ServiceError::MissingData(msg)) => {
                    debug!(station = %code, component = %component, "No windows: {}", msg);
                    Default::default()
                }
                Err(e) => return Err(categorize(e, ManagerError::Window)),
            };

            let mut picked = selection.windows;
            picked.sort_by_key(|w| w.left);
            windows.insert(component.clone(), picked);
            if !selection.stalta.is_empty() {
                staltas.insert(component.clone(), selection.stalta);
            }
        }

        let total = count_windows(&windows);
        if total == 0 {
            warn!(station = %code, "Window selection returned no windows on any component");
        } else {
            info!(station = %code, windows = total, "Windows picked");
        }

        self.station = Crate::Windowed(Windowed {
            preprocessed,
            windows,
            staltas,
            fixed: false,
        });
        Ok(())
    }

    async fn previous_windows(&self, preprocessed: &Preprocessed) -> Option<WindowSet> {
        let archive = self.sources.archive.as_ref()?;
        let code = &preprocessed.data.station_code;
        match archive
            .previous_windows(
                &code.network,
                &code.station,
                &self.config.model_tag(),
                &self.config.step_tag(),
            )
            .await
        {
            Ok(found) => found.filter(|w| count_windows(w) > 0).map(|mut windows| {
                // Same keys as a fresh pick: unwindowed components map to an empty list
                for component in &self.config.processing.component_list {
                    windows.entry(component.clone()).or_default();
                }
                windows
            }),
            Err(e) => {
                warn!(station = %code, "Reading previous windows failed: {}", e);
                None
            }
        }
    }

    /// Measure misfit and build adjoint sources inside the windows
    pub async fn measure(&mut self) -> FlowResult<()> {
        let Some(windowed) = self.station.windowed().cloned() else {
            return Err(ManagerError::InvalidState(format!(
                "measure needs windows, crate is {}",
                self.station.stage()
            ))
            .into());
        };
        let data = &windowed.preprocessed.data;
        let code = data.station_code.clone();

        if count_windows(&windowed.windows) == 0 {
            return Err(ManagerError::NoWindows(code.to_string()).into());
        }

        let processing = &self.config.processing;
        let mut adjoint_sources = BTreeMap::new();
        let mut misfit = 0.0;
        for (component, windows) in &windowed.windows {
            if windows.is_empty() {
                continue;
            }
            let (Some(observed), Some(synthetic)) = (
                data.observed.select(component).first().cloned(),
                data.synthetic.select(component).first().cloned(),
            ) else {
                warn!(station = %code, component = %component, "Windows without data, skipped");
                continue;
            };

            let dt = synthetic.delta();
            let request = MisfitRequest {
                adj_src_type: processing.adj_src_type.clone(),
                windows: windows
                    .iter()
                    .map(|w| (w.start_time(dt), w.end_time(dt)))
                    .collect(),
                min_period: processing.min_period,
                max_period: processing.max_period,
                observed,
                synthetic: synthetic.clone(),
            };

            let measurement = match self.services.misfit.calculate(&request).await {
                Ok(measurement) => measurement,
                Err(ServiceError::MissingData(msg)) => {
                    warn!(station = %code, component = %component, "No misfit measured: {}", msg);
                    continue;
                }
                Err(e) => return Err(categorize(e, ManagerError::Quantify)),
            };

            misfit += measurement.misfit;
            adjoint_sources.insert(
                component.clone(),
                AdjointSource {
                    adj_src_type: processing.adj_src_type.clone(),
                    network: synthetic.network.clone(),
                    station: synthetic.station.clone(),
                    location: synthetic.location.clone(),
                    channel: synthetic.channel.clone(),
                    dt,
                    data: measurement.adjoint_source,
                    misfit: measurement.misfit,
                },
            );
        }

        if adjoint_sources.is_empty() {
            return Err(ManagerError::Quantify(format!(
                "{}: no component produced an adjoint source",
                code
            ))
            .into());
        }

        info!(station = %code, misfit, components = adjoint_sources.len(), "Misfit quantified");
        self.station = Crate::Quantified(Quantified {
            windowed,
            adjoint_sources,
            misfit,
        });
        Ok(())
    }

    /// Write windows and adjoint sources to the archive in one transaction
    ///
    /// Failures are logged and swallowed. Returns true when the records were
    /// written.
    pub async fn persist(&mut self) -> bool {
        let Crate::Quantified(quantified) = &self.station else {
            debug!("Nothing to persist at stage {}", self.station.stage());
            return false;
        };
        let Some(archive) = &self.sources.archive else {
            debug!("No archive configured, results not persisted");
            return false;
        };

        let code = quantified.windowed.preprocessed.data.station_code.clone();
        let records = match station_records(quantified) {
            Ok(records) => records,
            Err(e) => {
                warn!(station = %code, "Building archive records failed: {}", e);
                return false;
            }
        };

        let result = archive
            .persist_station(
                &self.config.model_tag(),
                &self.config.step_tag(),
                &code.network,
                &code.station,
                &records,
            )
            .await;
        match result {
            Ok(()) => {
                debug!(station = %code, records = records.len(), "Persisted");
                if let Crate::Quantified(q) = std::mem::take(&mut self.station) {
                    self.station = Crate::Persisted(q);
                }
                true
            }
            Err(e) => {
                warn!(station = %code, "Persisting results failed: {}", e);
                false
            }
        }
    }

    /// Run every stage after gathering
    pub async fn flow(&mut self, fix_windows: bool) -> FlowResult<()> {
        self.preprocess().await?;
        self.window(fix_windows).await?;
        self.measure().await?;
        self.persist().await;
        Ok(())
    }

    /// Everything the plotter needs, once the streams are preprocessed
    pub fn plot_request(&self, title: &str) -> Option<PlotRequest> {
        let preprocessed = self.station.preprocessed()?;
        let data = &preprocessed.data;
        let windowed = self.station.windowed();
        Some(PlotRequest {
            station: data.station_code.net_sta(),
            title: title.to_string(),
            observed: data.observed.clone(),
            synthetic: data.synthetic.clone(),
            windows: windowed.map(|w| w.windows.clone()).unwrap_or_default(),
            staltas: windowed.map(|w| w.staltas.clone()).unwrap_or_default(),
            adjoint_sources: self.station.adjoint_sources().cloned().unwrap_or_default(),
            misfit: self.station.misfit(),
            time_offset: preprocessed.time_offset,
        })
    }

    /// Write adjoint sources as solver two-column files
    ///
    /// With `write_blanks`, configured components that have no adjoint source
    /// get an all-zero file of the same length, since the solver expects one
    /// file per component.
    pub fn write_adjsrcs(&self, dir: &Path, write_blanks: bool) -> Result<Vec<PathBuf>> {
        let (Some(sources), Some(time_offset)) =
            (self.station.adjoint_sources(), self.station.time_offset())
        else {
            return Ok(Vec::new());
        };
        let Some(template) = sources.values().next() else {
            return Ok(Vec::new());
        };
        std::fs::create_dir_all(dir)?;

        let band = band_code(template.dt);
        let blank = vec![0.0; template.data.len()];
        let mut written = Vec::new();
        for component in &self.config.processing.component_list {
            let (data, dt) = match sources.get(component) {
                Some(source) => (&source.data, source.dt),
                None if write_blanks => (&blank, template.dt),
                None => continue,
            };
            let times: Vec<f64> = (0..data.len())
                .map(|i| i as f64 * dt + time_offset)
                .collect();
            let path = dir.join(adjoint_file_name(
                &template.network,
                &template.station,
                band,
                component,
            ));
            write_adjoint(&path, &times, data)?;
            written.push(path);
        }
        Ok(written)
    }

    /// Write the preprocessed synthetics in solver trace format
    ///
    /// `unit` is the `sem?` suffix letter. Nothing is written before
    /// preprocessing, since only then is the origin offset known.
    pub fn write_synthetics(&self, dir: &Path, unit: char) -> Result<Vec<PathBuf>> {
        match self.station.preprocessed() {
            Some(p) => write_sem(&p.data.synthetic, unit, dir, p.time_offset),
            None => Ok(Vec::new()),
        }
    }
}

/// Preprocessing needs every trace to be a usable, typed channel
fn check_stream_types(gathered: &Gathered) -> FlowResult<()> {
    let code = &gathered.station_code;
    for (name, stream) in [("observed", &gathered.observed), ("synthetic", &gathered.synthetic)] {
        if stream.is_empty() {
            return Err(ManagerError::Preprocess(format!("{}: {} stream is empty", code, name)).into());
        }
        if let Some(bad) = stream
            .iter()
            .find(|t| !(t.sampling_rate.is_finite() && t.sampling_rate > 0.0) || t.component().is_none())
        {
            return Err(ManagerError::Preprocess(format!(
                "{}: {} trace {} has no valid sampling rate or channel",
                code,
                name,
                bad.id()
            ))
            .into());
        }
    }
    Ok(())
}

/// Window and adjoint source records for one station
fn station_records(quantified: &Quantified) -> std::result::Result<Vec<AuxRecord>, serde_json::Error> {
    let windowed = &quantified.windowed;
    let data = &windowed.preprocessed.data;
    let time_offset = windowed.preprocessed.time_offset;

    let mut records = Vec::new();
    for (component, windows) in &windowed.windows {
        let Some(trace) = data.observed.select(component).first().cloned() else {
            continue;
        };
        for (i, window) in windows.iter().enumerate() {
            records.push(AuxRecord {
                category: MISFIT_WINDOWS,
                component: component.clone(),
                index: i as u32,
                payload: serde_json::to_value(WindowRecord::new(window, &trace, time_offset))?,
            });
        }
    }
    for (component, source) in &quantified.adjoint_sources {
        records.push(AuxRecord {
            category: ADJOINT_SOURCES,
            component: component.clone(),
            index: 0,
            payload: serde_json::to_value(AdjointRecord::new(source, time_offset))?,
        });
    }
    Ok(records)
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

impl fmt::Display for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let station = &self.station;
        let count = |s: Option<&Stream>| s.map(|s| s.len()).unwrap_or(0);

        writeln!(f, "Manager [{}]", station.stage())?;
        writeln!(
            f,
            "    event:              {}",
            station
                .event()
                .map(|e| e.event_id.as_str())
                .unwrap_or("none")
        )?;
        writeln!(
            f,
            "    inventory:          {}",
            station
                .inventory()
                .map(|i| i.net_sta())
                .unwrap_or_else(|| "none".to_string())
        )?;
        writeln!(f, "    observed traces:    {}", count(station.observed()))?;
        writeln!(f, "    synthetic traces:   {}", count(station.synthetic()))?;
        if let Some(hd) = station
            .event()
            .and_then(|e| e.moment_tensor.as_ref())
            .and_then(|mt| mt.half_duration)
        {
            writeln!(f, "    half duration:      {}", hd)?;
        }
        match station.time_offset() {
            Some(t) => writeln!(f, "    time offset:        {:.3} s", t)?,
            None => writeln!(f, "    time offset:        none")?,
        }
        writeln!(
            f,
            "    preprocessed:       {}",
            yes_no(station.preprocessed().is_some())
        )?;
        writeln!(f, "    windows:            {}", station.number_windows())?;
        writeln!(
            f,
            "    adjoint sources:    {}",
            station.adjoint_sources().map(|a| a.len()).unwrap_or(0)
        )?;
        match station.misfit() {
            Some(m) => write!(f, "    misfit:             {:.3E}", m),
            None => write!(f, "    misfit:             none"),
        }
    }
}
