//! Event-level orchestration
//!
//! For one source (event) the orchestrator:
//! 1. Resolves the path plan and creates output directories
//! 2. Opens the event archive and clears records and adjoint sources of the
//!    current evaluation
//! 3. Attaches an event-scoped log
//! 4. Runs every station through one reused [`Manager`], sequentially
//! 5. Finalizes: merged plots, adjoint station list, summary, misfit file
//!
//! A station failure never aborts the event. Categorized failures are logged
//! as warnings; anything else, including panics, is logged in full and
//! counted in [`RunStats::exceptions`]. Events fan out over worker processes
//! in [`multi`].

pub mod fix_windows;
pub mod logging;
pub mod multi;
pub mod paths;
pub mod statistics;

use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt;
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn};

use flowa_common::StationCode;

use crate::archive::Archive;
use crate::config::RunConfig;
use crate::error::{FlowError, FlowaError, Result};
use crate::files::adjoint::clear_adjoint_sources;
use crate::files::stations::{adjoint_stations_path, read_stations_file, write_stations_adjoint};
use crate::files::write_misfit;
use crate::manager::{Manager, ResetMode};
use crate::services::gatherer::GatherSources;
use crate::services::{RemoteClient, Services};

pub use fix_windows::fix_windows;
pub use logging::EventLog;
pub use multi::{WorkerPool, WorkerReport};
pub use paths::{discover_sources, EventPaths, PathPlan};
pub use statistics::RunStats;

/// Result of processing one event
#[derive(Debug, Clone)]
pub struct EventOutcome {
    pub stats: RunStats,
    /// Scaled event misfit, `None` when no station produced a result
    pub misfit: Option<f64>,
}

/// Runs events through the per-station workflow
pub struct Orchestrator {
    config: Arc<RunConfig>,
    services: Services,
    plan: PathPlan,
}

impl Orchestrator {
    pub fn new(config: RunConfig, services: Services) -> Result<Self> {
        let plan = PathPlan::from_config(&config.paths)?;
        Ok(Self {
            config: Arc::new(config),
            services,
            plan,
        })
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    pub fn plan(&self) -> &PathPlan {
        &self.plan
    }

    fn workdir(&self) -> &Path {
        &self.config.paths.workdir
    }

    /// Where multi-event runs look for source directories
    pub fn sources_dir(&self) -> PathBuf {
        self.config
            .paths
            .sources_dir
            .clone()
            .unwrap_or_else(|| self.plan.sources_dir(self.workdir()))
    }

    pub fn discover_sources(&self) -> Result<Vec<String>> {
        discover_sources(&self.sources_dir())
    }

    /// Fixed-window flag for the configured evaluation
    pub fn fix_windows(&self) -> bool {
        let workflow = &self.config.workflow;
        fix_windows(
            workflow.iteration,
            workflow.step_count,
            workflow.begin,
            workflow.fix_windows,
        )
    }

    /// Process events one after another in this process
    pub async fn process(&self, sources: &[String]) -> Result<BTreeMap<String, Option<f64>>> {
        let mut misfits = BTreeMap::new();
        for source in sources {
            let outcome = self.process_event(source, None).await?;
            misfits.insert(source.clone(), outcome.misfit);
        }
        Ok(misfits)
    }

    /// Process every station of one event
    ///
    /// `stations` replaces the event's stations file as the station list;
    /// entries are `NET.STA` or full `NET.STA.LOC.CHA` codes.
    pub async fn process_event(&self, source: &str, stations: Option<&[String]>) -> Result<EventOutcome> {
        let eval = self.config.eval_tag();
        let paths = self.plan.resolve(self.workdir(), source, &eval)?;

        let log_path = paths
            .require(paths::LOGS)?
            .join(format!("{}_{}.log", eval, source));
        let log = EventLog::create(&log_path, &self.config.logging)?;

        let outcome = self
            .run_event(source, stations, &paths)
            .with_subscriber(log.dispatch())
            .await;
        drop(log);
        outcome
    }

    async fn run_event(
        &self,
        source: &str,
        stations: Option<&[String]>,
        paths: &EventPaths,
    ) -> Result<EventOutcome> {
        let config = &self.config;
        let (model, step) = (config.model_tag(), config.step_tag());
        info!(source = %source, iteration = %config.iter_tag(), step = %step, "Processing event");

        let archive = Arc::new(Archive::open(&paths.dataset_file()?).await?);
        let cleaned = archive.clean(&model, &step).await?;
        if cleaned > 0 {
            debug!(source = %source, records = cleaned, "Cleared records of this evaluation");
        }
        archive
            .write_config(&model, &step, &serde_json::to_value(config.as_ref())?)
            .await?;

        // Adjoint sources from an earlier evaluation must not reach the solver
        if let Ok(adj_dir) = paths.require(paths::ADJSRCS) {
            let removed = clear_adjoint_sources(adj_dir)?;
            if removed > 0 {
                debug!(source = %source, files = removed, "Removed previous adjoint sources");
            }
        }

        let stations_file = paths.require(paths::STATIONS_FILE)?.to_path_buf();
        let codes = self.station_codes(&stations_file, stations)?;

        let sources = GatherSources {
            event_id: source.to_string(),
            event_file: paths.first(paths::EVENT_FILE).map(Path::to_path_buf),
            stations_file: Some(stations_file.clone()),
            responses: paths.all(paths::RESPONSES).to_vec(),
            waveforms: paths.all(paths::WAVEFORMS).to_vec(),
            synthetics: paths.all(paths::SYNTHETICS).to_vec(),
            archive: Some(Arc::clone(&archive)),
            client: self.remote_client()?,
            model,
            step,
            pad_length_s: config.processing.pad_length_s,
        };

        let mut manager = Manager::new(Arc::clone(config), self.services.clone(), sources);
        let mut stats = RunStats::new(source);
        let fix = self.fix_windows();
        debug!(source = %source, fix_windows = fix, stations = codes.len(), "Station loop");

        for code in &codes {
            self.quantify(&mut manager, code, fix, paths, &mut stats).await;
        }
        drop(manager);

        let misfit = self.finalize(paths, &stations_file, &mut stats).await;

        match Arc::try_unwrap(archive) {
            Ok(archive) => archive.close().await,
            Err(_) => warn!(source = %source, "Archive still referenced at event end"),
        }
        Ok(EventOutcome { stats, misfit })
    }

    fn station_codes(&self, stations_file: &Path, overrides: Option<&[String]>) -> Result<Vec<StationCode>> {
        let names: Vec<String> = match overrides {
            Some(list) => list.to_vec(),
            None => read_stations_file(stations_file)?
                .iter()
                .map(|e| e.net_sta())
                .collect(),
        };
        let pattern = &self.config.processing.channel_pattern;
        names
            .iter()
            .map(|name| {
                let full = if name.split('.').count() == 2 {
                    format!("{}.{}", name, pattern)
                } else {
                    name.clone()
                };
                full.parse::<StationCode>().map_err(FlowaError::from)
            })
            .collect()
    }

    /// The remote data service is only consulted at the first evaluation
    fn remote_client(&self) -> Result<Option<RemoteClient>> {
        let client = &self.config.client;
        match (&client.base_url, self.config.is_first_evaluation()) {
            (Some(url), true) => RemoteClient::new(url, client.timeout_s)
                .map(Some)
                .map_err(|e| FlowaError::Config(format!("Remote client: {}", e))),
            _ => Ok(None),
        }
    }

    /// One station: gather, flow, plot, write adjoint sources, accumulate
    async fn quantify(
        &self,
        manager: &mut Manager,
        code: &StationCode,
        fix_windows: bool,
        paths: &EventPaths,
        stats: &mut RunStats,
    ) {
        let rule = "=".repeat(80);
        info!("\n{rule}\n\n{}\n\n{rule}", code.net_sta());
        stats.stations += 1;
        manager.reset(ResetMode::Soft);

        if let Err(e) = manager.gather(code, false).await {
            warn!(station = %code, "{}", e);
            return;
        }

        let outcome = AssertUnwindSafe(manager.flow(fix_windows))
            .catch_unwind()
            .await;
        let success = match outcome {
            Ok(Ok(())) => true,
            Ok(Err(FlowError::Manager(e))) => {
                warn!(station = %code, "{}", e);
                false
            }
            Ok(Err(FlowError::Unexpected(e))) => {
                error!(station = %code, "Unexpected error: {:?}", e);
                stats.exceptions += 1;
                false
            }
            Err(payload) => {
                error!(station = %code, "Station processing panicked: {}", panic_message(payload.as_ref()));
                stats.exceptions += 1;
                false
            }
        };

        let plot = if self.config.workflow.plot {
            self.plot_station(manager, code, paths).await
        } else {
            None
        };

        if !success {
            return;
        }
        // The solver expects a file per component, with or without data
        if let Ok(dir) = paths.require(paths::ADJSRCS) {
            if let Err(e) = manager.write_adjsrcs(dir, true) {
                warn!(station = %code, "Writing adjoint sources failed: {}", e);
            }
        }
        let station = manager.station();
        stats.record_station(
            station.misfit().unwrap_or_default(),
            station.number_windows(),
            plot,
        );
    }

    async fn plot_station(&self, manager: &Manager, code: &StationCode, paths: &EventPaths) -> Option<PathBuf> {
        let config = &self.config;
        let source = &manager.station().event()?.event_id;
        let title = format!("{} {} {}", code.net_sta(), source, config.eval_tag());
        let request = manager.plot_request(&title)?;

        let plotter = &self.services.plotter;
        let dir = paths.first(paths::FIGURES)?.join(source);
        let path = dir.join(format!(
            "{}_{}_{}.{}",
            config.iter_tag(),
            config.step_tag(),
            code.net_sta().replace('.', "_"),
            plotter.extension()
        ));
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!(station = %code, "Creating {} failed: {}", dir.display(), e);
            return None;
        }
        match plotter.render(&request, &path).await {
            Ok(()) => Some(path),
            Err(e) => {
                warn!(station = %code, "Plotting failed: {}", e);
                None
            }
        }
    }

    async fn finalize(&self, paths: &EventPaths, stations_file: &Path, stats: &mut RunStats) -> Option<f64> {
        self.merge_plots(paths, stats).await;

        if let Ok(adj_dir) = paths.require(paths::ADJSRCS) {
            let output = adjoint_stations_path(stations_file);
            match write_stations_adjoint(stations_file, adj_dir, &output) {
                Ok(n) => debug!(stations = n, "Wrote {}", output.display()),
                Err(e) => warn!("Writing {} failed: {}", output.display(), e),
            }
        }

        info!("{}", stats.summary());

        let misfit = stats.scaled_misfit();
        if let (Some(value), Some(path)) = (misfit, paths.first(paths::MISFIT_FILE)) {
            if let Err(e) = write_misfit(path, value) {
                warn!("Writing misfit file {} failed: {}", path.display(), e);
            }
        }
        misfit
    }

    /// Merge station plots into one document and delete the parts
    async fn merge_plots(&self, paths: &EventPaths, stats: &mut RunStats) {
        if stats.plots.is_empty() {
            return;
        }
        let Some(figures) = paths.first(paths::FIGURES) else {
            return;
        };
        let plotter = &self.services.plotter;
        let output = figures.join(format!(
            "{}_{}_{}.{}",
            self.config.iter_tag(),
            self.config.step_tag(),
            stats.source,
            plotter.extension()
        ));

        let mut parts = stats.plots.clone();
        parts.sort();
        if let Err(e) = plotter.merge(&parts, &output).await {
            warn!("Merging plots into {} failed: {}", output.display(), e);
            return;
        }
        for part in &parts {
            if let Err(e) = std::fs::remove_file(part) {
                warn!("Removing {} failed: {}", part.display(), e);
            }
        }
        debug!(parts = parts.len(), "Merged plots into {}", output.display());
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
