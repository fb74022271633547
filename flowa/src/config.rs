//! Run configuration for flowa
//!
//! One TOML document describes an evaluation (iteration and step), the
//! processing parameters handed to the collaborators, the directory layout,
//! the external service commands and the optional remote data service:
//!
//! ```toml
//! [workflow]
//! iteration = 2
//! step_count = 1
//! fix_windows = "ITER"
//!
//! [processing]
//! min_period = 10.0
//! max_period = 30.0
//!
//! [paths]
//! structure = "seisflows"
//! workdir = "/scratch/inversion"
//!
//! [services.window_picker]
//! program = "pick-windows"
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use flowa_common::config::{parse_toml, LoggingConfig};
use flowa_common::tags;

use crate::error::{FlowaError, Result};

/// Complete run configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub workflow: WorkflowConfig,
    #[serde(default)]
    pub processing: ProcessingConfig,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default, skip_serializing)]
    pub logging: LoggingConfig,
}

impl RunConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            FlowaError::Config(format!("Read {} failed: {}", path.display(), e))
        })?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a configuration document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: RunConfig =
            parse_toml(content).map_err(|e| config_error_from_toml(&e))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations that would make every station fail
    pub fn validate(&self) -> Result<()> {
        if self.workflow.iteration == 0 {
            return Err(FlowaError::Config(
                "workflow.iteration starts at 1".to_string(),
            ));
        }
        if self.processing.min_period >= self.processing.max_period {
            return Err(FlowaError::Config(format!(
                "processing.min_period ({}) must be below max_period ({})",
                self.processing.min_period, self.processing.max_period
            )));
        }
        if self.processing.component_list.is_empty() {
            return Err(FlowaError::Config(
                "processing.component_list is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Iteration tag, e.g. `i01`
    pub fn iter_tag(&self) -> String {
        tags::iter_tag(self.workflow.iteration)
    }

    /// Step tag, e.g. `s00`
    pub fn step_tag(&self) -> String {
        tags::step_tag(self.workflow.step_count)
    }

    /// Model tag for the current iteration, e.g. `m00`
    pub fn model_tag(&self) -> String {
        tags::model_tag(self.workflow.iteration)
    }

    /// `i01s00`, used to prefix per-evaluation file names
    pub fn eval_tag(&self) -> String {
        format!("{}{}", self.iter_tag(), self.step_tag())
    }

    /// First evaluation of the inversion, the only one allowed to hit the
    /// remote data service
    pub fn is_first_evaluation(&self) -> bool {
        self.workflow.iteration == 1 && self.workflow.step_count == 0
    }
}

/// Serde surfaces policy errors as plain messages; recover the typed error
fn config_error_from_toml(err: &toml::de::Error) -> FlowaError {
    let message = err.message().to_string();
    match message.strip_prefix(INVALID_FIX_WINDOWS_PREFIX) {
        Some(value) => FlowaError::InvalidFixWindows(value.to_string()),
        None => FlowaError::Config(message),
    }
}

const INVALID_FIX_WINDOWS_PREFIX: &str = "invalid fix_windows: ";

/// Evaluation position and workflow switches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_iteration")]
    pub iteration: u32,
    #[serde(default)]
    pub step_count: u32,
    /// Iteration the inversion started at, used by the `ONCE` policy
    #[serde(default = "default_iteration")]
    pub begin: u32,
    #[serde(default)]
    pub fix_windows: FixWindows,
    /// Produce one plot artifact per processed station
    #[serde(default = "default_true")]
    pub plot: bool,
    /// Concurrent worker processes for multi-event runs (default: available parallelism)
    #[serde(default)]
    pub max_workers: Option<usize>,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            iteration: default_iteration(),
            step_count: 0,
            begin: default_iteration(),
            fix_windows: FixWindows::default(),
            plot: true,
            max_workers: None,
        }
    }
}

fn default_iteration() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

/// Whether misfit windows are re-picked or reused across evaluations
///
/// Accepts `true`, `false`, `"ITER"` or `"ONCE"` (case-insensitive) in TOML.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "FixWindowsValue", into = "FixWindowsValue")]
pub enum FixWindows {
    /// Always (true) or never (false) reuse windows
    Fixed(bool),
    /// Pick at the first step of every iteration, reuse for line-search steps
    Iter,
    /// Pick only at the first step of the starting iteration
    Once,
}

impl Default for FixWindows {
    fn default() -> Self {
        FixWindows::Fixed(false)
    }
}

impl std::str::FromStr for FixWindows {
    type Err = FlowaError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ITER" => Ok(FixWindows::Iter),
            "ONCE" => Ok(FixWindows::Once),
            "TRUE" => Ok(FixWindows::Fixed(true)),
            "FALSE" => Ok(FixWindows::Fixed(false)),
            _ => Err(FlowaError::InvalidFixWindows(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
enum FixWindowsValue {
    Flag(bool),
    Policy(String),
}

/// Error type for serde's `try_from`, carrying the offending value
#[derive(Debug)]
pub struct InvalidFixWindowsValue(String);

impl std::fmt::Display for InvalidFixWindowsValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", INVALID_FIX_WINDOWS_PREFIX, self.0)
    }
}

impl TryFrom<FixWindowsValue> for FixWindows {
    type Error = InvalidFixWindowsValue;

    fn try_from(value: FixWindowsValue) -> std::result::Result<Self, Self::Error> {
        match value {
            FixWindowsValue::Flag(flag) => Ok(FixWindows::Fixed(flag)),
            FixWindowsValue::Policy(text) => text
                .parse::<FixWindows>()
                .map_err(|_| InvalidFixWindowsValue(text)),
        }
    }
}

impl From<FixWindows> for FixWindowsValue {
    fn from(policy: FixWindows) -> Self {
        match policy {
            FixWindows::Fixed(flag) => FixWindowsValue::Flag(flag),
            FixWindows::Iter => FixWindowsValue::Policy("ITER".to_string()),
            FixWindows::Once => FixWindowsValue::Policy("ONCE".to_string()),
        }
    }
}

/// Parameters handed to the preprocessing, windowing and misfit collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Components to window and measure
    #[serde(default = "default_components")]
    pub component_list: Vec<String>,
    /// Bandpass corner periods in seconds
    #[serde(default = "default_min_period")]
    pub min_period: f64,
    #[serde(default = "default_max_period")]
    pub max_period: f64,
    #[serde(default = "default_filter_corners")]
    pub filter_corners: u32,
    /// Zero padding added to each end of the traces, in seconds
    #[serde(default = "default_pad_length")]
    pub pad_length_s: f64,
    /// Physical unit of the comparison: DISP, VEL or ACC
    #[serde(default = "default_unit_output")]
    pub unit_output: String,
    /// Rotate horizontals to radial/transverse using the back azimuth
    #[serde(default)]
    pub rotate_to_rtz: bool,
    /// Location/channel part of the gather code, e.g. `*.HH?`
    #[serde(default = "default_channel_pattern")]
    pub channel_pattern: String,
    /// Misfit functional name passed to the quantifier
    #[serde(default = "default_adj_src_type")]
    pub adj_src_type: String,
    /// Free-form parameters forwarded to the window picker
    #[serde(default)]
    pub window_parameters: BTreeMap<String, toml::Value>,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            component_list: default_components(),
            min_period: default_min_period(),
            max_period: default_max_period(),
            filter_corners: default_filter_corners(),
            pad_length_s: default_pad_length(),
            unit_output: default_unit_output(),
            rotate_to_rtz: false,
            channel_pattern: default_channel_pattern(),
            adj_src_type: default_adj_src_type(),
            window_parameters: BTreeMap::new(),
        }
    }
}

fn default_components() -> Vec<String> {
    vec!["N".to_string(), "E".to_string(), "Z".to_string()]
}

fn default_min_period() -> f64 {
    10.0
}

fn default_max_period() -> f64 {
    100.0
}

fn default_filter_corners() -> u32 {
    4
}

fn default_pad_length() -> f64 {
    20.0
}

fn default_unit_output() -> String {
    "DISP".to_string()
}

fn default_channel_pattern() -> String {
    "*.HH?".to_string()
}

fn default_adj_src_type() -> String {
    "cc_traveltime".to_string()
}

/// Deployment conventions for the directory layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathStructureKind {
    /// Solver run directories under `{workdir}/scratch/solver/{source}`
    #[default]
    Seisflows,
    /// Everything under `{workdir}`, one subdirectory per role
    Standalone,
}

/// Directory layout
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default)]
    pub structure: PathStructureKind,
    /// Root that every template is resolved against
    #[serde(default)]
    pub workdir: PathBuf,
    /// Where source directories are discovered for multi-event runs
    #[serde(default)]
    pub sources_dir: Option<PathBuf>,
    /// Role → template overrides; a role may list several roots
    #[serde(default)]
    pub roles: BTreeMap<String, Vec<String>>,
}

/// An external collaborator command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Artifact extension, for plotter commands (default `pdf`)
    #[serde(default)]
    pub extension: Option<String>,
}

/// External collaborator commands
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Signal processing; the built-in pass-through is used when absent
    #[serde(default)]
    pub preprocess: Option<ServiceCommand>,
    #[serde(default)]
    pub window_picker: Option<ServiceCommand>,
    #[serde(default)]
    pub misfit: Option<ServiceCommand>,
    /// Plot rendering; the built-in text report is used when absent
    #[serde(default)]
    pub plotter: Option<ServiceCommand>,
}

/// Remote data service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_s: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_s: default_timeout(),
        }
    }
}

fn default_timeout() -> u64 {
    30
}

/// Convenience used by the CLI and the worker entry point
pub fn load_run_config(cli_arg: Option<&Path>) -> Result<(PathBuf, RunConfig)> {
    let path = flowa_common::config::resolve_config_path(
        cli_arg,
        flowa_common::config::CONFIG_ENV_VAR,
    )?;
    let config = RunConfig::load(&path)?;
    Ok((path, config))
}
