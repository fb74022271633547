//! Collaborator services for the per-station workflow
//!
//! Signal processing, window selection, misfit measurement and plotting are
//! performed by collaborators behind the traits in this module. Each has an
//! implementation that talks to an external command (see [`external`]); the
//! preprocessor and plotter also have built-in implementations.
//!
//! Data access lives here too:
//! - [`gatherer`]: fallback chain archive → local files → remote service
//! - [`remote`]: HTTP client for the remote data service

pub mod builtin;
pub mod external;
pub mod gatherer;
pub mod remote;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ServicesConfig;
use crate::error::{FlowaError, Result};
use crate::models::{AdjointSource, Event, StationMetadata, Stream, Trace, Window, WindowSet};

pub use builtin::{PassthroughPreprocessor, ReportPlotter};
pub use external::ExternalService;
pub use gatherer::Gatherer;
pub use remote::RemoteClient;

/// Outcome taxonomy shared by all collaborators
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The collaborator had nothing to work with
    #[error("Missing data: {0}")]
    MissingData(String),

    /// The collaborator refused the input in an anticipated way
    #[error("Rejected: {0}")]
    Rejected(String),

    /// Anything else
    #[error("Unexpected service failure: {0:#}")]
    Unexpected(#[from] anyhow::Error),
}

/// Result type for collaborator calls
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Which of the two streams a preprocessing call applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Observed,
    Synthetic,
}

/// Parameters for one preprocessing call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessParams {
    pub kind: StreamKind,
    pub min_period: f64,
    pub max_period: f64,
    pub filter_corners: u32,
    pub pad_length_s: f64,
    pub unit_output: String,
    /// Resample to this rate (observed data is brought to the synthetic rate)
    pub sampling_rate: Option<f64>,
    /// Rotate horizontals with this back azimuth, in degrees
    pub back_azimuth: Option<f64>,
    /// Instrument response metadata for observed data
    pub inventory: Option<StationMetadata>,
}

/// Signal processing collaborator
#[async_trait]
pub trait Preprocessor: Send + Sync {
    /// Resample, rotate, filter and pad one stream
    async fn preprocess(&self, stream: &Stream, params: &PreprocessParams)
        -> ServiceResult<Stream>;

    /// Convolve synthetics with a Gaussian source time function
    async fn convolve_stf(&self, stream: &Stream, half_duration: f64) -> ServiceResult<Stream>;
}

/// Input to window selection for one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowRequest {
    pub component: String,
    pub observed: Trace,
    pub synthetic: Trace,
    pub event: Event,
    pub inventory: StationMetadata,
    pub time_offset: f64,
    pub min_period: f64,
    pub max_period: f64,
    #[serde(default)]
    pub parameters: BTreeMap<String, serde_json::Value>,
}

/// Windows plus the STA/LTA waveform they were selected on
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WindowSelection {
    pub windows: Vec<Window>,
    #[serde(default)]
    pub stalta: Vec<f64>,
}

/// Window selection collaborator
#[async_trait]
pub trait WindowPicker: Send + Sync {
    async fn select_windows(&self, request: &WindowRequest) -> ServiceResult<WindowSelection>;
}

/// Input to misfit quantification for one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MisfitRequest {
    pub adj_src_type: String,
    pub observed: Trace,
    pub synthetic: Trace,
    /// Window (start, end) in seconds relative to the first sample
    pub windows: Vec<(f64, f64)>,
    pub min_period: f64,
    pub max_period: f64,
}

/// Adjoint series and scalar misfit for one component
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MisfitMeasurement {
    pub adjoint_source: Vec<f64>,
    pub misfit: f64,
}

/// Misfit quantification collaborator
#[async_trait]
pub trait MisfitQuantifier: Send + Sync {
    async fn calculate(&self, request: &MisfitRequest) -> ServiceResult<MisfitMeasurement>;
}

/// Everything the plotter needs to draw one station
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlotRequest {
    pub station: String,
    pub title: String,
    pub observed: Stream,
    pub synthetic: Stream,
    pub windows: WindowSet,
    #[serde(default)]
    pub staltas: BTreeMap<String, Vec<f64>>,
    pub adjoint_sources: BTreeMap<String, AdjointSource>,
    pub misfit: Option<f64>,
    pub time_offset: f64,
}

/// Plot rendering collaborator
#[async_trait]
pub trait Plotter: Send + Sync {
    /// File extension of rendered artifacts, without the dot
    fn extension(&self) -> &str;

    async fn render(&self, request: &PlotRequest, output: &Path) -> ServiceResult<()>;

    /// Concatenate per-station artifacts into one document
    async fn merge(&self, parts: &[PathBuf], output: &Path) -> ServiceResult<()>;
}

/// The collaborator set handed to each Manager
#[derive(Clone)]
pub struct Services {
    pub preprocessor: Arc<dyn Preprocessor>,
    pub window_picker: Arc<dyn WindowPicker>,
    pub misfit: Arc<dyn MisfitQuantifier>,
    pub plotter: Arc<dyn Plotter>,
}

impl Services {
    /// Build collaborators from configuration
    ///
    /// Window selection and misfit quantification have no built-in and must be
    /// configured.
    pub fn from_config(config: &ServicesConfig) -> Result<Self> {
        let window_picker = config.window_picker.as_ref().ok_or_else(|| {
            FlowaError::Config("services.window_picker is not configured".to_string())
        })?;
        let misfit = config
            .misfit
            .as_ref()
            .ok_or_else(|| FlowaError::Config("services.misfit is not configured".to_string()))?;

        let preprocessor: Arc<dyn Preprocessor> = match &config.preprocess {
            Some(cmd) => Arc::new(ExternalService::new("preprocess", cmd.clone())),
            None => Arc::new(PassthroughPreprocessor),
        };
        let plotter: Arc<dyn Plotter> = match &config.plotter {
            Some(cmd) => Arc::new(ExternalService::new("plotter", cmd.clone())),
            None => Arc::new(ReportPlotter),
        };

        Ok(Self {
            preprocessor,
            window_picker: Arc::new(ExternalService::new("window_picker", window_picker.clone())),
            misfit: Arc::new(ExternalService::new("misfit", misfit.clone())),
            plotter,
        })
    }
}
