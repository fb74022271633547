//! flowa library interface
//!
//! Misfit quantification for seismic inversions: per-station gather,
//! preprocess, window and measure, aggregated per event and fanned out over
//! worker processes.

pub mod archive;
pub mod config;
pub mod error;
pub mod files;
pub mod inspector;
pub mod manager;
pub mod models;
pub mod services;
pub mod workflow;

pub use crate::config::RunConfig;
pub use crate::error::{FlowError, FlowaError, ManagerError, Result};
pub use crate::manager::{Manager, ResetMode};
pub use crate::workflow::{EventOutcome, Orchestrator};
