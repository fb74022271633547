//! Data model for the per-station workflow
//!
//! - [`waveform`]: single-channel traces and streams
//! - [`metadata`]: event and station metadata
//! - [`window`]: misfit windows and adjoint sources
//! - [`station_crate`]: the per-station working set as a tagged state

pub mod metadata;
pub mod station_crate;
pub mod waveform;
pub mod window;

pub use metadata::{ChannelInfo, Event, MomentTensor, StationMetadata};
pub use station_crate::{Crate, GatherSet, Gathered, Preprocessed, Quantified, Stage, Windowed};
pub use waveform::{Stream, Trace};
pub use window::{AdjointSource, Window, WindowSet};
