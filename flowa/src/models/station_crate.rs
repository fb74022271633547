//! One station's working set, as a tagged state
//!
//! A [`Crate`] lives for exactly one gather → process cycle of a single
//! station. Each variant carries only the fields that are valid at that stage,
//! so "adjoint sources imply windows imply preprocessed streams" holds by
//! construction:
//!
//! ```text
//! Empty → Gathering → Gathered → Preprocessed → Windowed → Quantified → Persisted
//! ```
//!
//! The event is held behind an `Arc` because every station of an event reads
//! the same metadata.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use flowa_common::StationCode;

use crate::models::metadata::{Event, StationMetadata};
use crate::models::waveform::Stream;
use crate::models::window::{count_windows, AdjointSource, WindowSet};

/// Name of the current state, for logging and status reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
    Empty,
    Gathering,
    Gathered,
    Preprocessed,
    Windowed,
    Quantified,
    Persisted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Empty => "EMPTY",
            Stage::Gathering => "GATHERING",
            Stage::Gathered => "GATHERED",
            Stage::Preprocessed => "PREPROCESSED",
            Stage::Windowed => "WINDOWED",
            Stage::Quantified => "QUANTIFIED",
            Stage::Persisted => "PERSISTED",
        };
        f.write_str(name)
    }
}

/// Partially gathered inputs
#[derive(Debug, Clone)]
pub struct GatherSet {
    pub station_code: StationCode,
    pub event: Option<Arc<Event>>,
    pub inventory: Option<StationMetadata>,
    pub observed: Option<Stream>,
    pub synthetic: Option<Stream>,
}

impl GatherSet {
    pub fn new(station_code: StationCode) -> Self {
        Self {
            station_code,
            event: None,
            inventory: None,
            observed: None,
            synthetic: None,
        }
    }

    /// Observed, synthetic, station metadata and event metadata all present
    pub fn is_complete(&self) -> bool {
        self.event.is_some()
            && self.inventory.is_some()
            && self.observed.is_some()
            && self.synthetic.is_some()
    }

    /// Promote to [`Gathered`], or hand the set back when something is missing
    pub fn into_gathered(self) -> Result<Gathered, GatherSet> {
        match self {
            GatherSet {
                station_code,
                event: Some(event),
                inventory: Some(inventory),
                observed: Some(observed),
                synthetic: Some(synthetic),
            } => Ok(Gathered {
                station_code,
                event,
                inventory,
                observed,
                synthetic,
            }),
            incomplete => Err(incomplete),
        }
    }
}

/// Complete raw inputs
#[derive(Debug, Clone)]
pub struct Gathered {
    pub station_code: StationCode,
    pub event: Arc<Event>,
    pub inventory: StationMetadata,
    pub observed: Stream,
    pub synthetic: Stream,
}

/// Streams after preprocessing
#[derive(Debug, Clone)]
pub struct Preprocessed {
    pub data: Gathered,
    /// Synthetic start time minus event origin time, in seconds
    pub time_offset: f64,
    /// True when the synthetics were convolved with a source time function
    pub convolved: bool,
}

/// Preprocessed streams plus misfit windows
#[derive(Debug, Clone)]
pub struct Windowed {
    pub preprocessed: Preprocessed,
    pub windows: WindowSet,
    /// STA/LTA diagnostic per component
    pub staltas: BTreeMap<String, Vec<f64>>,
    /// True when the windows were reused from an earlier evaluation
    pub fixed: bool,
}

/// Windows plus adjoint sources and the summed misfit
#[derive(Debug, Clone)]
pub struct Quantified {
    pub windowed: Windowed,
    pub adjoint_sources: BTreeMap<String, AdjointSource>,
    pub misfit: f64,
}

/// Per-station working set
#[derive(Debug, Clone, Default)]
pub enum Crate {
    #[default]
    Empty,
    Gathering(GatherSet),
    Gathered(Gathered),
    Preprocessed(Preprocessed),
    Windowed(Windowed),
    Quantified(Quantified),
    Persisted(Quantified),
}

impl Crate {
    pub fn stage(&self) -> Stage {
        match self {
            Crate::Empty => Stage::Empty,
            Crate::Gathering(_) => Stage::Gathering,
            Crate::Gathered(_) => Stage::Gathered,
            Crate::Preprocessed(_) => Stage::Preprocessed,
            Crate::Windowed(_) => Stage::Windowed,
            Crate::Quantified(_) => Stage::Quantified,
            Crate::Persisted(_) => Stage::Persisted,
        }
    }

    /// Complete raw or processed inputs, from `Gathered` onwards
    pub fn gathered(&self) -> Option<&Gathered> {
        match self {
            Crate::Empty | Crate::Gathering(_) => None,
            Crate::Gathered(g) => Some(g),
            Crate::Preprocessed(p) => Some(&p.data),
            Crate::Windowed(w) => Some(&w.preprocessed.data),
            Crate::Quantified(q) | Crate::Persisted(q) => Some(&q.windowed.preprocessed.data),
        }
    }

    pub fn preprocessed(&self) -> Option<&Preprocessed> {
        match self {
            Crate::Preprocessed(p) => Some(p),
            Crate::Windowed(w) => Some(&w.preprocessed),
            Crate::Quantified(q) | Crate::Persisted(q) => Some(&q.windowed.preprocessed),
            _ => None,
        }
    }

    pub fn windowed(&self) -> Option<&Windowed> {
        match self {
            Crate::Windowed(w) => Some(w),
            Crate::Quantified(q) | Crate::Persisted(q) => Some(&q.windowed),
            _ => None,
        }
    }

    pub fn quantified(&self) -> Option<&Quantified> {
        match self {
            Crate::Quantified(q) | Crate::Persisted(q) => Some(q),
            _ => None,
        }
    }

    pub fn station_code(&self) -> Option<&StationCode> {
        match self {
            Crate::Empty => None,
            Crate::Gathering(set) => Some(&set.station_code),
            _ => self.gathered().map(|g| &g.station_code),
        }
    }

    pub fn event(&self) -> Option<&Arc<Event>> {
        match self {
            Crate::Gathering(set) => set.event.as_ref(),
            _ => self.gathered().map(|g| &g.event),
        }
    }

    pub fn inventory(&self) -> Option<&StationMetadata> {
        match self {
            Crate::Gathering(set) => set.inventory.as_ref(),
            _ => self.gathered().map(|g| &g.inventory),
        }
    }

    pub fn observed(&self) -> Option<&Stream> {
        match self {
            Crate::Gathering(set) => set.observed.as_ref(),
            _ => self.gathered().map(|g| &g.observed),
        }
    }

    pub fn synthetic(&self) -> Option<&Stream> {
        match self {
            Crate::Gathering(set) => set.synthetic.as_ref(),
            _ => self.gathered().map(|g| &g.synthetic),
        }
    }

    pub fn windows(&self) -> Option<&WindowSet> {
        self.windowed().map(|w| &w.windows)
    }

    pub fn adjoint_sources(&self) -> Option<&BTreeMap<String, AdjointSource>> {
        self.quantified().map(|q| &q.adjoint_sources)
    }

    pub fn time_offset(&self) -> Option<f64> {
        self.preprocessed().map(|p| p.time_offset)
    }

    /// Summed misfit, present only after quantification
    pub fn misfit(&self) -> Option<f64> {
        self.quantified().map(|q| q.misfit)
    }

    pub fn number_windows(&self) -> usize {
        self.windows().map(count_windows).unwrap_or(0)
    }

    /// Observed, synthetic, station metadata and event metadata all present
    pub fn is_complete(&self) -> bool {
        match self {
            Crate::Empty => false,
            Crate::Gathering(set) => set.is_complete(),
            _ => true,
        }
    }
}
