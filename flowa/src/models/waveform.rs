//! Single-channel time series
//!
//! A [`Trace`] is one channel with a start time and a uniform sampling rate.
//! A [`Stream`] is an ordered collection of traces, normally the three
//! components of one station.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// One channel of waveform data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub network: String,
    pub station: String,
    #[serde(default)]
    pub location: String,
    pub channel: String,
    /// Absolute time of the first sample
    pub starttime: DateTime<Utc>,
    /// Samples per second
    pub sampling_rate: f64,
    pub data: Vec<f64>,
    /// Processing steps applied so far, oldest first
    #[serde(default)]
    pub processing: Vec<String>,
}

impl Trace {
    /// Sampling interval in seconds
    pub fn delta(&self) -> f64 {
        1.0 / self.sampling_rate
    }

    pub fn npts(&self) -> usize {
        self.data.len()
    }

    /// `NET.STA.LOC.CHA`
    pub fn id(&self) -> String {
        format!(
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }

    /// Component letter, the last character of the channel code
    pub fn component(&self) -> Option<char> {
        self.channel.chars().last()
    }

    /// Time of the last sample
    pub fn endtime(&self) -> DateTime<Utc> {
        let span = self.npts().saturating_sub(1) as f64 * self.delta();
        self.starttime + duration_from_secs(span)
    }

    /// Sample times relative to the first sample
    pub fn times(&self) -> Vec<f64> {
        let dt = self.delta();
        (0..self.npts()).map(|i| i as f64 * dt).collect()
    }

    /// Cut the trace to the samples lying inside `[start, end]`
    ///
    /// The new start time is snapped to the first retained sample. A window that
    /// does not overlap the trace leaves it empty.
    pub fn trim(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) {
        let dt = self.delta();
        let eps = 1e-6;
        let from = (secs_between(self.starttime, start) / dt - eps).ceil().max(0.0) as usize;
        let to_f = (secs_between(self.starttime, end) / dt + eps).floor();

        if to_f < 0.0 || from >= self.npts() {
            self.data.clear();
            return;
        }
        let to = (to_f as usize).min(self.npts() - 1);
        if to < from {
            self.data.clear();
            return;
        }

        self.data = self.data[from..=to].to_vec();
        self.starttime += duration_from_secs(from as f64 * dt);
    }
}

/// Ordered collection of traces
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stream {
    pub traces: Vec<Trace>,
}

impl Stream {
    pub fn new(traces: Vec<Trace>) -> Self {
        Self { traces }
    }

    pub fn len(&self) -> usize {
        self.traces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.traces.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Trace> {
        self.traces.iter()
    }

    pub fn first(&self) -> Option<&Trace> {
        self.traces.first()
    }

    /// Traces whose channel ends with `component`
    pub fn select(&self, component: &str) -> Stream {
        Stream::new(
            self.traces
                .iter()
                .filter(|t| t.channel.ends_with(component))
                .cloned()
                .collect(),
        )
    }

    /// Concatenate two streams, `self` first
    pub fn merged(&self, other: &Stream) -> Stream {
        let mut traces = self.traces.clone();
        traces.extend(other.traces.iter().cloned());
        Stream::new(traces)
    }

    /// Earliest start and latest end over all traces
    pub fn span(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let start = self.traces.iter().map(|t| t.starttime).min()?;
        let end = self.traces.iter().map(|t| t.endtime()).max()?;
        Some((start, end))
    }
}

impl IntoIterator for Stream {
    type Item = Trace;
    type IntoIter = std::vec::IntoIter<Trace>;

    fn into_iter(self) -> Self::IntoIter {
        self.traces.into_iter()
    }
}

/// Seconds from `a` to `b` (negative when `b` is earlier)
pub fn secs_between(a: DateTime<Utc>, b: DateTime<Utc>) -> f64 {
    let d = b - a;
    match d.num_nanoseconds() {
        Some(ns) => ns as f64 / 1e9,
        None => d.num_milliseconds() as f64 / 1e3,
    }
}

/// Convert fractional seconds into a chrono duration (nanosecond resolution)
pub fn duration_from_secs(secs: f64) -> Duration {
    Duration::nanoseconds((secs * 1e9).round() as i64)
}

/// Trim observed traces to the time span of the synthetics
///
/// Synthetics define the comparison span. Afterwards each component pair is cut
/// to a common sample count so windows index both traces identically.
pub fn trim_to_synthetic(observed: &mut Stream, synthetic: &mut Stream) {
    let Some((start, end)) = synthetic.span() else {
        return;
    };
    for trace in observed.traces.iter_mut() {
        trace.trim(start, end);
        trace.processing.push(format!("trim({}, {})", start, end));
    }
    observed.traces.retain(|t| !t.data.is_empty());

    for obs in observed.traces.iter_mut() {
        let Some(comp) = obs.component() else {
            continue;
        };
        if let Some(syn) = synthetic
            .traces
            .iter_mut()
            .find(|s| s.component() == Some(comp))
        {
            let n = obs.npts().min(syn.npts());
            obs.data.truncate(n);
            syn.data.truncate(n);
        }
    }
}
