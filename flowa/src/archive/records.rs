//! Auxiliary record payloads stored in the event archive
//!
//! Auxiliary records are keyed by
//! `(category, model, step, network, station, component, index)` and carry a
//! JSON payload. Two categories are written per processed station.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::waveform::{duration_from_secs, Trace};
use crate::models::{AdjointSource, Window};

/// Category for misfit windows
pub const MISFIT_WINDOWS: &str = "MisfitWindows";

/// Category for adjoint sources
pub const ADJOINT_SOURCES: &str = "AdjointSources";

/// One misfit window with absolute and relative timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowRecord {
    pub channel_id: String,
    pub left_index: usize,
    pub right_index: usize,
    pub dt: f64,
    /// Seconds after the first sample
    pub relative_starttime: f64,
    pub relative_endtime: f64,
    pub absolute_starttime: DateTime<Utc>,
    pub absolute_endtime: DateTime<Utc>,
    pub cc_shift_in_samples: i64,
    pub cc_shift_in_seconds: f64,
    pub dlna: f64,
    pub max_cc_value: f64,
    pub window_weight: f64,
    pub time_offset: f64,
}

impl WindowRecord {
    /// Describe `window` as measured on `trace`
    pub fn new(window: &Window, trace: &Trace, time_offset: f64) -> Self {
        let dt = trace.delta();
        let relative_starttime = window.start_time(dt);
        let relative_endtime = window.end_time(dt);
        Self {
            channel_id: trace.id(),
            left_index: window.left,
            right_index: window.right,
            dt,
            relative_starttime,
            relative_endtime,
            absolute_starttime: trace.starttime + duration_from_secs(relative_starttime),
            absolute_endtime: trace.starttime + duration_from_secs(relative_endtime),
            cc_shift_in_samples: window.cc_shift,
            cc_shift_in_seconds: window.cc_shift as f64 * dt,
            dlna: window.dlna,
            max_cc_value: window.max_cc_value,
            window_weight: window.weight,
            time_offset,
        }
    }

    pub fn to_window(&self) -> Window {
        Window {
            left: self.left_index,
            right: self.right_index,
            cc_shift: self.cc_shift_in_samples,
            dlna: self.dlna,
            max_cc_value: self.max_cc_value,
            weight: self.window_weight,
        }
    }
}

/// One adjoint source with its misfit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjointRecord {
    /// `NET.STA`
    pub station_id: String,
    pub channel: String,
    pub adj_src_type: String,
    pub dt: f64,
    pub misfit: f64,
    pub time_offset: f64,
    pub data: Vec<f64>,
}

impl AdjointRecord {
    pub fn new(source: &AdjointSource, time_offset: f64) -> Self {
        Self {
            station_id: format!("{}.{}", source.network, source.station),
            channel: source.channel.clone(),
            adj_src_type: source.adj_src_type.clone(),
            dt: source.dt,
            misfit: source.misfit,
            time_offset,
            data: source.data.clone(),
        }
    }
}

/// A keyed auxiliary record ready to be written
#[derive(Debug, Clone, PartialEq)]
pub struct AuxRecord {
    pub category: &'static str,
    pub component: String,
    pub index: u32,
    pub payload: serde_json::Value,
}

/// An auxiliary record read back from the archive
#[derive(Debug, Clone, PartialEq)]
pub struct AuxEntry {
    pub category: String,
    pub model: String,
    pub step: String,
    pub network: String,
    pub station: String,
    pub component: String,
    pub index: u32,
    pub payload: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_window_record_timing() {
        let trace = Trace {
            network: "NZ".into(),
            station: "BFZ".into(),
            location: "10".into(),
            channel: "HHZ".into(),
            starttime: Utc.with_ymd_and_hms(2018, 2, 18, 7, 43, 28).unwrap(),
            sampling_rate: 20.0,
            data: vec![0.0; 4000],
            processing: vec![],
        };
        let window = Window {
            left: 200,
            right: 600,
            cc_shift: -4,
            dlna: 0.1,
            max_cc_value: 0.93,
            weight: 2.5,
        };

        let record = WindowRecord::new(&window, &trace, -20.0);
        assert_eq!(record.channel_id, "NZ.BFZ.10.HHZ");
        assert!((record.relative_starttime - 10.0).abs() < 1e-12);
        assert!((record.relative_endtime - 30.0).abs() < 1e-12);
        assert!((record.cc_shift_in_seconds + 0.2).abs() < 1e-12);
        assert_eq!(
            record.absolute_starttime,
            Utc.with_ymd_and_hms(2018, 2, 18, 7, 43, 38).unwrap()
        );
        assert_eq!(record.to_window(), window);
    }
}
