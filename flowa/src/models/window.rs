//! Misfit windows and adjoint sources

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One misfit window on a component, in sample indices of the processed traces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Window {
    /// First sample index (inclusive)
    pub left: usize,
    /// Last sample index (inclusive)
    pub right: usize,
    /// Cross-correlation time shift in samples
    pub cc_shift: i64,
    /// Amplitude ratio `ln(A_obs / A_syn)`
    pub dlna: f64,
    /// Maximum normalized cross-correlation value
    pub max_cc_value: f64,
    /// Relative weight of the window
    pub weight: f64,
}

impl Window {
    /// Window start relative to the first sample, in seconds
    pub fn start_time(&self, dt: f64) -> f64 {
        self.left as f64 * dt
    }

    /// Window end relative to the first sample, in seconds
    pub fn end_time(&self, dt: f64) -> f64 {
        self.right as f64 * dt
    }
}

/// Component letter → ordered windows. Components with no windows map to an
/// empty list.
pub type WindowSet = BTreeMap<String, Vec<Window>>;

/// Total number of windows in a set
pub fn count_windows(windows: &WindowSet) -> usize {
    windows.values().map(Vec::len).sum()
}

/// Adjoint time series for one component
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdjointSource {
    /// Misfit functional that produced this source
    pub adj_src_type: String,
    pub network: String,
    pub station: String,
    #[serde(default)]
    pub location: String,
    /// Full channel code of the synthetic, e.g. `BXZ`
    pub channel: String,
    /// Sampling interval in seconds
    pub dt: f64,
    pub data: Vec<f64>,
    pub misfit: f64,
}

impl AdjointSource {
    pub fn component(&self) -> Option<char> {
        self.channel.chars().last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn window(left: usize, right: usize) -> Window {
        Window {
            left,
            right,
            cc_shift: 0,
            dlna: 0.0,
            max_cc_value: 1.0,
            weight: 1.0,
        }
    }

    #[test]
    fn test_window_times() {
        let w = window(100, 250);
        assert!((w.start_time(0.05) - 5.0).abs() < 1e-12);
        assert!((w.end_time(0.05) - 12.5).abs() < 1e-12);
    }

    #[test]
    fn test_count_windows_with_empty_components() {
        let mut set = WindowSet::new();
        set.insert("N".into(), vec![]);
        set.insert("E".into(), vec![]);
        set.insert("Z".into(), vec![window(0, 10), window(20, 30)]);
        assert_eq!(count_windows(&set), 2);
    }
}
