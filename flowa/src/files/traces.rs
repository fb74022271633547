//! Two-column seismograms (`NET.STA.CHA.sem?`)
//!
//! The first column is time in seconds relative to the event origin, the
//! second the amplitude. The solver writes synthetics this way; local observed
//! data may be supplied in the same format.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use flowa_common::seed::wildcard_match;

use crate::error::{FlowaError, Result};
use crate::files::adjoint::read_two_column;
use crate::files::band_code;
use crate::models::waveform::duration_from_secs;
use crate::models::{Stream, Trace};

/// File name pattern for one station, e.g. `NZ.BFZ.*?.sem?` for channel `HH?`
pub fn trace_file_pattern(network: &str, station: &str, channel: &str) -> String {
    let component = channel.chars().last().unwrap_or('*');
    format!("{}.{}.*{}.sem?", network, station, component)
}

/// Matching files from the first root that has any
pub fn find_trace_files(roots: &[PathBuf], network: &str, station: &str, channel: &str) -> Result<Vec<PathBuf>> {
    let pattern = trace_file_pattern(network, station, channel);
    for root in roots {
        if !root.is_dir() {
            continue;
        }
        let mut matches = Vec::new();
        for entry in std::fs::read_dir(root)? {
            let path = entry?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if wildcard_match(&pattern, name) {
                matches.push(path);
            }
        }
        if !matches.is_empty() {
            matches.sort();
            return Ok(matches);
        }
    }
    Ok(Vec::new())
}

/// Read one file; times are relative to `origin_time`
pub fn read_trace_file(path: &Path, origin_time: DateTime<Utc>) -> Result<Trace> {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| FlowaError::Parse(format!("Bad trace file name: {}", path.display())))?;
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() != 4 {
        return Err(FlowaError::Parse(format!(
            "Trace file name must be NET.STA.CHA.sem?: {}",
            name
        )));
    }

    let (times, data) = read_two_column(path)?;
    trace_from_columns(parts[0], parts[1], parts[2], &times, data, origin_time)
        .map_err(|e| FlowaError::Parse(format!("{}: {}", path.display(), e)))
}

pub(crate) fn trace_from_columns(
    network: &str,
    station: &str,
    channel: &str,
    times: &[f64],
    data: Vec<f64>,
    origin_time: DateTime<Utc>,
) -> std::result::Result<Trace, String> {
    if times.len() < 2 {
        return Err("need at least two samples".to_string());
    }
    let dt = times[1] - times[0];
    if dt <= 0.0 {
        return Err(format!("non-increasing time column (dt = {})", dt));
    }
    Ok(Trace {
        network: network.to_string(),
        station: station.to_string(),
        location: String::new(),
        channel: channel.to_string(),
        starttime: origin_time + duration_from_secs(times[0]),
        sampling_rate: 1.0 / dt,
        data,
        processing: Vec::new(),
    })
}

/// Read every matching file into one stream
pub fn read_station_traces(
    roots: &[PathBuf],
    network: &str,
    station: &str,
    channel: &str,
    origin_time: DateTime<Utc>,
) -> Result<Option<Stream>> {
    let files = find_trace_files(roots, network, station, channel)?;
    if files.is_empty() {
        return Ok(None);
    }
    let traces = files
        .iter()
        .map(|f| read_trace_file(f, origin_time))
        .collect::<Result<Vec<_>>>()?;
    Ok(Some(Stream::new(traces)))
}

/// Write a stream as `NET.STA.{band}X{comp}.sem{unit}` files
///
/// `unit` is `d`, `v` or `a`. Times are shifted by `time_offset`, so a
/// negative offset makes the first time negative.
pub fn write_sem(stream: &Stream, unit: char, dir: &Path, time_offset: f64) -> Result<Vec<PathBuf>> {
    let unit = unit.to_ascii_lowercase();
    if !matches!(unit, 'd' | 'v' | 'a') {
        return Err(FlowaError::Config(format!(
            "sem unit must be 'd', 'v' or 'a', got '{}'",
            unit
        )));
    }
    std::fs::create_dir_all(dir)?;

    let mut written = Vec::new();
    for trace in stream.iter() {
        let component = trace.component().unwrap_or('X');
        let name = format!(
            "{}.{}.{}X{}.sem{}",
            trace.network,
            trace.station,
            band_code(trace.delta()),
            component,
            unit
        );
        let mut out = String::with_capacity(trace.npts() * 32);
        for (t, a) in trace.times().iter().zip(&trace.data) {
            out.push_str(&format!("{:13.7} {:17.7}\n", t + time_offset, a));
        }
        let path = dir.join(name);
        std::fs::write(&path, out)?;
        written.push(path);
    }
    Ok(written)
}
