//! Solver station lists
//!
//! One station per line: `STA NET LAT LON ELEVATION BURIAL`, whitespace
//! delimited. Note the station name comes before the network.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use crate::error::{FlowaError, Result};
use crate::models::StationMetadata;

/// Suffix appended to the station list name for the adjoint list
pub const ADJOINT_SUFFIX: &str = "_ADJOINT";

/// One station list entry
#[derive(Debug, Clone, PartialEq)]
pub struct StationEntry {
    pub station: String,
    pub network: String,
    pub latitude: f64,
    pub longitude: f64,
    pub elevation: f64,
    pub burial: f64,
}

impl StationEntry {
    pub fn net_sta(&self) -> String {
        format!("{}.{}", self.network, self.station)
    }

    /// Minimal station metadata from coordinates only
    pub fn to_metadata(&self) -> StationMetadata {
        StationMetadata {
            network: self.network.clone(),
            station: self.station.clone(),
            latitude: self.latitude,
            longitude: self.longitude,
            elevation_m: self.elevation,
            burial_m: self.burial,
            channels: Vec::new(),
        }
    }
}

/// Parse one line; blank lines yield `None`
pub fn parse_line(line: &str) -> std::result::Result<Option<StationEntry>, String> {
    let cols: Vec<&str> = line.split_whitespace().collect();
    if cols.is_empty() {
        return Ok(None);
    }
    if cols.len() < 6 {
        return Err(format!("expected 6 columns, got {}", cols.len()));
    }
    let num = |i: usize| -> std::result::Result<f64, String> {
        cols[i]
            .parse::<f64>()
            .map_err(|e| format!("column {}: {}", i + 1, e))
    };
    Ok(Some(StationEntry {
        station: cols[0].to_string(),
        network: cols[1].to_string(),
        latitude: num(2)?,
        longitude: num(3)?,
        elevation: num(4)?,
        burial: num(5)?,
    }))
}

/// Read a station list
pub fn read_stations_file(path: &Path) -> Result<Vec<StationEntry>> {
    let content = std::fs::read_to_string(path)?;
    let mut entries = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let entry = parse_line(line).map_err(|e| {
            FlowaError::Parse(format!("{} line {}: {}", path.display(), lineno + 1, e))
        })?;
        entries.extend(entry);
    }
    Ok(entries)
}

/// Path of the adjoint list written next to `stations_file`
pub fn adjoint_stations_path(stations_file: &Path) -> PathBuf {
    let mut name = stations_file
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(ADJOINT_SUFFIX);
    stations_file.with_file_name(name)
}

/// `(NET, STA)` pairs that have at least one `*.adj` file in `adj_dir`
pub fn stations_with_adjoint_sources(adj_dir: &Path) -> Result<BTreeSet<(String, String)>> {
    let mut found = BTreeSet::new();
    if !adj_dir.is_dir() {
        return Ok(found);
    }
    for entry in std::fs::read_dir(adj_dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("adj") {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let mut parts = name.split('.');
        if let (Some(net), Some(sta)) = (parts.next(), parts.next()) {
            found.insert((net.to_string(), sta.to_string()));
        }
    }
    Ok(found)
}

/// Rewrite the station list keeping only stations with adjoint sources
///
/// Lines are copied unchanged. Returns the number of stations written.
pub fn write_stations_adjoint(stations_file: &Path, adj_dir: &Path, output: &Path) -> Result<usize> {
    let keep = stations_with_adjoint_sources(adj_dir)?;
    let content = std::fs::read_to_string(stations_file)?;

    let mut out = String::new();
    let mut written = 0;
    for line in content.lines() {
        let cols: Vec<&str> = line.split_whitespace().collect();
        if cols.len() < 2 {
            continue;
        }
        if keep.contains(&(cols[1].to_string(), cols[0].to_string())) {
            out.push_str(line);
            out.push('\n');
            written += 1;
        }
    }
    std::fs::write(output, out)?;
    Ok(written)
}
