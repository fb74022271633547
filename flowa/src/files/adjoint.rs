//! Two-column adjoint source files
//!
//! Rows are `time      amplitude`, time in fixed notation and amplitude in
//! exponent notation, each 13 characters wide with six spaces between. An
//! exact zero in either column is written as the integer `0`.

use std::fmt::Write as _;
use std::path::Path;

use flowa_common::format::sci;

use crate::error::{FlowaError, Result};

/// `NET.STA.{band}X{comp}.adj`
pub fn adjoint_file_name(network: &str, station: &str, band: char, component: &str) -> String {
    format!("{}.{}.{}X{}.adj", network, station, band, component)
}

/// Format one row
pub fn format_row(time: f64, amplitude: f64) -> String {
    if time == 0.0 && amplitude != 0.0 {
        format!("{:>13}      {}", 0, sci(amplitude, 13, 6, true))
    } else if time != 0.0 && amplitude == 0.0 {
        format!("{:>13.6}      {:>13}", time, 0)
    } else {
        format!("{:>13.6}      {}", time, sci(amplitude, 13, 6, true))
    }
}

/// Write an adjoint source file
pub fn write_adjoint(path: &Path, times: &[f64], amplitudes: &[f64]) -> Result<()> {
    if times.len() != amplitudes.len() {
        return Err(FlowaError::Parse(format!(
            "{}: {} times but {} amplitudes",
            path.display(),
            times.len(),
            amplitudes.len()
        )));
    }

    let mut out = String::with_capacity(times.len() * 34);
    for (t, a) in times.iter().zip(amplitudes) {
        // Infallible for String
        let _ = writeln!(out, "{}", format_row(*t, *a));
    }
    std::fs::write(path, out)?;
    Ok(())
}

/// Remove every `*.adj` file in `dir`, returning how many went
///
/// A missing directory has nothing to remove.
pub fn clear_adjoint_sources(dir: &Path) -> Result<usize> {
    if !dir.is_dir() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("adj") {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Read any two-column numeric text file
pub fn read_two_column(path: &Path) -> Result<(Vec<f64>, Vec<f64>)> {
    let content = std::fs::read_to_string(path)?;
    parse_two_column(&content)
        .map_err(|e| FlowaError::Parse(format!("{}: {}", path.display(), e)))
}

pub(crate) fn parse_two_column(content: &str) -> std::result::Result<(Vec<f64>, Vec<f64>), String> {
    let mut times = Vec::new();
    let mut values = Vec::new();
    for (lineno, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut cols = line.split_whitespace();
        let (Some(t), Some(v)) = (cols.next(), cols.next()) else {
            return Err(format!("line {}: expected two columns", lineno + 1));
        };
        let t: f64 = t
            .parse()
            .map_err(|e| format!("line {}: {}", lineno + 1, e))?;
        let v: f64 = v
            .parse()
            .map_err(|e| format!("line {}: {}", lineno + 1, e))?;
        times.push(t);
        values.push(v);
    }
    Ok((times, values))
}
