//! Plain-text files exchanged with the wave-propagation solver
//!
//! - [`adjoint`]: two-column adjoint source files (`*.adj`)
//! - [`traces`]: two-column seismograms (`*.sem?`), read for local data and
//!   written for synthetics
//! - [`stations`]: the solver station list and its adjoint counterpart
//!
//! The scalar misfit file is a single value and lives here.

pub mod adjoint;
pub mod stations;
pub mod traces;

use std::path::Path;

use flowa_common::format::sci;

use crate::error::Result;

/// Band code of the SEED channel naming convention for a sampling interval
pub fn band_code(dt: f64) -> char {
    if dt >= 1.0 {
        'L'
    } else if dt > 0.1 {
        'M'
    } else if dt > 0.0125 {
        'B'
    } else if dt >= 0.001 {
        'H'
    } else if dt >= 0.0002 {
        'C'
    } else {
        'F'
    }
}

/// Write the event's scaled misfit as one `%11.6e` value
pub fn write_misfit(path: &Path, scaled_misfit: f64) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format!("{}\n", sci(scaled_misfit, 11, 6, false)))?;
    Ok(())
}
