//! Event and station metadata
//!
//! Events are read from CMTSOLUTION files (the moment-tensor format used by the
//! solver), from the archive, or from the remote data service. Station metadata
//! comes from response documents, the stations file or the remote service.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::models::waveform::duration_from_secs;

/// Moment tensor components in dyne-cm, plus source-time-function timing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MomentTensor {
    pub m_rr: f64,
    pub m_tt: f64,
    pub m_pp: f64,
    pub m_rt: f64,
    pub m_rp: f64,
    pub m_tp: f64,
    /// Half duration of the source time function in seconds
    #[serde(default)]
    pub half_duration: Option<f64>,
    /// Centroid time shift relative to the catalog origin in seconds
    #[serde(default)]
    pub time_shift: f64,
}

impl MomentTensor {
    /// Scalar seismic moment (dyne-cm)
    pub fn scalar_moment(&self) -> f64 {
        let diag = self.m_rr.powi(2) + self.m_tt.powi(2) + self.m_pp.powi(2);
        let off = self.m_rt.powi(2) + self.m_rp.powi(2) + self.m_tp.powi(2);
        ((diag + 2.0 * off) / 2.0).sqrt()
    }

    /// Moment magnitude from the scalar moment in dyne-cm
    pub fn moment_magnitude(&self) -> Option<f64> {
        let m0 = self.scalar_moment();
        if m0 > 0.0 {
            Some(2.0 / 3.0 * (m0.log10() - 16.1))
        } else {
            None
        }
    }
}

/// Earthquake source metadata, shared read-only by every station of an event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    /// Centroid origin time
    pub origin_time: DateTime<Utc>,
    pub latitude: f64,
    pub longitude: f64,
    pub depth_km: f64,
    #[serde(default)]
    pub magnitude: Option<f64>,
    #[serde(default)]
    pub moment_tensor: Option<MomentTensor>,
}

impl Event {
    /// Source-time-function duration, when a moment tensor provides one
    pub fn stf_duration(&self) -> Option<f64> {
        self.moment_tensor
            .as_ref()
            .and_then(|mt| mt.half_duration)
            .map(|h| 2.0 * h)
    }

    /// Read a CMTSOLUTION file
    pub fn from_cmtsolution_file(path: &Path) -> Result<Self, MetadataError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MetadataError::Parse(format!("{}: {}", path.display(), e)))?;
        Self::from_cmtsolution(&content)
    }

    /// Parse CMTSOLUTION text
    ///
    /// The first line holds the catalog hypocenter. The origin time used here is
    /// the centroid time (catalog time plus `time shift`).
    pub fn from_cmtsolution(content: &str) -> Result<Self, MetadataError> {
        let mut lines = content.lines().filter(|l| !l.trim().is_empty());
        let header = lines
            .next()
            .ok_or_else(|| MetadataError::Parse("empty CMTSOLUTION".to_string()))?;
        let catalog_time = parse_pde_time(header)?;

        let mut fields = std::collections::HashMap::new();
        for line in lines {
            if let Some((key, value)) = line.split_once(':') {
                fields.insert(key.trim().to_lowercase(), value.trim().to_string());
            }
        }

        let get = |key: &str| -> Result<f64, MetadataError> {
            fields
                .get(key)
                .ok_or_else(|| MetadataError::Parse(format!("CMTSOLUTION missing '{}'", key)))?
                .parse::<f64>()
                .map_err(|e| MetadataError::Parse(format!("CMTSOLUTION '{}': {}", key, e)))
        };

        let event_id = fields
            .get("event name")
            .cloned()
            .ok_or_else(|| MetadataError::Parse("CMTSOLUTION missing 'event name'".to_string()))?;
        let time_shift = get("time shift")?;
        let half_duration = get("half duration").ok().filter(|h| *h > 0.0);

        let moment_tensor = MomentTensor {
            m_rr: get("mrr")?,
            m_tt: get("mtt")?,
            m_pp: get("mpp")?,
            m_rt: get("mrt")?,
            m_rp: get("mrp")?,
            m_tp: get("mtp")?,
            half_duration,
            time_shift,
        };

        Ok(Self {
            event_id,
            origin_time: catalog_time + duration_from_secs(time_shift),
            latitude: get("latitude")?,
            longitude: get("longitude")?,
            depth_km: get("depth")?,
            magnitude: moment_tensor.moment_magnitude(),
            moment_tensor: Some(moment_tensor),
        })
    }
}

/// `PDE 2018 02 18 07 43 48.00 -40.0 176.0 20.0 4.2 4.2 REGION`
fn parse_pde_time(header: &str) -> Result<DateTime<Utc>, MetadataError> {
    let mut tokens: Vec<&str> = header.split_whitespace().collect();
    // Catalog label may be a separate token ("PDE") or glued to the year ("PDE2018")
    if let Some(first) = tokens.first().copied() {
        if first.chars().all(|c| c.is_ascii_alphabetic()) {
            tokens.remove(0);
        } else if first.chars().next().is_some_and(|c| c.is_ascii_alphabetic()) {
            tokens[0] = first.trim_start_matches(|c: char| c.is_ascii_alphabetic());
        }
    }
    if tokens.len() < 6 {
        return Err(MetadataError::Parse(format!(
            "CMTSOLUTION header too short: '{}'",
            header
        )));
    }

    let int = |s: &str| -> Result<u32, MetadataError> {
        s.parse::<u32>()
            .map_err(|e| MetadataError::Parse(format!("CMTSOLUTION header '{}': {}", s, e)))
    };
    let year = tokens[0]
        .parse::<i32>()
        .map_err(|e| MetadataError::Parse(format!("CMTSOLUTION year: {}", e)))?;
    let seconds: f64 = tokens[5]
        .parse()
        .map_err(|e| MetadataError::Parse(format!("CMTSOLUTION seconds: {}", e)))?;

    let (month, day) = (int(tokens[1])?, int(tokens[2])?);
    let (hour, minute) = (int(tokens[3])?, int(tokens[4])?);

    let naive = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, 0))
        .ok_or_else(|| MetadataError::Parse(format!("Invalid date in '{}'", header)))?;

    Ok(naive.and_utc() + duration_from_secs(seconds))
}

/// One channel of a station's response metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelInfo {
    #[serde(default)]
    pub location: String,
    pub channel: String,
    #[serde(default)]
    pub azimuth: f64,
    #[serde(default)]
    pub dip: f64,
    #[serde(default)]
    pub sampling_rate: Option<f64>,
    /// Overall sensitivity used for instrument correction
    #[serde(default)]
    pub sensitivity: Option<f64>,
}

/// Station metadata (inventory)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StationMetadata {
    pub network: String,
    pub station: String,
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub elevation_m: f64,
    #[serde(default)]
    pub burial_m: f64,
    #[serde(default)]
    pub channels: Vec<ChannelInfo>,
}

impl StationMetadata {
    pub fn net_sta(&self) -> String {
        format!("{}.{}", self.network, self.station)
    }

    /// Back azimuth from station to event in degrees, on a sphere
    pub fn back_azimuth(&self, event: &Event) -> f64 {
        let (lat1, lon1) = (self.latitude.to_radians(), self.longitude.to_radians());
        let (lat2, lon2) = (event.latitude.to_radians(), event.longitude.to_radians());
        let dlon = lon2 - lon1;
        let y = dlon.sin() * lat2.cos();
        let x = lat1.cos() * lat2.sin() - lat1.sin() * lat2.cos() * dlon.cos();
        (y.atan2(x).to_degrees() + 360.0) % 360.0
    }
}

/// Metadata parsing errors
#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("Metadata parse error: {0}")]
    Parse(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    const CMTSOLUTION: &str = "\
 PDE 2018 02 18 07 43 48.00 -40.0000 176.0000  20.0 4.2 4.2 NEW ZEALAND
event name:     2018p130600
time shift:      1.5000
half duration:   0.6000
latitude:      -39.9490
longitude:     176.2995
depth:          20.5900
Mrr:       -2.479380e+22
Mtt:        1.050640e+23
Mpp:       -8.026830e+22
Mrt:        1.184060e+22
Mrp:        1.065860e+22
Mtp:        3.321810e+22
";

    #[test]
    fn test_parse_cmtsolution() {
        let event = Event::from_cmtsolution(CMTSOLUTION).unwrap();
        assert_eq!(event.event_id, "2018p130600");
        assert!((event.latitude + 39.949).abs() < 1e-9);
        assert!((event.depth_km - 20.59).abs() < 1e-9);

        let expected = Utc.with_ymd_and_hms(2018, 2, 18, 7, 43, 49).unwrap();
        assert_eq!(event.origin_time.with_nanosecond(0).unwrap(), expected);
        assert_eq!(event.origin_time.nanosecond(), 500_000_000);

        assert_eq!(event.stf_duration(), Some(1.2));
        let mw = event.magnitude.unwrap();
        assert!(mw > 4.0 && mw < 5.0, "Mw = {}", mw);
    }

    #[test]
    fn test_zero_half_duration_is_unknown() {
        let text = CMTSOLUTION.replace("half duration:   0.6000", "half duration:   0.0000");
        let event = Event::from_cmtsolution(&text).unwrap();
        assert_eq!(event.stf_duration(), None);
    }

    #[test]
    fn test_glued_catalog_label() {
        let text = CMTSOLUTION.replace(" PDE 2018", "PDEW2018");
        assert!(Event::from_cmtsolution(&text).is_ok());
    }

    #[test]
    fn test_missing_field_is_error() {
        let text = CMTSOLUTION.replace("Mrr:       -2.479380e+22\n", "");
        assert!(Event::from_cmtsolution(&text).is_err());
    }

    #[test]
    fn test_back_azimuth_due_north() {
        let event = Event::from_cmtsolution(CMTSOLUTION).unwrap();
        let sta = StationMetadata {
            network: "NZ".into(),
            station: "XX".into(),
            latitude: event.latitude - 1.0,
            longitude: event.longitude,
            elevation_m: 0.0,
            burial_m: 0.0,
            channels: vec![],
        };
        assert!(sta.back_azimuth(&event).abs() < 1e-6);
    }
}
