//! SEED station codes
//!
//! Station codes follow the `NET.STA.LOC.CHA` convention. Every part may contain
//! the wildcards `*` (any run of characters) and `?` (exactly one character).
//! Shorter codes are accepted and padded with `*`, so `NZ.BFZ` means
//! `NZ.BFZ.*.*`.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Parsed SEED station code
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StationCode {
    pub network: String,
    pub station: String,
    pub location: String,
    pub channel: String,
}

impl StationCode {
    /// Build a code from its four parts
    pub fn new(network: &str, station: &str, location: &str, channel: &str) -> Self {
        Self {
            network: network.to_string(),
            station: station.to_string(),
            location: location.to_string(),
            channel: channel.to_string(),
        }
    }

    /// `NET.STA` part of the code
    pub fn net_sta(&self) -> String {
        format!("{}.{}", self.network, self.station)
    }

    /// Component letter requested by the channel part, if it is not a wildcard
    pub fn component(&self) -> Option<char> {
        match self.channel.chars().last() {
            Some('*') | Some('?') | None => None,
            Some(c) => Some(c),
        }
    }

    /// True when the network and station parts contain no wildcards
    pub fn is_station_specific(&self) -> bool {
        !has_wildcard(&self.network) && !has_wildcard(&self.station)
    }

    /// Check a concrete trace identity against this (possibly wildcarded) code
    pub fn matches(&self, network: &str, station: &str, location: &str, channel: &str) -> bool {
        wildcard_match(&self.network, network)
            && wildcard_match(&self.station, station)
            && wildcard_match(&self.location, location)
            && wildcard_match(&self.channel, channel)
    }
}

impl FromStr for StationCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.is_empty() || parts.len() > 4 || parts.iter().take(2).any(|p| p.is_empty()) {
            return Err(Error::InvalidInput(format!(
                "Station code must look like NET.STA[.LOC[.CHA]], got '{}'",
                s
            )));
        }
        if parts.len() < 2 {
            return Err(Error::InvalidInput(format!(
                "Station code '{}' is missing the station part",
                s
            )));
        }

        let location = parts.get(2).copied().unwrap_or("*");
        let channel = parts.get(3).copied().unwrap_or("*");
        Ok(Self::new(parts[0], parts[1], location, channel))
    }
}

impl fmt::Display for StationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.network, self.station, self.location, self.channel
        )
    }
}

fn has_wildcard(s: &str) -> bool {
    s.contains('*') || s.contains('?')
}

/// Glob-style match supporting `*` and `?`
pub fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();

    // Iterative matcher with single-star backtracking
    let (mut pi, mut ti) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_code() {
        let code: StationCode = "NZ.BFZ.10.HH?".parse().unwrap();
        assert_eq!(code.network, "NZ");
        assert_eq!(code.station, "BFZ");
        assert_eq!(code.location, "10");
        assert_eq!(code.channel, "HH?");
        assert_eq!(code.component(), None);
        assert_eq!(code.to_string(), "NZ.BFZ.10.HH?");
    }

    #[test]
    fn test_parse_short_code_pads_wildcards() {
        let code: StationCode = "NZ.BFZ".parse().unwrap();
        assert_eq!(code.location, "*");
        assert_eq!(code.channel, "*");
        assert_eq!(code.net_sta(), "NZ.BFZ");
        assert!(code.is_station_specific());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("NZ".parse::<StationCode>().is_err());
        assert!(".BFZ".parse::<StationCode>().is_err());
        assert!("A.B.C.D.E".parse::<StationCode>().is_err());
    }

    #[test]
    fn test_component_letter() {
        let code: StationCode = "NZ.BFZ.*.HHZ".parse().unwrap();
        assert_eq!(code.component(), Some('Z'));
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("HH?", "HHZ"));
        assert!(!wildcard_match("HH?", "HHZZ"));
        assert!(wildcard_match("*", ""));
        assert!(wildcard_match("B*Z", "BXZ"));
        assert!(wildcard_match("*X?", "BXN"));
        assert!(!wildcard_match("BX?", "HHZ"));
    }

    #[test]
    fn test_code_matches_trace() {
        let code: StationCode = "NZ.BFZ.*.HH?".parse().unwrap();
        assert!(code.matches("NZ", "BFZ", "10", "HHE"));
        assert!(code.matches("NZ", "BFZ", "", "HHN"));
        assert!(!code.matches("NZ", "KNZ", "10", "HHE"));
    }
}
