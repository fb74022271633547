//! Data gathering with a fixed fallback order
//!
//! | Data | 1st | 2nd | 3rd | 4th |
//! |---|---|---|---|---|
//! | event | archive | CMTSOLUTION file | remote | |
//! | station metadata | archive | `NET.STA.json` in response roots | stations file | remote |
//! | observed | archive | `NET.STA.*CHA.sem?` in waveform roots | remote | |
//! | synthetic | archive | `NET.STA.*CHA.sem?` in synthetic roots | | |
//!
//! For multi-root roles the first root with matching files wins. Anything
//! found outside the archive is saved into it. The event is resolved once and
//! cached for the lifetime of the gatherer.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use flowa_common::StationCode;

use crate::archive::{synthetic_tag, Archive, OBSERVED_TAG};
use crate::error::ManagerError;
use crate::files::stations::read_stations_file;
use crate::files::traces::read_station_traces;
use crate::models::waveform::duration_from_secs;
use crate::models::{Event, StationMetadata, Stream};
use crate::services::RemoteClient;

/// Where the gatherer may look, resolved once per event
#[derive(Debug, Clone, Default)]
pub struct GatherSources {
    pub event_id: String,
    pub event_file: Option<PathBuf>,
    pub stations_file: Option<PathBuf>,
    pub responses: Vec<PathBuf>,
    pub waveforms: Vec<PathBuf>,
    pub synthetics: Vec<PathBuf>,
    pub archive: Option<Arc<Archive>>,
    /// Only set for the first evaluation of an inversion
    pub client: Option<RemoteClient>,
    pub model: String,
    pub step: String,
    /// Extra time requested around the synthetic span for remote waveforms
    pub pad_length_s: f64,
}

/// Resolves station codes to data
#[derive(Debug)]
pub struct Gatherer {
    sources: GatherSources,
    event: Option<Arc<Event>>,
}

type GatherResult<T> = std::result::Result<T, ManagerError>;

impl Gatherer {
    pub fn new(sources: GatherSources) -> Self {
        Self {
            sources,
            event: None,
        }
    }

    pub fn sources(&self) -> &GatherSources {
        &self.sources
    }

    /// The cached event, if it has been resolved
    pub fn cached_event(&self) -> Option<&Arc<Event>> {
        self.event.as_ref()
    }

    /// Event metadata, resolved on first use
    pub async fn gather_event(&mut self) -> GatherResult<Arc<Event>> {
        if let Some(event) = &self.event {
            return Ok(Arc::clone(event));
        }

        let event_id = self.sources.event_id.clone();
        let event = match self.event_from_archive(&event_id).await {
            Some(event) => event,
            None => {
                let event = match self.event_from_file() {
                    Some(event) => event,
                    None => self.event_from_remote(&event_id).await.ok_or_else(|| {
                        ManagerError::Gather(format!("No event metadata found for {}", event_id))
                    })?,
                };
                self.save_event(&event).await;
                event
            }
        };

        info!(event = %event.event_id, origin = %event.origin_time, "Event resolved");
        let event = Arc::new(event);
        self.event = Some(Arc::clone(&event));
        Ok(event)
    }

    async fn event_from_archive(&self, event_id: &str) -> Option<Event> {
        let archive = self.sources.archive.as_ref()?;
        match archive.read_event(event_id).await {
            Ok(found) => found,
            Err(e) => {
                warn!(event = %event_id, "Archive event lookup failed: {}", e);
                None
            }
        }
    }

    fn event_from_file(&self) -> Option<Event> {
        let path = self.sources.event_file.as_ref()?;
        if !path.exists() {
            return None;
        }
        match Event::from_cmtsolution_file(path) {
            Ok(event) => {
                debug!("Event read from {}", path.display());
                Some(event)
            }
            Err(e) => {
                warn!("{}", e);
                None
            }
        }
    }

    async fn event_from_remote(&self, event_id: &str) -> Option<Event> {
        let client = self.sources.client.as_ref()?;
        match client.get_event(event_id).await {
            Ok(event) => Some(event),
            Err(e) => {
                warn!(event = %event_id, "Remote event lookup failed: {}", e);
                None
            }
        }
    }

    async fn save_event(&self, event: &Event) {
        if let Some(archive) = &self.sources.archive {
            if let Err(e) = archive.write_event(event).await {
                warn!(event = %event.event_id, "Saving event to archive failed: {}", e);
            }
        }
    }

    /// Station metadata for the station part of `code`
    pub async fn gather_station(&self, code: &StationCode) -> GatherResult<StationMetadata> {
        let (net, sta) = (code.network.as_str(), code.station.as_str());

        if let Some(archive) = &self.sources.archive {
            match archive.read_station(net, sta).await {
                Ok(Some(found)) => return Ok(found),
                Ok(None) => {}
                Err(e) => warn!(station = %code.net_sta(), "Archive station lookup failed: {}", e),
            }
        }

        let found = match self.station_from_responses(net, sta) {
            Some(found) => Some(found),
            None => match self.station_from_stations_file(net, sta) {
                Some(found) => Some(found),
                None => self.station_from_remote(net, sta).await,
            },
        };
        let found = found.ok_or_else(|| {
            ManagerError::Gather(format!("No station metadata found for {}", code.net_sta()))
        })?;

        if let Some(archive) = &self.sources.archive {
            if let Err(e) = archive.write_station(&found).await {
                warn!(station = %code.net_sta(), "Saving station to archive failed: {}", e);
            }
        }
        Ok(found)
    }

    fn station_from_responses(&self, net: &str, sta: &str) -> Option<StationMetadata> {
        let name = format!("{}.{}.json", net, sta);
        let path = self
            .sources
            .responses
            .iter()
            .map(|root| root.join(&name))
            .find(|p| p.is_file())?;

        let parsed = std::fs::read_to_string(&path)
            .map_err(|e| e.to_string())
            .and_then(|text| serde_json::from_str::<StationMetadata>(&text).map_err(|e| e.to_string()));
        match parsed {
            Ok(found) => Some(found),
            Err(e) => {
                warn!("Response document {} unreadable: {}", path.display(), e);
                None
            }
        }
    }

    fn station_from_stations_file(&self, net: &str, sta: &str) -> Option<StationMetadata> {
        let path = self.sources.stations_file.as_ref()?;
        let entries = match read_stations_file(path) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("{}", e);
                return None;
            }
        };
        entries
            .into_iter()
            .find(|e| e.network == net && e.station == sta)
            .map(|e| e.to_metadata())
    }

    async fn station_from_remote(&self, net: &str, sta: &str) -> Option<StationMetadata> {
        let client = self.sources.client.as_ref()?;
        match client.get_station(net, sta).await {
            Ok(found) => Some(found),
            Err(e) => {
                warn!(station = %format!("{}.{}", net, sta), "Remote station lookup failed: {}", e);
                None
            }
        }
    }

    /// Observed waveforms matching `code`
    ///
    /// `span` is the time range of the synthetics, used to size remote
    /// requests.
    pub async fn gather_observed(
        &self,
        code: &StationCode,
        origin_time: DateTime<Utc>,
        span: Option<(DateTime<Utc>, DateTime<Utc>)>,
    ) -> GatherResult<Stream> {
        let (net, sta) = (code.network.as_str(), code.station.as_str());

        if let Some(found) = self.waveforms_from_archive(code, OBSERVED_TAG).await {
            return Ok(select_observed(found, code));
        }

        let local = self.waveforms_from_roots(&self.sources.waveforms, code, origin_time);
        let found = match local {
            Some(found) => Some(found),
            None => match (&self.sources.client, span) {
                (Some(client), Some((start, end))) => {
                    let pad = duration_from_secs(self.sources.pad_length_s);
                    match client
                        .get_waveforms(net, sta, &code.channel, start - pad, end + pad)
                        .await
                    {
                        Ok(found) => Some(found),
                        Err(e) => {
                            warn!(station = %code.net_sta(), "Remote waveform lookup failed: {}", e);
                            None
                        }
                    }
                }
                _ => None,
            },
        };

        let found = found
            .map(|st| select_observed(st, code))
            .filter(|st| !st.is_empty())
            .ok_or_else(|| {
                ManagerError::Gather(format!("No observed waveforms found for {}", code))
            })?;
        self.save_waveforms(code, OBSERVED_TAG, &found).await;
        Ok(found)
    }

    /// Synthetic waveforms of the current evaluation
    pub async fn gather_synthetic(&self, code: &StationCode, origin_time: DateTime<Utc>) -> GatherResult<Stream> {
        let tag = synthetic_tag(&self.sources.model, &self.sources.step);

        if let Some(found) = self.waveforms_from_archive(code, &tag).await {
            return Ok(select_synthetic(found, code));
        }

        let found = self
            .waveforms_from_roots(&self.sources.synthetics, code, origin_time)
            .map(|st| select_synthetic(st, code))
            .filter(|st| !st.is_empty())
            .ok_or_else(|| {
                ManagerError::Gather(format!("No synthetic waveforms found for {}", code))
            })?;
        self.save_waveforms(code, &tag, &found).await;
        Ok(found)
    }

    async fn waveforms_from_archive(&self, code: &StationCode, tag: &str) -> Option<Stream> {
        let archive = self.sources.archive.as_ref()?;
        match archive
            .read_waveforms(&code.network, &code.station, tag)
            .await
        {
            Ok(found) => found,
            Err(e) => {
                warn!(station = %code.net_sta(), tag, "Archive waveform lookup failed: {}", e);
                None
            }
        }
    }

    fn waveforms_from_roots(&self, roots: &[PathBuf], code: &StationCode, origin_time: DateTime<Utc>) -> Option<Stream> {
        match read_station_traces(roots, &code.network, &code.station, &code.channel, origin_time) {
            Ok(found) => found,
            Err(e) => {
                warn!(station = %code.net_sta(), "Local waveform read failed: {}", e);
                None
            }
        }
    }

    async fn save_waveforms(&self, code: &StationCode, tag: &str, stream: &Stream) {
        if let Some(archive) = &self.sources.archive {
            if let Err(e) = archive
                .write_waveforms(&code.network, &code.station, tag, stream)
                .await
            {
                warn!(station = %code.net_sta(), tag, "Saving waveforms to archive failed: {}", e);
            }
        }
    }
}

/// Observed traces must match the full code
fn select_observed(stream: Stream, code: &StationCode) -> Stream {
    Stream::new(
        stream
            .into_iter()
            .filter(|t| code.matches(&t.network, &t.station, &t.location, &t.channel))
            .collect(),
    )
}

/// Synthetic channel names follow the solver's band code, so only the
/// component is compared
fn select_synthetic(stream: Stream, code: &StationCode) -> Stream {
    let wanted = code.channel.chars().last();
    Stream::new(
        stream
            .into_iter()
            .filter(|t| {
                t.network == code.network
                    && t.station == code.station
                    && match wanted {
                        Some('*') | Some('?') | None => true,
                        Some(c) => t.component() == Some(c),
                    }
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    const CMT: &str = "\
 PDE 2018 02 18 07 43 48.00 -40.0000 176.0000  20.0 4.2 4.2 NEW ZEALAND
event name:     2018p130600
time shift:      0.0000
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

    fn write_trace(dir: &Path, name: &str) {
        let body: String = (0..40)
            .map(|i| format!("{:.4} {:.6}\n", -20.0 + i as f64 * 0.05, (i as f64).sin()))
            .collect();
        std::fs::write(dir.join(name), body).unwrap();
    }

    fn sources(root: &Path) -> GatherSources {
        let cmt = root.join("CMTSOLUTION");
        std::fs::write(&cmt, CMT).unwrap();
        let stations = root.join("STATIONS");
        std::fs::write(&stations, "BFZ NZ -40.6796 176.2462 283.0 0.0\n").unwrap();
        let obs = root.join("obs");
        let syn = root.join("syn");
        std::fs::create_dir_all(&obs).unwrap();
        std::fs::create_dir_all(&syn).unwrap();
        for c in ["N", "E", "Z"] {
            write_trace(&obs, &format!("NZ.BFZ.HH{}.semd", c));
            write_trace(&syn, &format!("NZ.BFZ.BX{}.semd", c));
        }
        GatherSources {
            event_id: "2018p130600".into(),
            event_file: Some(cmt),
            stations_file: Some(stations),
            responses: vec![root.join("responses")],
            waveforms: vec![obs],
            synthetics: vec![syn],
            archive: None,
            client: None,
            model: "m00".into(),
            step: "s00".into(),
            pad_length_s: 20.0,
        }
    }

    #[tokio::test]
    async fn test_local_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let mut gatherer = Gatherer::new(sources(dir.path()));
        let code: StationCode = "NZ.BFZ.*.HH?".parse().unwrap();

        let event = gatherer.gather_event().await.unwrap();
        assert_eq!(event.event_id, "2018p130600");

        let inv = gatherer.gather_station(&code).await.unwrap();
        assert_eq!(inv.net_sta(), "NZ.BFZ");

        let syn = gatherer.gather_synthetic(&code, event.origin_time).await.unwrap();
        assert_eq!(syn.len(), 3);
        let obs = gatherer
            .gather_observed(&code, event.origin_time, syn.span())
            .await
            .unwrap();
        assert_eq!(obs.len(), 3);
    }

    #[tokio::test]
    async fn test_event_is_cached() {
        let dir = tempfile::tempdir().unwrap();
        let src = sources(dir.path());
        let cmt = src.event_file.clone().unwrap();
        let mut gatherer = Gatherer::new(src);

        gatherer.gather_event().await.unwrap();
        std::fs::remove_file(cmt).unwrap();
        assert!(gatherer.gather_event().await.is_ok());

        let mut fresh = Gatherer::new(gatherer.sources().clone());
        assert!(matches!(fresh.gather_event().await, Err(ManagerError::Gather(_))));
    }

    #[tokio::test]
    async fn test_component_code_selects_one_trace() {
        let dir = tempfile::tempdir().unwrap();
        let mut gatherer = Gatherer::new(sources(dir.path()));
        let code: StationCode = "NZ.BFZ.*.HHZ".parse().unwrap();
        let event = gatherer.gather_event().await.unwrap();

        let syn = gatherer.gather_synthetic(&code, event.origin_time).await.unwrap();
        assert_eq!(syn.len(), 1);
        assert_eq!(syn.traces[0].channel, "BXZ");
    }

    #[tokio::test]
    async fn test_missing_station_is_gather_error() {
        let dir = tempfile::tempdir().unwrap();
        let gatherer = Gatherer::new(sources(dir.path()));
        let code: StationCode = "NZ.KNZ".parse().unwrap();
        let result = gatherer.gather_station(&code).await;
        assert!(matches!(result, Err(ManagerError::Gather(_))));
    }

    #[tokio::test]
    async fn test_found_data_is_archived() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Arc::new(Archive::open(&dir.path().join("ev.db")).await.unwrap());
        let mut src = sources(dir.path());
        src.archive = Some(Arc::clone(&archive));
        let mut gatherer = Gatherer::new(src);
        let code: StationCode = "NZ.BFZ.*.HH?".parse().unwrap();

        let event = gatherer.gather_event().await.unwrap();
        gatherer.gather_station(&code).await.unwrap();
        gatherer.gather_synthetic(&code, event.origin_time).await.unwrap();

        assert!(archive.read_event("2018p130600").await.unwrap().is_some());
        assert!(archive.read_station("NZ", "BFZ").await.unwrap().is_some());
        assert!(archive
            .read_waveforms("NZ", "BFZ", &synthetic_tag("m00", "s00"))
            .await
            .unwrap()
            .is_some());
    }
}
