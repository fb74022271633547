//! Remote data service client
//!
//! Last entry of the gatherer's fallback chain. The service speaks JSON over
//! HTTP:
//! - `GET {base}/event/{event_id}` → [`Event`]
//! - `GET {base}/station/{net}/{sta}` → [`StationMetadata`]
//! - `GET {base}/waveforms/{net}/{sta}?channel=&start=&end=` → [`Stream`]
//!
//! Only observed waveforms are fetched remotely; synthetics always come from
//! the solver.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::models::{Event, StationMetadata, Stream};

const USER_AGENT: &str = concat!("flowa/", env!("CARGO_PKG_VERSION"));

/// Remote client errors
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Network communication error
    #[error("Network error: {0}")]
    Network(String),

    /// The service has no such resource
    #[error("Not found: {0}")]
    NotFound(String),

    /// Service returned an error response
    #[error("API error {0}: {1}")]
    Api(u16, String),

    /// Failed to parse response JSON
    #[error("Parse error: {0}")]
    Parse(String),
}

/// HTTP client for the remote data service
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http_client: reqwest::Client,
    base_url: String,
}

impl RemoteClient {
    pub fn new(base_url: &str, timeout_s: u64) -> Result<Self, RemoteError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(timeout_s))
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get_event(&self, event_id: &str) -> Result<Event, RemoteError> {
        let url = format!("{}/event/{}", self.base_url, event_id);
        self.get_json(&url, &[]).await
    }

    pub async fn get_station(&self, network: &str, station: &str) -> Result<StationMetadata, RemoteError> {
        let url = format!("{}/station/{}/{}", self.base_url, network, station);
        self.get_json(&url, &[]).await
    }

    /// Observed waveforms for one station between `start` and `end`
    pub async fn get_waveforms(
        &self,
        network: &str,
        station: &str,
        channel: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Stream, RemoteError> {
        let url = format!("{}/waveforms/{}/{}", self.base_url, network, station);
        let query = [
            ("channel", channel.to_string()),
            ("start", start.to_rfc3339()),
            ("end", end.to_rfc3339()),
        ];
        self.get_json(&url, &query).await
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T, RemoteError> {
        tracing::debug!(url = %url, "Querying remote data service");

        let response = self
            .http_client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(RemoteError::NotFound(url.to_string()));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(RemoteError::Api(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| RemoteError::Parse(e.to_string()))
    }
}
