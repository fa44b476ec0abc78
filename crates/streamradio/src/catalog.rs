//! Remote station directory access.
//!
//! `StationDirectory` is the raw fetch; `CatalogService` sits on top and
//! applies local ordering plus failure degradation, so callers always get a
//! result list and never an error.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use streamradio_proto::config::CatalogConfig;
use streamradio_proto::protocol::{SearchQuery, SortKey, Station};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("directory request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("directory returned HTTP {0}")]
    Status(StatusCode),
    #[error("directory response malformed: {0}")]
    Decode(String),
}

#[async_trait]
pub trait StationDirectory: Send + Sync {
    async fn fetch(&self, query: &SearchQuery) -> Result<Vec<Station>, CatalogError>;
}

/// Result of one search.  `failure` carries the notification text when the
/// directory could not be reached or answered garbage; `stations` is then
/// empty.
#[derive(Debug, Clone, Default)]
pub struct SearchOutcome {
    pub stations: Vec<Station>,
    pub failure: Option<String>,
}

impl SearchOutcome {
    pub fn is_failure(&self) -> bool {
        self.failure.is_some()
    }
}

#[derive(Clone)]
pub struct CatalogService {
    directory: Arc<dyn StationDirectory>,
}

impl CatalogService {
    pub fn new(directory: Arc<dyn StationDirectory>) -> Self {
        Self { directory }
    }

    /// Fetch the full page for `query`.  Every call re-requests the whole
    /// result set at the current limit.
    pub async fn search(&self, query: &SearchQuery) -> SearchOutcome {
        match self.directory.fetch(query).await {
            Ok(mut stations) => {
                stations.truncate(query.limit());
                if query.sort_key() == SortKey::Votes {
                    sort_by_votes(&mut stations);
                }
                debug!(
                    "catalog: '{}' order={} limit={} -> {} stations",
                    query.term(),
                    query.sort_key(),
                    query.limit(),
                    stations.len()
                );
                SearchOutcome {
                    stations,
                    failure: None,
                }
            }
            Err(e) => {
                warn!("catalog: search '{}' failed: {}", query.term(), e);
                SearchOutcome {
                    stations: Vec::new(),
                    failure: Some(e.to_string()),
                }
            }
        }
    }
}

/// Descending by votes, stable, stations without a vote count last.
pub fn sort_by_votes(stations: &mut [Station]) {
    stations.sort_by(|a, b| b.votes.cmp(&a.votes));
}

// ── radio-browser ─────────────────────────────────────────────────────────────

pub struct RadioBrowserDirectory {
    client: reqwest::Client,
    search_url: String,
}

impl RadioBrowserDirectory {
    pub fn new(config: &CatalogConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().user_agent(config.user_agent.clone());
        if let Some(secs) = config.request_timeout_secs {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let search_url = format!("{}/stations/search", config.base_url.trim_end_matches('/'));
        info!("catalog: using directory {}", search_url);
        Ok(Self {
            client: builder.build()?,
            search_url,
        })
    }

    pub fn search_url(&self) -> &str {
        &self.search_url
    }
}

#[async_trait]
impl StationDirectory for RadioBrowserDirectory {
    async fn fetch(&self, query: &SearchQuery) -> Result<Vec<Station>, CatalogError> {
        let limit = query.limit().to_string();
        let response = self
            .client
            .get(&self.search_url)
            .query(&[
                ("name", query.term()),
                ("limit", limit.as_str()),
                ("order", query.sort_key().order_hint()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Status(status));
        }

        let body = response.bytes().await?;
        let records: Vec<DirectoryStation> =
            serde_json::from_slice(&body).map_err(|e| CatalogError::Decode(e.to_string()))?;
        Ok(records
            .into_iter()
            .filter_map(DirectoryStation::into_station)
            .collect())
    }
}

/// One record as the directory sends it.  Both the directory's own field
/// names and the camelCase client names are accepted.
#[derive(Debug, Deserialize)]
struct DirectoryStation {
    #[serde(default, alias = "stationuuid")]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default, alias = "urlResolved")]
    url_resolved: Option<String>,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    votes: Option<u32>,
    #[serde(default)]
    tags: Option<String>,
    #[serde(default, alias = "clickCount")]
    clickcount: Option<u64>,
    #[serde(default)]
    bitrate: Option<u32>,
}

impl DirectoryStation {
    fn into_station(self) -> Option<Station> {
        let id = non_empty(self.id)?;
        let Some(stream_url) = non_empty(self.url_resolved).or_else(|| non_empty(self.url)) else {
            debug!("catalog: skipping station {} without a stream url", id);
            return None;
        };
        Some(Station {
            id,
            name: self.name.map(|n| n.trim().to_string()).unwrap_or_default(),
            stream_url,
            votes: self.votes,
            tags: non_empty(self.tags),
            click_count: self.clickcount.unwrap_or(0),
            bitrate: self.bitrate.unwrap_or(0),
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
