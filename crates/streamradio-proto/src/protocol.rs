use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Page size of a fresh search, and the step `load_more` grows it by.
pub const DEFAULT_LIMIT: usize = 10;
pub const LIMIT_STEP: usize = 10;

/// Intents sent from the presentation layer (HTTP API) to the session core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd")]
pub enum Command {
    SetTerm { term: String },
    SetSort { sort_key: SortKey },
    LoadMore,
    TogglePlay { station_id: String },
    Stop,
    ToggleFavorite { station_id: String },
    RemoveFavorite { station_id: String },
    /// Re-issue the current query without changing it.
    Refresh,
    GetState,
}

/// Detailed playback status. Reflects what the audio hardware reported,
/// not only what was requested.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum PlaybackStatus {
    #[default]
    Idle, // nothing bound / explicitly stopped / stream ended
    Connecting, // resource acquired and start requested, no audio yet
    Playing,    // hardware reported playback started
    Paused,     // hardware reported pause
    Error,      // resource failed to start or died
}

/// The playback half of the view-model.
///
/// `active_station_id` is `Some` whenever `status` is not `Idle`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PlaybackSession {
    pub active_station_id: Option<String>,
    pub status: PlaybackStatus,
}

/// One record of the remote station directory.
///
/// Equality and hashing only look at `id`; two records with the same id are
/// the same station even if the directory returned different metadata.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Station {
    pub id: String,
    pub name: String,
    #[serde(alias = "urlResolved")]
    pub stream_url: String,
    #[serde(default)]
    pub votes: Option<u32>,
    #[serde(default)]
    pub tags: Option<String>,
    #[serde(default, alias = "clickcount")]
    pub click_count: u64,
    #[serde(default)]
    pub bitrate: u32,
}

impl Station {
    pub fn new(id: impl Into<String>, name: impl Into<String>, stream_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            stream_url: stream_url.into(),
            ..Self::default()
        }
    }

    pub fn with_votes(mut self, votes: u32) -> Self {
        self.votes = Some(votes);
        self
    }

    pub fn with_tags(mut self, tags: impl Into<String>) -> Self {
        self.tags = Some(tags.into());
        self
    }

    pub fn with_click_count(mut self, click_count: u64) -> Self {
        self.click_count = click_count;
        self
    }

    pub fn with_bitrate(mut self, bitrate: u32) -> Self {
        self.bitrate = bitrate;
        self
    }
}

impl PartialEq for Station {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Station {}

impl Hash for Station {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

/// Sort order requested from the directory.
///
/// Serialized as the directory's own `order` parameter values.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortKey {
    #[default]
    Name,
    Votes,
    ClickCount,
    Bitrate,
}

impl SortKey {
    /// Value of the directory's `order` query parameter.
    pub fn order_hint(&self) -> &'static str {
        match self {
            SortKey::Name => "name",
            SortKey::Votes => "votes",
            SortKey::ClickCount => "clickcount",
            SortKey::Bitrate => "bitrate",
        }
    }
}

impl fmt::Display for SortKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.order_hint())
    }
}

impl FromStr for SortKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "name" => Ok(SortKey::Name),
            "votes" => Ok(SortKey::Votes),
            "clickcount" => Ok(SortKey::ClickCount),
            "bitrate" => Ok(SortKey::Bitrate),
            other => anyhow::bail!("unknown sort key '{}'", other),
        }
    }
}

/// Current search parameters.
///
/// Fields are private so the limit rules hold: a term change resets the
/// limit to [`DEFAULT_LIMIT`], and only [`SearchQuery::load_more`] grows it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SearchQuery {
    term: String,
    sort_key: SortKey,
    limit: usize,
}

impl Default for SearchQuery {
    fn default() -> Self {
        Self {
            term: String::new(),
            sort_key: SortKey::default(),
            limit: DEFAULT_LIMIT,
        }
    }
}

impl SearchQuery {
    pub fn new(term: impl Into<String>, sort_key: SortKey) -> Self {
        Self {
            term: term.into(),
            sort_key,
            limit: DEFAULT_LIMIT,
        }
    }

    /// Build a query with an explicit page size (at least 1).
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn term(&self) -> &str {
        &self.term
    }

    pub fn sort_key(&self) -> SortKey {
        self.sort_key
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Returns `true` if the term changed (and the limit was reset).
    pub fn set_term(&mut self, term: impl Into<String>) -> bool {
        let term = term.into();
        if term == self.term {
            return false;
        }
        self.term = term;
        self.limit = DEFAULT_LIMIT;
        true
    }

    /// Returns `true` if the sort key changed. The limit is kept.
    pub fn set_sort(&mut self, sort_key: SortKey) -> bool {
        if sort_key == self.sort_key {
            return false;
        }
        self.sort_key = sort_key;
        true
    }

    /// Grow the page by [`LIMIT_STEP`] and return the new limit.
    pub fn load_more(&mut self) -> usize {
        self.limit = self.limit.saturating_add(LIMIT_STEP);
        self.limit
    }
}

/// Everything the presentation layer renders from.  `rev` increases on every
/// published change so clients can detect missed updates.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub rev: u64,
    pub query: SearchQuery,
    pub stations: Vec<Station>,
    pub favorites: Vec<Station>,
    pub is_loading: bool,
    pub playing_station: Option<Station>,
    pub is_playing: bool,
    pub playback: PlaybackSession,
    /// Latest non-fatal failure (catalog or playback), if any.
    #[serde(default)]
    pub last_error: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_json_tagging() {
        let cmd = Command::TogglePlay {
            station_id: "abc".to_string(),
        };
        let json = serde_json::to_string(&cmd).unwrap();
        assert_eq!(json, r#"{"cmd":"TogglePlay","station_id":"abc"}"#);

        let parsed: Command = serde_json::from_str(r#"{"cmd":"SetSort","sort_key":"clickcount"}"#).unwrap();
        assert_eq!(
            parsed,
            Command::SetSort {
                sort_key: SortKey::ClickCount
            }
        );
    }

    #[test]
    fn test_station_equality_is_by_id() {
        let a = Station::new("id-1", "Jazz FM", "http://a").with_votes(3);
        let b = Station::new("id-1", "Jazz FM (mirror)", "http://b").with_votes(9);
        let c = Station::new("id-2", "Jazz FM", "http://a");
        assert_eq!(a, b);
        assert_ne!(a, c);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
        assert!(set.insert(c));
    }

    #[test]
    fn test_station_serde_camel_case() {
        let station = Station::new("x", "X", "http://x/stream")
            .with_click_count(12)
            .with_bitrate(128);
        let json = serde_json::to_value(&station).unwrap();
        assert_eq!(json["streamUrl"], "http://x/stream");
        assert_eq!(json["clickCount"], 12);
        assert!(json["votes"].is_null());

        let legacy: Station = serde_json::from_str(
            r#"{"id":"y","name":"Y","urlResolved":"http://y","votes":4,"clickcount":7}"#,
        )
        .unwrap();
        assert_eq!(legacy.stream_url, "http://y");
        assert_eq!(legacy.votes, Some(4));
        assert_eq!(legacy.click_count, 7);
        assert_eq!(legacy.bitrate, 0);
    }

    #[test]
    fn test_sort_key_round_trip_strings() {
        for key in [SortKey::Name, SortKey::Votes, SortKey::ClickCount, SortKey::Bitrate] {
            assert_eq!(key.order_hint().parse::<SortKey>().unwrap(), key);
        }
        assert_eq!(" Votes ".parse::<SortKey>().unwrap(), SortKey::Votes);
        assert!("popularity".parse::<SortKey>().is_err());
    }

    #[test]
    fn test_load_more_steps_by_ten() {
        let mut query = SearchQuery::default();
        assert_eq!(query.limit(), 10);
        query.load_more();
        query.load_more();
        assert_eq!(query.load_more(), 40);
    }

    #[test]
    fn test_term_change_resets_limit() {
        let mut query = SearchQuery::default();
        query.load_more();
        query.load_more();
        query.load_more();
        assert!(query.set_term("rock"));
        assert_eq!(query.limit(), 10);
        assert_eq!(query.term(), "rock");
    }

    #[test]
    fn test_same_term_keeps_limit() {
        let mut query = SearchQuery::new("rock", SortKey::Name);
        query.load_more();
        assert!(!query.set_term("rock"));
        assert_eq!(query.limit(), 20);
    }

    #[test]
    fn test_sort_change_keeps_limit() {
        let mut query = SearchQuery::default();
        query.load_more();
        assert!(query.set_sort(SortKey::Votes));
        assert!(!query.set_sort(SortKey::Votes));
        assert_eq!(query.limit(), 20);
    }

    #[test]
    fn test_with_limit_is_at_least_one() {
        let query = SearchQuery::new("", SortKey::Votes).with_limit(0);
        assert_eq!(query.limit(), 1);
    }
}
