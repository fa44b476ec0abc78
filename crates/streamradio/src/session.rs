//! The owned session aggregate.
//!
//! `SessionController` holds the search parameters, the current result set,
//! the favorites and the playback controller.  It never performs a search
//! itself: commands that change the query return a `SearchRequest`, which the
//! event loop runs and feeds back through `apply_search`.  Each request gets
//! a fresh generation; only the latest one may land.

use streamradio_proto::favorites::{FavoritesStore, Toggled};
use streamradio_proto::protocol::{SearchQuery, SessionSnapshot, SortKey, Station};
use tracing::{debug, info, warn};

use crate::catalog::SearchOutcome;
use crate::playback::{
    AttachJob, Attached, AudioBackend, PlaybackController, PlaybackEvent, PlaybackState,
};

/// A search the event loop should run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRequest {
    pub generation: u64,
    pub query: SearchQuery,
}

/// Which half of the session raised the current error notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorSource {
    Search,
    Playback,
}

pub struct SessionController<B: AudioBackend> {
    query: SearchQuery,
    stations: Vec<Station>,
    favorites: FavoritesStore,
    playback: PlaybackController<B>,
    generation: u64,
    /// Generation of the outstanding search, if any.
    loading: Option<u64>,
    /// Cleared by the next successful search or by audio starting,
    /// depending on where it came from.
    last_error: Option<(ErrorSource, String)>,
    /// Failure notifications not yet handed to the event loop.
    fresh_errors: Vec<String>,
}

impl<B: AudioBackend> SessionController<B> {
    pub fn new(favorites: FavoritesStore, playback: PlaybackController<B>) -> Self {
        Self::with_query(SearchQuery::default(), favorites, playback)
    }

    pub fn with_query(
        query: SearchQuery,
        favorites: FavoritesStore,
        playback: PlaybackController<B>,
    ) -> Self {
        Self {
            query,
            stations: Vec::new(),
            favorites,
            playback,
            generation: 0,
            loading: None,
            last_error: None,
            fresh_errors: Vec::new(),
        }
    }

    // ── search ────────────────────────────────────────────────────────────────

    /// New term; resets the limit.  `None` when the term did not change.
    pub fn set_term(&mut self, term: impl Into<String>) -> Option<SearchRequest> {
        if !self.query.set_term(term) {
            return None;
        }
        info!("session: term '{}'", self.query.term());
        Some(self.issue_search())
    }

    pub fn set_sort(&mut self, sort_key: SortKey) -> Option<SearchRequest> {
        if !self.query.set_sort(sort_key) {
            return None;
        }
        info!("session: sort {}", sort_key);
        Some(self.issue_search())
    }

    pub fn load_more(&mut self) -> SearchRequest {
        let limit = self.query.load_more();
        info!("session: limit {}", limit);
        self.issue_search()
    }

    /// Re-run the current query unchanged.
    pub fn refresh(&mut self) -> SearchRequest {
        self.issue_search()
    }

    /// Apply a finished search.  Returns `false` for a stale generation,
    /// which changes nothing.
    pub fn apply_search(&mut self, generation: u64, outcome: SearchOutcome) -> bool {
        if generation != self.generation {
            debug!(
                "session: discarding stale search generation {} (latest {})",
                generation, self.generation
            );
            return false;
        }
        self.loading = None;
        self.stations = outcome.stations;
        match outcome.failure {
            Some(failure) => self.note_error(ErrorSource::Search, format!("search failed: {failure}")),
            None => self.clear_error(ErrorSource::Search),
        }
        true
    }

    fn issue_search(&mut self) -> SearchRequest {
        self.generation += 1;
        self.loading = Some(self.generation);
        SearchRequest {
            generation: self.generation,
            query: self.query.clone(),
        }
    }

    // ── playback ──────────────────────────────────────────────────────────────

    /// Play, pause or resume the station with this id.  Returns `false` when
    /// the id is in neither the results nor the favorites.
    pub async fn toggle_play(&mut self, station_id: &str) -> bool {
        let Some(station) = self.find_station(station_id).cloned() else {
            warn!("session: play for unknown station {}", station_id);
            return false;
        };
        self.playback.play(&station).await;
        self.collect_playback_failure();
        true
    }

    pub async fn stop_playback(&mut self) {
        self.playback.stop().await;
    }

    pub async fn handle_playback_event(&mut self, event: PlaybackEvent) -> bool {
        let applied = self.playback.handle_event(event).await;
        self.collect_playback_failure();
        if matches!(self.playback.state(), PlaybackState::Playing(_)) {
            self.clear_error(ErrorSource::Playback);
        }
        applied
    }

    /// Stream opening left behind by the last station switch; the event
    /// loop runs it and hands the result to `attach_playback`.
    pub fn take_attach_job(&mut self) -> Option<AttachJob<B>> {
        self.playback.take_attach_job()
    }

    pub async fn attach_playback(&mut self, attached: Attached) -> bool {
        let applied = self.playback.attach(attached).await;
        self.collect_playback_failure();
        applied
    }

    pub async fn shutdown(&mut self) {
        self.playback.shutdown().await;
    }

    fn collect_playback_failure(&mut self) {
        if let Some(failure) = self.playback.take_failure() {
            self.note_error(ErrorSource::Playback, format!("playback failed: {failure}"));
        }
    }

    // ── favorites ─────────────────────────────────────────────────────────────

    pub fn toggle_favorite(&mut self, station_id: &str) -> Option<Toggled> {
        let Some(station) = self.find_station(station_id).cloned() else {
            warn!("session: favorite toggle for unknown station {}", station_id);
            return None;
        };
        Some(self.favorites.toggle(&station))
    }

    pub fn remove_favorite(&mut self, station_id: &str) -> bool {
        self.favorites.remove(station_id)
    }

    // ── views ─────────────────────────────────────────────────────────────────

    pub fn is_favorite(&self, station_id: &str) -> bool {
        self.favorites.is_favorite(station_id)
    }

    pub fn is_playing(&self, station_id: &str) -> bool {
        self.playback.is_playing(station_id)
    }

    pub fn is_active(&self, station_id: &str) -> bool {
        self.playback.is_active(station_id)
    }

    pub fn is_loading(&self) -> bool {
        self.loading.is_some()
    }

    pub fn query(&self) -> &SearchQuery {
        &self.query
    }

    pub fn stations(&self) -> &[Station] {
        &self.stations
    }

    pub fn favorites(&self) -> &[Station] {
        self.favorites.all()
    }

    pub fn playback_state(&self) -> &PlaybackState {
        self.playback.state()
    }

    pub fn playing_station(&self) -> Option<&Station> {
        self.playback.active_station()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_ref().map(|(_, message)| message.as_str())
    }

    /// Failure notifications raised since the previous call.
    pub fn drain_errors(&mut self) -> Vec<String> {
        std::mem::take(&mut self.fresh_errors)
    }

    /// Results first, then favorites.
    pub fn find_station(&self, station_id: &str) -> Option<&Station> {
        self.stations
            .iter()
            .find(|s| s.id == station_id)
            .or_else(|| self.favorites.get(station_id))
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.playback.state();
        SessionSnapshot {
            rev: 0,
            query: self.query.clone(),
            stations: self.stations.clone(),
            favorites: self.favorites.all().to_vec(),
            is_loading: self.is_loading(),
            playing_station: self.playback.active_station().cloned(),
            is_playing: matches!(state, PlaybackState::Playing(_)),
            playback: state.session(),
            last_error: self.last_error().map(str::to_string),
        }
    }

    fn clear_error(&mut self, source: ErrorSource) {
        if matches!(&self.last_error, Some((raised_by, _)) if *raised_by == source) {
            self.last_error = None;
        }
    }

    fn note_error(&mut self, source: ErrorSource, message: String) {
        self.last_error = Some((source, message.clone()));
        self.fresh_errors.push(message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::{AudioResource, PlaybackEventKind, ResourceId, StreamRequest};
    use async_trait::async_trait;
    use std::sync::Arc;
    use streamradio_proto::protocol::PlaybackStatus;
    use streamradio_proto::storage::MemoryStore;

    struct SilentBackend;
    struct SilentResource;

    #[async_trait]
    impl AudioBackend for SilentBackend {
        async fn acquire(
            &self,
            _resource: ResourceId,
            request: &StreamRequest,
        ) -> anyhow::Result<Box<dyn AudioResource>> {
            if request.url.is_empty() {
                anyhow::bail!("no url");
            }
            Ok(Box::new(SilentResource))
        }
    }

    #[async_trait]
    impl AudioResource for SilentResource {
        async fn start(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn pause(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn resume(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn release(&mut self) {}
    }

    fn session() -> SessionController<SilentBackend> {
        let favorites = FavoritesStore::load(Arc::new(MemoryStore::new()));
        SessionController::new(favorites, PlaybackController::new(SilentBackend))
    }

    /// Open whatever stream the last switch asked for.
    async fn settle(s: &mut SessionController<SilentBackend>) {
        if let Some(job) = s.take_attach_job() {
            let attached = job.run().await;
            s.attach_playback(attached).await;
        }
    }

    fn found(stations: Vec<Station>) -> SearchOutcome {
        SearchOutcome {
            stations,
            failure: None,
        }
    }

    fn station(id: &str) -> Station {
        Station::new(id, id, format!("http://{id}"))
    }

    #[test]
    fn test_unchanged_term_or_sort_issues_nothing() {
        let mut s = session();
        assert!(s.set_term("").is_none());
        assert!(s.set_sort(SortKey::Name).is_none());
        assert!(!s.is_loading());

        let req = s.set_term("jazz").unwrap();
        assert_eq!(req.generation, 1);
        assert_eq!(req.query.term(), "jazz");
        assert!(s.is_loading());
    }

    #[test]
    fn test_load_more_then_new_term() {
        let mut s = session();
        s.load_more();
        s.load_more();
        let req = s.load_more();
        assert_eq!(req.query.limit(), 40);

        let req = s.set_term("rock").unwrap();
        assert_eq!(req.query.limit(), 10);
        assert_eq!(s.query().limit(), 10);
    }

    #[test]
    fn test_stale_generation_is_discarded() {
        let mut s = session();
        let first = s.set_term("a").unwrap();
        let second = s.set_term("ab").unwrap();

        assert!(s.apply_search(second.generation, found(vec![station("new")])));
        assert!(!s.is_loading());

        assert!(!s.apply_search(first.generation, found(vec![station("old")])));
        assert_eq!(s.stations()[0].id, "new");
    }

    #[test]
    fn test_stale_generation_keeps_loading() {
        let mut s = session();
        let first = s.refresh();
        let _second = s.refresh();
        assert!(!s.apply_search(first.generation, found(vec![])));
        assert!(s.is_loading());
    }

    #[test]
    fn test_failed_search_empties_results_and_notifies() {
        let mut s = session();
        let req = s.refresh();
        s.apply_search(req.generation, found(vec![station("a")]));
        s.toggle_favorite("a");

        let req = s.refresh();
        s.apply_search(
            req.generation,
            SearchOutcome {
                stations: Vec::new(),
                failure: Some("directory returned HTTP 500".into()),
            },
        );
        assert!(s.stations().is_empty());
        assert!(s.is_favorite("a"));
        assert!(s.last_error().unwrap().contains("500"));
        assert_eq!(s.drain_errors().len(), 1);
        assert!(s.drain_errors().is_empty());
    }

    #[tokio::test]
    async fn test_favorite_can_be_played_after_results_change() {
        let mut s = session();
        let req = s.refresh();
        s.apply_search(req.generation, found(vec![station("a")]));
        assert_eq!(s.toggle_favorite("a"), Some(Toggled::Added));

        let req = s.set_term("other").unwrap();
        s.apply_search(req.generation, found(vec![station("b")]));

        assert!(s.toggle_play("a").await);
        assert!(s.is_active("a"));
        assert!(!s.toggle_play("missing").await);
        assert_eq!(s.toggle_favorite("missing"), None);
    }

    #[tokio::test]
    async fn test_snapshot_reflects_playback() {
        let mut s = session();
        let req = s.refresh();
        s.apply_search(req.generation, found(vec![station("a")]));
        s.toggle_play("a").await;

        let snap = s.snapshot();
        assert_eq!(snap.playback.status, PlaybackStatus::Connecting);
        settle(&mut s).await;
        assert_eq!(s.snapshot().playback.status, PlaybackStatus::Connecting);
        assert!(!snap.is_playing);
        assert_eq!(snap.playing_station.as_ref().unwrap().id, "a");

        s.handle_playback_event(PlaybackEvent {
            resource: 1,
            kind: PlaybackEventKind::Started,
        })
        .await;
        let snap = s.snapshot();
        assert!(snap.is_playing);
        assert!(s.is_playing("a"));

        s.stop_playback().await;
        let snap = s.snapshot();
        assert_eq!(snap.playback.status, PlaybackStatus::Idle);
        assert!(snap.playing_station.is_none());
    }

    #[tokio::test]
    async fn test_playback_failure_is_notified() {
        let mut s = session();
        let req = s.refresh();
        s.apply_search(req.generation, found(vec![Station::new("x", "X", "")]));
        s.toggle_play("x").await;
        assert!(s.last_error().is_none());
        settle(&mut s).await;

        assert_eq!(s.playback_state(), &PlaybackState::Error("x".into()));
        assert!(s.last_error().unwrap().starts_with("playback failed"));
        assert_eq!(s.drain_errors().len(), 1);
    }

    #[test]
    fn test_successful_search_clears_search_error() {
        let mut s = session();
        let req = s.refresh();
        s.apply_search(
            req.generation,
            SearchOutcome {
                stations: Vec::new(),
                failure: Some("timed out".into()),
            },
        );
        assert!(s.last_error().is_some());

        let req = s.refresh();
        s.apply_search(req.generation, found(vec![station("a")]));
        assert!(s.last_error().is_none());
        assert!(s.snapshot().last_error.is_none());
    }

    #[tokio::test]
    async fn test_playing_clears_playback_error_only() {
        let mut s = session();
        let req = s.refresh();
        s.apply_search(
            req.generation,
            found(vec![Station::new("x", "X", ""), station("a")]),
        );
        s.toggle_play("x").await;
        settle(&mut s).await;
        assert!(s.last_error().is_some());

        // a search succeeding says nothing about the stream
        let req = s.refresh();
        s.apply_search(
            req.generation,
            found(vec![Station::new("x", "X", ""), station("a")]),
        );
        assert!(s.last_error().unwrap().starts_with("playback failed"));

        s.toggle_play("a").await;
        settle(&mut s).await;
        s.handle_playback_event(PlaybackEvent {
            resource: 2,
            kind: PlaybackEventKind::Started,
        })
        .await;
        assert!(s.is_playing("a"));
        assert!(s.last_error().is_none());
    }
}
