//! Shared fakes for the integration tests: an audio backend that records
//! every call and plays the part of the hardware, and a station directory
//! with scripted answers and delays.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use streamradio::catalog::{CatalogError, StationDirectory};
use streamradio::playback::{
    AudioBackend, AudioResource, PlaybackEvent, PlaybackEventKind, ResourceId, StreamRequest,
};
use streamradio_proto::protocol::{SearchQuery, SessionSnapshot, Station};
use streamradio_proto::state::SnapshotStore;
use tokio::sync::mpsc;

pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn calls(log: &CallLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

/// Audio backend whose resources confirm start/pause/resume immediately,
/// the way real hardware would a moment later.  URLs containing
/// `unreachable` fail to open.  An open delay stands in for a player
/// process that takes its time to come up.
pub struct FakeBackend {
    log: CallLog,
    events: mpsc::Sender<PlaybackEvent>,
    open_delay: Duration,
}

impl FakeBackend {
    pub fn new(events: mpsc::Sender<PlaybackEvent>) -> (Self, CallLog) {
        Self::with_open_delay(events, Duration::ZERO)
    }

    pub fn with_open_delay(
        events: mpsc::Sender<PlaybackEvent>,
        open_delay: Duration,
    ) -> (Self, CallLog) {
        let log = CallLog::default();
        (
            Self {
                log: log.clone(),
                events,
                open_delay,
            },
            log,
        )
    }
}

#[async_trait]
impl AudioBackend for FakeBackend {
    async fn acquire(
        &self,
        resource: ResourceId,
        request: &StreamRequest,
    ) -> anyhow::Result<Box<dyn AudioResource>> {
        if request.url.contains("unreachable") {
            anyhow::bail!("connection refused");
        }
        self.log.lock().unwrap().push(format!("acquire {resource}"));
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        Ok(Box::new(FakeResource {
            id: resource,
            log: self.log.clone(),
            events: self.events.clone(),
        }))
    }
}

struct FakeResource {
    id: ResourceId,
    log: CallLog,
    events: mpsc::Sender<PlaybackEvent>,
}

impl FakeResource {
    async fn confirm(&self, kind: PlaybackEventKind) {
        let _ = self
            .events
            .send(PlaybackEvent {
                resource: self.id,
                kind,
            })
            .await;
    }
}

#[async_trait]
impl AudioResource for FakeResource {
    async fn start(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("start {}", self.id));
        self.confirm(PlaybackEventKind::Started).await;
        Ok(())
    }

    async fn pause(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("pause {}", self.id));
        self.confirm(PlaybackEventKind::Paused).await;
        Ok(())
    }

    async fn resume(&mut self) -> anyhow::Result<()> {
        self.log.lock().unwrap().push(format!("resume {}", self.id));
        self.confirm(PlaybackEventKind::Started).await;
        Ok(())
    }

    async fn release(&mut self) {
        self.log.lock().unwrap().push(format!("release {}", self.id));
    }
}

enum Scripted {
    Found { delay: Duration, stations: Vec<Station> },
    Fail,
}

/// Directory answering per search term.  Unknown terms return no stations.
#[derive(Default)]
pub struct ScriptedDirectory {
    answers: HashMap<String, Scripted>,
    queries: Mutex<Vec<SearchQuery>>,
}

impl ScriptedDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, term: &str, stations: Vec<Station>) -> Self {
        self.answers.insert(
            term.to_string(),
            Scripted::Found {
                delay: Duration::ZERO,
                stations,
            },
        );
        self
    }

    pub fn with_delay(mut self, term: &str, delay_ms: u64, stations: Vec<Station>) -> Self {
        self.answers.insert(
            term.to_string(),
            Scripted::Found {
                delay: Duration::from_millis(delay_ms),
                stations,
            },
        );
        self
    }

    pub fn failing(mut self, term: &str) -> Self {
        self.answers.insert(term.to_string(), Scripted::Fail);
        self
    }

    pub fn queries(&self) -> Vec<SearchQuery> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl StationDirectory for ScriptedDirectory {
    async fn fetch(&self, query: &SearchQuery) -> Result<Vec<Station>, CatalogError> {
        self.queries.lock().unwrap().push(query.clone());
        match self.answers.get(query.term()) {
            Some(Scripted::Found { delay, stations }) => {
                tokio::time::sleep(*delay).await;
                Ok(stations.clone())
            }
            Some(Scripted::Fail) => Err(CatalogError::Decode("connection reset".to_string())),
            None => Ok(Vec::new()),
        }
    }
}

pub fn station(id: &str, name: &str) -> Station {
    Station::new(id, name, format!("http://streams.example/{id}"))
}

/// Poll the snapshot store until `pred` holds, or panic after two seconds.
pub async fn wait_for(
    snapshots: &SnapshotStore,
    what: &str,
    pred: impl Fn(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let snapshot = snapshots.get().await;
        if pred(&snapshot) {
            return snapshot;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}; last snapshot: {snapshot:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
