//! Playback state machine.
//!
//! `PlaybackController` owns the single live audio resource.  Commands only
//! *request* transitions; the confirming half (Playing / Paused / Idle) comes
//! back as `PlaybackEvent`s from the backend, tagged with the resource they
//! belong to so events from a released resource can be told apart.
//!
//! Opening a stream can take seconds, so `play` never waits for it: it
//! releases the old resource, moves to Connecting and leaves an
//! [`AttachJob`] for the caller to run off the event loop.  The finished job
//! comes back through [`PlaybackController::attach`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use streamradio_proto::protocol::{PlaybackSession, PlaybackStatus, Station};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// Sequence number of an acquired audio resource.
pub type ResourceId = u64;

/// What the backend is asked to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRequest {
    pub url: String,
    /// Anonymous cross-origin access.  Always requested.
    pub cross_origin: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEventKind {
    Started,
    Paused,
    Ended,
    Failed(String),
}

/// Hardware notification for one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackEvent {
    pub resource: ResourceId,
    pub kind: PlaybackEventKind,
}

/// A live stream connection.  `release` must leave no open connection
/// behind; the controller calls it on every path that drops the resource.
#[async_trait]
pub trait AudioResource: Send + Sync {
    async fn start(&mut self) -> anyhow::Result<()>;
    async fn pause(&mut self) -> anyhow::Result<()>;
    async fn resume(&mut self) -> anyhow::Result<()>;
    async fn release(&mut self);
}

/// Factory for audio resources.  Implementations report hardware events for
/// every resource they hand out through the event sender they were built
/// with.
#[async_trait]
pub trait AudioBackend: Send + Sync + 'static {
    async fn acquire(
        &self,
        resource: ResourceId,
        request: &StreamRequest,
    ) -> anyhow::Result<Box<dyn AudioResource>>;
}

/// Opening and starting one resource, run outside the controller.
///
/// A job takes the controller's stream slot before touching the backend, and
/// a successfully opened resource keeps holding it until it is released.  A
/// newer job therefore cannot open its stream while an older one is live.
pub struct AttachJob<B: AudioBackend> {
    backend: Arc<B>,
    slot: Arc<Mutex<()>>,
    wanted: Arc<AtomicU64>,
    resource: ResourceId,
    request: StreamRequest,
}

impl<B: AudioBackend> AttachJob<B> {
    pub fn resource(&self) -> ResourceId {
        self.resource
    }

    pub async fn run(self) -> Attached {
        let slot = self.slot.lock_owned().await;
        let result = if self.wanted.load(Ordering::SeqCst) != self.resource {
            Err(anyhow::anyhow!("superseded before opening"))
        } else {
            open_stream(self.backend.as_ref(), self.resource, &self.request).await
        };
        // Nothing live after a failure, so the slot is freed right away.
        let slot = result.is_ok().then_some(slot);
        Attached {
            resource: self.resource,
            result,
            slot,
        }
    }
}

async fn open_stream<B: AudioBackend>(
    backend: &B,
    resource: ResourceId,
    request: &StreamRequest,
) -> anyhow::Result<Box<dyn AudioResource>> {
    let mut opened = backend
        .acquire(resource, request)
        .await
        .map_err(|e| anyhow::anyhow!("could not open stream: {e}"))?;
    if let Err(e) = opened.start().await {
        opened.release().await;
        anyhow::bail!("could not start stream: {e}");
    }
    Ok(opened)
}

/// Result of an [`AttachJob`].
pub struct Attached {
    pub resource: ResourceId,
    pub result: anyhow::Result<Box<dyn AudioResource>>,
    slot: Option<OwnedMutexGuard<()>>,
}

impl Attached {
    /// Release an opened resource nobody is going to bind.
    pub async fn discard(self) {
        match self.result {
            Ok(mut stale) => {
                debug!("playback: releasing superseded resource {}", self.resource);
                stale.release().await;
            }
            Err(e) => debug!("playback: superseded resource {}: {}", self.resource, e),
        }
    }
}

impl fmt::Debug for Attached {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let outcome = match &self.result {
            Ok(_) => "opened".to_string(),
            Err(e) => e.to_string(),
        };
        f.debug_struct("Attached")
            .field("resource", &self.resource)
            .field("outcome", &outcome)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PlaybackState {
    #[default]
    Idle,
    /// Start requested, no audio confirmed yet.
    Connecting(String),
    Playing(String),
    Paused(String),
    Error(String),
}

impl PlaybackState {
    pub fn station_id(&self) -> Option<&str> {
        match self {
            PlaybackState::Idle => None,
            PlaybackState::Connecting(id)
            | PlaybackState::Playing(id)
            | PlaybackState::Paused(id)
            | PlaybackState::Error(id) => Some(id),
        }
    }

    pub fn status(&self) -> PlaybackStatus {
        match self {
            PlaybackState::Idle => PlaybackStatus::Idle,
            PlaybackState::Connecting(_) => PlaybackStatus::Connecting,
            PlaybackState::Playing(_) => PlaybackStatus::Playing,
            PlaybackState::Paused(_) => PlaybackStatus::Paused,
            PlaybackState::Error(_) => PlaybackStatus::Error,
        }
    }

    pub fn session(&self) -> PlaybackSession {
        PlaybackSession {
            active_station_id: self.station_id().map(str::to_string),
            status: self.status(),
        }
    }
}

struct BoundResource {
    id: ResourceId,
    resource: Box<dyn AudioResource>,
    _slot: Option<OwnedMutexGuard<()>>,
}

pub struct PlaybackController<B: AudioBackend> {
    backend: Arc<B>,
    slot: Arc<Mutex<()>>,
    /// Resource id an attach job may still open; 0 when none.
    wanted: Arc<AtomicU64>,
    state: PlaybackState,
    /// Opened resource behind Connecting, Playing or Paused.
    bound: Option<BoundResource>,
    /// Requested resource whose job has not reported back yet.
    pending: Option<ResourceId>,
    job: Option<AttachJob<B>>,
    /// The station behind `state`, kept through Error so it can be shown.
    station: Option<Station>,
    next_resource: ResourceId,
    failure: Option<String>,
}

impl<B: AudioBackend> PlaybackController<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
            slot: Arc::new(Mutex::new(())),
            wanted: Arc::new(AtomicU64::new(0)),
            state: PlaybackState::Idle,
            bound: None,
            pending: None,
            job: None,
            station: None,
            next_resource: 1,
            failure: None,
        }
    }

    pub fn state(&self) -> &PlaybackState {
        &self.state
    }

    pub fn active_station(&self) -> Option<&Station> {
        self.station.as_ref()
    }

    pub fn active_station_id(&self) -> Option<&str> {
        self.state.station_id()
    }

    pub fn bound_resource(&self) -> Option<ResourceId> {
        self.bound.as_ref().map(|b| b.id)
    }

    pub fn pending_resource(&self) -> Option<ResourceId> {
        self.pending
    }

    pub fn is_playing(&self, station_id: &str) -> bool {
        matches!(&self.state, PlaybackState::Playing(id) if id == station_id)
    }

    pub fn is_active(&self, station_id: &str) -> bool {
        self.state.station_id() == Some(station_id)
    }

    /// Take the latest failure notification, if one arrived since the last
    /// call.
    pub fn take_failure(&mut self) -> Option<String> {
        self.failure.take()
    }

    /// The open-and-start work left by the last `play` that switched
    /// stations.  Its result goes back through [`Self::attach`].
    pub fn take_attach_job(&mut self) -> Option<AttachJob<B>> {
        self.job.take()
    }

    /// Pause/resume the bound station, or switch to a new one.
    pub async fn play(&mut self, station: &Station) {
        match self.state.clone() {
            PlaybackState::Playing(id) if id == station.id => {
                info!("playback: pause requested for '{}'", station.name);
                let result = match self.bound.as_mut() {
                    Some(bound) => bound.resource.pause().await,
                    None => Ok(()),
                };
                if let Err(e) = result {
                    self.fail(format!("pause failed: {e}")).await;
                }
            }
            PlaybackState::Paused(id) | PlaybackState::Connecting(id) if id == station.id => {
                info!("playback: resume requested for '{}'", station.name);
                let result = match self.bound.as_mut() {
                    Some(bound) => bound.resource.resume().await,
                    None => Ok(()),
                };
                if let Err(e) = result {
                    self.fail(format!("resume failed: {e}")).await;
                }
            }
            _ => self.switch_to(station).await,
        }
    }

    pub async fn stop(&mut self) {
        if self.state == PlaybackState::Idle {
            return;
        }
        info!("playback: stop");
        self.detach().await;
        self.station = None;
        self.set_state(PlaybackState::Idle);
    }

    /// Apply a finished attach job.  Returns `false` when the resource was
    /// superseded meanwhile; an opened one is released then.
    pub async fn attach(&mut self, attached: Attached) -> bool {
        if self.pending != Some(attached.resource) {
            attached.discard().await;
            return false;
        }

        let Attached {
            resource,
            result,
            slot,
        } = attached;

        self.set_pending(None);
        match result {
            Ok(opened) => {
                debug!("playback: resource {} attached", resource);
                self.bound = Some(BoundResource {
                    id: resource,
                    resource: opened,
                    _slot: slot,
                });
            }
            Err(e) => {
                let station_id = self.state.station_id().unwrap_or_default().to_string();
                self.fail_station(&station_id, e.to_string());
            }
        }
        true
    }

    /// Apply a hardware event.  Returns `false` when the event belongs to a
    /// resource that is no longer bound or awaited.
    pub async fn handle_event(&mut self, event: PlaybackEvent) -> bool {
        let Some(station_id) = self.current_for(event.resource) else {
            debug!(
                "playback: ignoring {:?} from stale resource {}",
                event.kind, event.resource
            );
            return false;
        };

        match event.kind {
            PlaybackEventKind::Started => self.set_state(PlaybackState::Playing(station_id)),
            PlaybackEventKind::Paused => self.set_state(PlaybackState::Paused(station_id)),
            PlaybackEventKind::Ended => {
                info!("playback: stream ended");
                self.detach().await;
                self.station = None;
                self.set_state(PlaybackState::Idle);
            }
            PlaybackEventKind::Failed(reason) => self.fail(reason).await,
        }
        true
    }

    /// Release any resource and return to Idle.
    pub async fn shutdown(&mut self) {
        self.detach().await;
        self.station = None;
        self.set_state(PlaybackState::Idle);
    }

    async fn switch_to(&mut self, station: &Station) {
        // At most one live stream: the old resource is gone before the new
        // one is requested.
        self.detach().await;

        let id = self.next_resource;
        self.next_resource += 1;
        self.station = Some(station.clone());

        let request = StreamRequest {
            url: station.stream_url.clone(),
            cross_origin: true,
        };
        info!(
            "playback: starting '{}' as resource {} ({})",
            station.name, id, request.url
        );

        self.set_pending(Some(id));
        self.job = Some(AttachJob {
            backend: Arc::clone(&self.backend),
            slot: Arc::clone(&self.slot),
            wanted: Arc::clone(&self.wanted),
            resource: id,
            request,
        });
        self.set_state(PlaybackState::Connecting(station.id.clone()));
    }

    fn current_for(&self, resource: ResourceId) -> Option<String> {
        let bound = self.bound.as_ref().map(|b| b.id);
        if bound == Some(resource) || self.pending == Some(resource) {
            self.state.station_id().map(str::to_string)
        } else {
            None
        }
    }

    async fn fail(&mut self, reason: String) {
        let Some(station_id) = self.state.station_id().map(str::to_string) else {
            return;
        };
        self.detach().await;
        self.fail_station(&station_id, reason);
    }

    fn fail_station(&mut self, station_id: &str, reason: String) {
        warn!("playback: station {} failed: {}", station_id, reason);
        self.failure = Some(reason);
        self.set_state(PlaybackState::Error(station_id.to_string()));
    }

    /// Drop the bound resource and forget any outstanding request.
    async fn detach(&mut self) {
        self.job = None;
        self.set_pending(None);
        if let Some(mut bound) = self.bound.take() {
            debug!("playback: releasing resource {}", bound.id);
            bound.resource.release().await;
        }
    }

    fn set_pending(&mut self, resource: Option<ResourceId>) {
        self.pending = resource;
        self.wanted.store(resource.unwrap_or(0), Ordering::SeqCst);
    }

    fn set_state(&mut self, next: PlaybackState) {
        if next != self.state {
            info!("playback: {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }
}
