//! SessionCore: single-owner event loop for the session.
//!
//! The HTTP API, search tasks and the audio backend never touch the session
//! directly; they send `SessionEvent`s here.  `SessionCore` owns the
//! `SessionController` exclusively.  After every event that changed
//! something it publishes a fresh snapshot to the `SnapshotStore` and
//! broadcasts `BroadcastMessage::StateUpdated`.
//!
//! Opening a stream runs in its own task, like a search, so a slow player
//! start never holds up commands queued behind it.

use streamradio_proto::protocol::Command;
use streamradio_proto::state::SnapshotStore;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::catalog::{CatalogService, SearchOutcome};
use crate::playback::{AttachJob, Attached, AudioBackend, PlaybackEvent};
use crate::session::{SearchRequest, SessionController};
use crate::BroadcastMessage;

/// All inputs into the SessionCore loop.
#[derive(Debug)]
pub enum SessionEvent {
    /// A command from the HTTP API (or startup).
    Command(Command),
    /// A spawned search completed.
    SearchFinished {
        generation: u64,
        outcome: SearchOutcome,
    },
    /// Hardware notification from the audio backend.
    Playback(PlaybackEvent),
    /// A spawned stream open completed.
    PlaybackAttached(Attached),
    Shutdown,
}

pub struct SessionCore<B: AudioBackend> {
    session: SessionController<B>,
    catalog: CatalogService,
    snapshots: SnapshotStore,
    /// Handed to search and attach tasks so their results come back into
    /// the loop.
    event_tx: mpsc::Sender<SessionEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl<B: AudioBackend> SessionCore<B> {
    pub fn new(
        session: SessionController<B>,
        catalog: CatalogService,
        snapshots: SnapshotStore,
        event_tx: mpsc::Sender<SessionEvent>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        Self {
            session,
            catalog,
            snapshots,
            event_tx,
            broadcast_tx,
        }
    }

    /// Run until `Shutdown` arrives or every sender is gone.  Any bound
    /// audio resource is released on the way out.
    pub async fn run(mut self, mut event_rx: mpsc::Receiver<SessionEvent>) -> anyhow::Result<()> {
        info!("SessionCore: starting event loop");
        self.publish().await;

        loop {
            let changed = match event_rx.recv().await {
                None => {
                    info!("SessionCore: event channel closed, shutting down");
                    break;
                }
                Some(SessionEvent::Shutdown) => {
                    info!("SessionCore: shutdown requested");
                    break;
                }
                Some(SessionEvent::Command(cmd)) => {
                    debug!("SessionCore: command {:?}", cmd);
                    self.handle_command(cmd).await
                }
                Some(SessionEvent::SearchFinished {
                    generation,
                    outcome,
                }) => self.session.apply_search(generation, outcome),
                Some(SessionEvent::Playback(evt)) => {
                    debug!("SessionCore: playback event {:?}", evt);
                    self.session.handle_playback_event(evt).await
                }
                Some(SessionEvent::PlaybackAttached(attached)) => {
                    debug!("SessionCore: {:?}", attached);
                    self.session.attach_playback(attached).await
                }
            };

            if let Some(job) = self.session.take_attach_job() {
                self.spawn_attach(job);
            }

            for message in self.session.drain_errors() {
                let _ = self.broadcast_tx.send(BroadcastMessage::Error(message));
            }
            if changed {
                self.publish().await;
            }
        }

        // Streams that finished opening after the last event was taken.
        event_rx.close();
        while let Ok(event) = event_rx.try_recv() {
            if let SessionEvent::PlaybackAttached(attached) = event {
                attached.discard().await;
            }
        }

        self.session.shutdown().await;
        self.publish().await;
        Ok(())
    }

    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::SetTerm { term } => {
                let request = self.session.set_term(term);
                self.maybe_search(request)
            }
            Command::SetSort { sort_key } => {
                let request = self.session.set_sort(sort_key);
                self.maybe_search(request)
            }
            Command::LoadMore => {
                let request = self.session.load_more();
                self.spawn_search(request);
                true
            }
            Command::Refresh => {
                let request = self.session.refresh();
                self.spawn_search(request);
                true
            }
            Command::TogglePlay { station_id } => self.session.toggle_play(&station_id).await,
            Command::Stop => {
                self.session.stop_playback().await;
                true
            }
            Command::ToggleFavorite { station_id } => {
                self.session.toggle_favorite(&station_id).is_some()
            }
            Command::RemoveFavorite { station_id } => self.session.remove_favorite(&station_id),
            // Re-publish so a fresh listener gets the current state.
            Command::GetState => true,
        }
    }

    fn maybe_search(&self, request: Option<SearchRequest>) -> bool {
        match request {
            Some(request) => {
                self.spawn_search(request);
                true
            }
            None => false,
        }
    }

    fn spawn_search(&self, request: SearchRequest) {
        let catalog = self.catalog.clone();
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let outcome = catalog.search(&request.query).await;
            let _ = tx
                .send(SessionEvent::SearchFinished {
                    generation: request.generation,
                    outcome,
                })
                .await;
        });
    }

    fn spawn_attach(&self, job: AttachJob<B>) {
        debug!("SessionCore: opening resource {}", job.resource());
        let tx = self.event_tx.clone();
        tokio::spawn(async move {
            let attached = job.run().await;
            if let Err(mpsc::error::SendError(SessionEvent::PlaybackAttached(late))) =
                tx.send(SessionEvent::PlaybackAttached(attached)).await
            {
                // The loop is gone; nothing will ever bind this stream.
                late.discard().await;
            }
        });
    }

    async fn publish(&mut self) {
        let rev = self.snapshots.publish(self.session.snapshot()).await;
        debug!("SessionCore: published rev {}", rev);
        let _ = self.broadcast_tx.send(BroadcastMessage::StateUpdated);
    }
}

/// Forward audio backend events into the core loop.
pub fn forward_playback_events(
    mut playback_rx: mpsc::Receiver<PlaybackEvent>,
    event_tx: mpsc::Sender<SessionEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(evt) = playback_rx.recv().await {
            if event_tx.send(SessionEvent::Playback(evt)).await.is_err() {
                break;
            }
        }
    })
}
