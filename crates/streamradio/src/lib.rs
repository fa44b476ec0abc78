pub mod catalog;
pub mod core;
pub mod http;
pub mod logging;
pub mod mpv;
pub mod playback;
pub mod session;

/// What the session core announces to event-stream listeners.
#[derive(Debug, Clone)]
pub enum BroadcastMessage {
    /// The session snapshot changed; receivers read it from `SnapshotStore`.
    StateUpdated,
    /// A non-fatal failure notification (search or playback).
    Error(String),
    /// A WARN/ERROR log record.
    Log(String),
}
