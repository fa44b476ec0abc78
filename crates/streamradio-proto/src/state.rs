use crate::protocol::SessionSnapshot;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Shared, read-mostly copy of the session view-model.
///
/// Only the session core writes; HTTP handlers and event-stream subscribers
/// read clones.  Every `publish` bumps `rev`.
#[derive(Clone, Default)]
pub struct SnapshotStore {
    state: Arc<RwLock<SessionSnapshot>>,
}

impl SnapshotStore {
    pub async fn get(&self) -> SessionSnapshot {
        self.state.read().await.clone()
    }

    pub async fn rev(&self) -> u64 {
        self.state.read().await.rev
    }

    /// Replace the stored snapshot, keeping `rev` monotonic regardless of
    /// what the caller put in `next.rev`.  Returns the new revision.
    pub async fn publish(&self, mut next: SessionSnapshot) -> u64 {
        let mut state = self.state.write().await;
        next.rev = state.rev + 1;
        *state = next;
        state.rev
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PlaybackStatus, Station};

    #[tokio::test]
    async fn test_publish_bumps_rev() {
        let store = SnapshotStore::default();
        assert_eq!(store.rev().await, 0);

        let mut next = store.get().await;
        next.is_loading = true;
        assert_eq!(store.publish(next).await, 1);

        let mut next = store.get().await;
        next.rev = 0; // stale value from the caller is ignored
        next.playing_station = Some(Station::new("a", "A", "http://a"));
        next.playback.status = PlaybackStatus::Connecting;
        assert_eq!(store.publish(next).await, 2);

        let current = store.get().await;
        assert!(current.is_loading);
        assert_eq!(current.playback.status, PlaybackStatus::Connecting);
        assert_eq!(current.rev, 2);
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let store = SnapshotStore::default();
        let reader = store.clone();
        store.publish(SessionSnapshot::default()).await;
        assert_eq!(reader.rev().await, 1);
    }
}
