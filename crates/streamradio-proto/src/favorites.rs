//! Favorites collection
//!
//! Ordered, deduplicated by station id, and written back to the key-value
//! store as a whole after every mutation.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::protocol::Station;
use crate::storage::KeyValueStore;

/// Storage key holding the JSON-encoded favorites array.
pub const FAVORITES_KEY: &str = "favoriteStations";

/// What a `toggle` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Toggled {
    Added,
    Removed,
}

pub struct FavoritesStore {
    store: Arc<dyn KeyValueStore>,
    /// Display order (insertion order).
    stations: Vec<Station>,
    /// Ids of `stations`, for O(1) membership.
    ids: HashSet<String>,
}

impl FavoritesStore {
    /// Read the persisted collection.  A missing key, an unreadable store or
    /// a value that does not parse all yield an empty collection.
    pub fn load(store: Arc<dyn KeyValueStore>) -> Self {
        let stations = match store.get(FAVORITES_KEY) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<Station>>(&raw) {
                Ok(stations) => stations,
                Err(e) => {
                    debug!("favorites: stored value unparsable, starting empty: {}", e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                debug!("favorites: storage unreadable, starting empty: {}", e);
                Vec::new()
            }
        };

        let mut favorites = Self {
            store,
            stations,
            ids: HashSet::new(),
        };
        favorites.dedup();
        info!("favorites: loaded {} stations", favorites.stations.len());
        favorites
    }

    pub fn is_favorite(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Remove the station if present, otherwise append it; then persist.
    pub fn toggle(&mut self, station: &Station) -> Toggled {
        let toggled = if self.ids.contains(&station.id) {
            self.stations.retain(|s| s.id != station.id);
            self.ids.remove(&station.id);
            Toggled::Removed
        } else {
            self.ids.insert(station.id.clone());
            self.stations.push(station.clone());
            Toggled::Added
        };
        info!("favorites: {:?} '{}'", toggled, station.name);
        self.persist();
        toggled
    }

    /// Remove by id.  Returns `false` (and writes nothing) when absent.
    pub fn remove(&mut self, id: &str) -> bool {
        if !self.ids.remove(id) {
            return false;
        }
        self.stations.retain(|s| s.id != id);
        self.persist();
        true
    }

    pub fn get(&self, id: &str) -> Option<&Station> {
        if !self.ids.contains(id) {
            return None;
        }
        self.stations.iter().find(|s| s.id == id)
    }

    pub fn all(&self) -> &[Station] {
        &self.stations
    }

    pub fn len(&self) -> usize {
        self.stations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.is_empty()
    }

    /// Collapse entries sharing an id to the first occurrence and rebuild
    /// the id set.
    fn dedup(&mut self) {
        let mut seen = HashSet::with_capacity(self.stations.len());
        self.stations.retain(|s| seen.insert(s.id.clone()));
        self.ids = seen;
    }

    fn persist(&self) {
        let json = match serde_json::to_string(&self.stations) {
            Ok(json) => json,
            Err(e) => {
                warn!("favorites: failed to encode collection: {}", e);
                return;
            }
        };
        if let Err(e) = self.store.set(FAVORITES_KEY, &json) {
            warn!("favorites: failed to persist collection: {}", e);
        }
    }
}
