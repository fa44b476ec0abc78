use std::sync::Arc;

use streamradio::catalog::{CatalogService, RadioBrowserDirectory};
use streamradio::core::{forward_playback_events, SessionCore, SessionEvent};
use streamradio::http::{start_server, HttpState};
use streamradio::mpv::MpvBackend;
use streamradio::playback::{PlaybackController, PlaybackEvent};
use streamradio::session::SessionController;
use streamradio::{logging, BroadcastMessage};
use streamradio_proto::config::Config;
use streamradio_proto::favorites::FavoritesStore;
use streamradio_proto::protocol::Command;
use streamradio_proto::state::SnapshotStore;
use streamradio_proto::storage::JsonFileStore;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    // Setup broadcast channel first so we can use it for logging
    let (broadcast_tx, _) = broadcast::channel::<BroadcastMessage>(256);

    let log_path = streamradio_proto::platform::data_dir().join("streamradio.log");
    logging::init(&log_path, broadcast_tx.clone())?;
    eprintln!("streamradio log: {}", log_path.display());
    info!("streamradio starting");

    let config = match Config::load() {
        Ok(config) => {
            info!("Config loaded from: {:?}", Config::config_path());
            config
        }
        Err(e) => {
            warn!("Config unreadable ({}), using defaults", e);
            Config::default()
        }
    };

    // ── Favorites ────────────────────────────────────────────────────────────
    let store = Arc::new(JsonFileStore::new(&config.storage.storage_file));
    info!("Favorites storage: {:?}", store.path());
    let favorites = FavoritesStore::load(store);

    // ── Catalog ──────────────────────────────────────────────────────────────
    let directory = RadioBrowserDirectory::new(&config.catalog)?;
    let catalog = CatalogService::new(Arc::new(directory));

    // ── Playback ─────────────────────────────────────────────────────────────
    let (playback_tx, playback_rx) = mpsc::channel::<PlaybackEvent>(64);
    let backend = MpvBackend::new(config.mpv.clone(), playback_tx);
    let playback = PlaybackController::new(backend);

    // ── Session core ─────────────────────────────────────────────────────────
    let (event_tx, event_rx) = mpsc::channel::<SessionEvent>(256);
    let session = SessionController::new(favorites, playback);
    let snapshots = SnapshotStore::default();
    let session_core = SessionCore::new(
        session,
        catalog,
        snapshots.clone(),
        event_tx.clone(),
        broadcast_tx.clone(),
    );
    forward_playback_events(playback_rx, event_tx.clone());

    if config.http.enabled {
        start_server(
            config.http.bind_address.clone(),
            config.http.port,
            HttpState::new(snapshots, event_tx.clone(), broadcast_tx.clone()),
        );
    }

    // Initial search, as if the user had opened the app.
    event_tx.send(SessionEvent::Command(Command::Refresh)).await?;

    let shutdown_tx = event_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received");
            let _ = shutdown_tx.send(SessionEvent::Shutdown).await;
        }
    });
    drop(event_tx);

    session_core.run(event_rx).await?;
    info!("streamradio stopped");
    Ok(())
}
