use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Json, Response,
    },
    routing::get,
    Router,
};
use futures_util::stream::{self, Stream};
use serde::Deserialize;
use streamradio_proto::protocol::{Command, SessionSnapshot, SortKey};
use streamradio_proto::state::SnapshotStore;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;
use tracing::{debug, error, info};

use crate::core::SessionEvent;
use crate::BroadcastMessage;

#[derive(Clone)]
pub struct HttpState {
    snapshots: SnapshotStore,
    event_tx: mpsc::Sender<SessionEvent>,
    broadcast_tx: broadcast::Sender<BroadcastMessage>,
}

impl HttpState {
    pub fn new(
        snapshots: SnapshotStore,
        event_tx: mpsc::Sender<SessionEvent>,
        broadcast_tx: broadcast::Sender<BroadcastMessage>,
    ) -> Self {
        Self {
            snapshots,
            event_tx,
            broadcast_tx,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    #[serde(default)]
    term: String,
}

pub fn router(state: HttpState) -> Router {
    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/search", get(search).post(search))
        .route("/api/sort/:key", get(set_sort).post(set_sort))
        .route("/api/more", get(load_more).post(load_more))
        .route("/api/play/:id", get(toggle_play).post(toggle_play))
        .route("/api/stop", get(stop).post(stop))
        .route(
            "/api/favorite/:id",
            get(toggle_favorite)
                .post(toggle_favorite)
                .delete(remove_favorite),
        )
        .route("/api/events", get(events))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub fn start_server(bind_address: String, port: u16, state: HttpState) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(state);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn send_command(state: &HttpState, cmd: Command) -> StatusCode {
    info!("HTTP API: {:?}", cmd);
    if state.event_tx.send(SessionEvent::Command(cmd)).await.is_err() {
        error!("HTTP API: session loop is gone");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::OK
}

async fn get_state(State(state): State<HttpState>) -> Json<SessionSnapshot> {
    Json(state.snapshots.get().await)
}

async fn search(State(state): State<HttpState>, Query(params): Query<SearchParams>) -> StatusCode {
    send_command(&state, Command::SetTerm { term: params.term }).await
}

async fn set_sort(State(state): State<HttpState>, Path(key): Path<String>) -> Response {
    match key.parse::<SortKey>() {
        Ok(sort_key) => send_command(&state, Command::SetSort { sort_key })
            .await
            .into_response(),
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

async fn load_more(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::LoadMore).await
}

async fn toggle_play(State(state): State<HttpState>, Path(station_id): Path<String>) -> StatusCode {
    send_command(&state, Command::TogglePlay { station_id }).await
}

async fn stop(State(state): State<HttpState>) -> StatusCode {
    send_command(&state, Command::Stop).await
}

async fn toggle_favorite(
    State(state): State<HttpState>,
    Path(station_id): Path<String>,
) -> StatusCode {
    send_command(&state, Command::ToggleFavorite { station_id }).await
}

async fn remove_favorite(
    State(state): State<HttpState>,
    Path(station_id): Path<String>,
) -> StatusCode {
    send_command(&state, Command::RemoveFavorite { station_id }).await
}

/// Server-sent events: the current `state` first, then `state`, `error` and
/// `log` events as the core broadcasts them.
async fn events(State(state): State<HttpState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.broadcast_tx.subscribe();
    Sse::new(event_stream(rx, state.snapshots)).keep_alive(KeepAlive::default())
}

fn event_stream(
    rx: broadcast::Receiver<BroadcastMessage>,
    snapshots: SnapshotStore,
) -> impl Stream<Item = Result<Event, Infallible>> {
    stream::unfold((rx, snapshots, true), |(mut rx, snapshots, first)| async move {
        if first {
            let event = state_event(&snapshots).await;
            return Some((Ok(event), (rx, snapshots, false)));
        }
        loop {
            let event = match rx.recv().await {
                Ok(BroadcastMessage::StateUpdated) => state_event(&snapshots).await,
                Ok(BroadcastMessage::Error(message)) => text_event("error", &message),
                Ok(BroadcastMessage::Log(message)) => text_event("log", &message),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("HTTP API: event stream lagged by {}", n);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            };
            return Some((Ok(event), (rx, snapshots, false)));
        }
    })
}

async fn state_event(snapshots: &SnapshotStore) -> Event {
    let snapshot = snapshots.get().await;
    match serde_json::to_string(&snapshot) {
        Ok(json) => Event::default().event("state").data(json),
        Err(e) => text_event("error", &format!("snapshot encode failed: {e}")),
    }
}

fn text_event(name: &str, message: &str) -> Event {
    Event::default().event(name).data(message.replace('\r', ""))
}
