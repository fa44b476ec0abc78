//! HTTP routes: each endpoint maps onto one `Command` for the session loop.

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use streamradio::core::SessionEvent;
use streamradio::http::{router, HttpState};
use streamradio_proto::protocol::{Command, SessionSnapshot, SortKey, Station};
use streamradio_proto::state::SnapshotStore;
use tokio::sync::{broadcast, mpsc};
use tower::ServiceExt;

struct Api {
    app: Router,
    events: mpsc::Receiver<SessionEvent>,
    snapshots: SnapshotStore,
}

fn api() -> Api {
    let snapshots = SnapshotStore::default();
    let (event_tx, events) = mpsc::channel(16);
    let (broadcast_tx, _) = broadcast::channel(16);
    let app = router(HttpState::new(snapshots.clone(), event_tx, broadcast_tx));
    Api {
        app,
        events,
        snapshots,
    }
}

async fn call(app: &Router, method: Method, uri: &str) -> (StatusCode, Vec<u8>) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, body.to_vec())
}

fn next_command(events: &mut mpsc::Receiver<SessionEvent>) -> Command {
    match events.try_recv() {
        Ok(SessionEvent::Command(cmd)) => cmd,
        other => panic!("expected a command, got {:?}", other),
    }
}

#[tokio::test]
async fn state_returns_published_snapshot() {
    let api = api();
    let mut snapshot = SessionSnapshot::default();
    snapshot.stations.push(Station::new("s-1", "One", "http://one"));
    snapshot.is_loading = true;
    api.snapshots.publish(snapshot).await;

    let (status, body) = call(&api.app, Method::GET, "/api/state").await;
    assert_eq!(status, StatusCode::OK);

    let decoded: SessionSnapshot = serde_json::from_slice(&body).unwrap();
    assert_eq!(decoded.rev, 1);
    assert!(decoded.is_loading);
    assert_eq!(decoded.stations[0].id, "s-1");
}

#[tokio::test]
async fn search_sends_set_term() {
    let mut api = api();
    let (status, _) = call(&api.app, Method::GET, "/api/search?term=jazz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        next_command(&mut api.events),
        Command::SetTerm { term: "jazz".into() }
    );

    // Missing term means the empty (browse-all) search.
    call(&api.app, Method::POST, "/api/search").await;
    assert_eq!(
        next_command(&mut api.events),
        Command::SetTerm { term: String::new() }
    );
}

#[tokio::test]
async fn sort_validates_key() {
    let mut api = api();

    let (status, body) = call(&api.app, Method::POST, "/api/sort/bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(String::from_utf8_lossy(&body).contains("bogus"));
    assert!(api.events.try_recv().is_err());

    let (status, _) = call(&api.app, Method::POST, "/api/sort/votes").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        next_command(&mut api.events),
        Command::SetSort {
            sort_key: SortKey::Votes
        }
    );
}

#[tokio::test]
async fn playback_and_favorite_routes() {
    let mut api = api();

    call(&api.app, Method::POST, "/api/play/s-7").await;
    assert_eq!(
        next_command(&mut api.events),
        Command::TogglePlay {
            station_id: "s-7".into()
        }
    );

    call(&api.app, Method::POST, "/api/stop").await;
    assert_eq!(next_command(&mut api.events), Command::Stop);

    call(&api.app, Method::POST, "/api/more").await;
    assert_eq!(next_command(&mut api.events), Command::LoadMore);

    call(&api.app, Method::POST, "/api/favorite/s-7").await;
    assert_eq!(
        next_command(&mut api.events),
        Command::ToggleFavorite {
            station_id: "s-7".into()
        }
    );

    call(&api.app, Method::DELETE, "/api/favorite/s-7").await;
    assert_eq!(
        next_command(&mut api.events),
        Command::RemoveFavorite {
            station_id: "s-7".into()
        }
    );
}

#[tokio::test]
async fn commands_fail_when_session_loop_is_gone() {
    let Api { app, events, .. } = api();
    drop(events);

    let (status, _) = call(&app, Method::POST, "/api/stop").await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    // Reads still work from the last snapshot.
    let (status, _) = call(&app, Method::GET, "/api/state").await;
    assert_eq!(status, StatusCode::OK);
}
