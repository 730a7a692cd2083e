//! Integration tests driving the observer endpoint over real sockets: the
//! WebSocket handshake/snapshot/update flow and the REST read surface.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use tt_bridge::http::router;
use tt_bridge::hub::BroadcastHub;
use tt_bridge::protocol::{ServerMessage, TeamUpdatePayload};
use tt_bridge::state::ApiState;
use tt_core::aggregator::{StateAggregator, TeamState};
use tt_core::classify::PathClass;
use tt_core::store::SessionStore;
use tt_core::types::{Member, TeamChange, TeamConfig, TeamUpdate};
use tt_core::watcher::ChangeEvent;

fn team_config(name: &str, created_at: i64) -> TeamConfig {
    TeamConfig {
        name: name.into(),
        description: Some("integration fixture".into()),
        created_at,
        lead_agent_id: Some("lead".into()),
        members: vec![Member {
            agent_id: "lead".into(),
            name: "lead".into(),
            agent_type: Some("lead".into()),
            model: None,
            color: None,
            joined_at: Some(created_at),
        }],
    }
}

struct Harness {
    addr: std::net::SocketAddr,
    teams: Arc<TeamState>,
    store: Arc<SessionStore>,
    hub: BroadcastHub,
}

async fn start_harness() -> Harness {
    let teams = Arc::new(TeamState::new());
    let store = Arc::new(SessionStore::open_in_memory().await.unwrap());
    let hub = BroadcastHub::new();
    let state = Arc::new(ApiState::new(
        teams.clone(),
        store.clone(),
        hub.clone(),
        Duration::from_secs(30),
    ));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.ok();
    });

    Harness {
        addr,
        teams,
        store,
        hub,
    }
}

async fn connect(
    addr: std::net::SocketAddr,
) -> WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>> {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .expect("websocket connects");
    ws
}

async fn next_envelope(
    ws: &mut (impl Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> serde_json::Value {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("stream ended")
            .expect("transport error");
        if let WsMessage::Text(text) = frame {
            return serde_json::from_str(&text).expect("frames are json envelopes");
        }
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn observer_gets_snapshot_then_incremental_updates() {
    let harness = start_harness().await;
    let mut ws = connect(harness.addr).await;

    // First frame is always the full snapshot.
    let envelope = next_envelope(&mut ws).await;
    assert_eq!(envelope["type"], "full_state");
    assert!(envelope["sentAt"].is_string());
    assert!(envelope["payload"]["teams"].as_array().unwrap().is_empty());

    // An aggregator change fans out as an incremental team update.
    let update = TeamUpdate {
        team: "alpha".into(),
        change: TeamChange::Config(team_config("alpha", 1000)),
    };
    harness
        .hub
        .publish(ServerMessage::TeamUpdate(TeamUpdatePayload::from(update)));

    let envelope = next_envelope(&mut ws).await;
    assert_eq!(envelope["type"], "team_update");
    assert_eq!(envelope["payload"]["team"], "alpha");
    assert_eq!(envelope["payload"]["change"], "config");
    assert_eq!(envelope["payload"]["config"]["createdAt"], 1000);
}

#[tokio::test(flavor = "multi_thread")]
async fn history_requests_are_answered_point_to_point() {
    let harness = start_harness().await;
    let (session_id, _) = harness
        .store
        .ensure_session(&team_config("alpha", 1000))
        .await
        .unwrap();

    let mut ws = connect(harness.addr).await;
    let _snapshot = next_envelope(&mut ws).await;

    ws.send(WsMessage::Text(r#"{"type":"get_history"}"#.into()))
        .await
        .unwrap();
    let envelope = next_envelope(&mut ws).await;
    assert_eq!(envelope["type"], "history_index");
    let rows = envelope["payload"].as_array().unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["teamName"], "alpha");

    let request = format!(r#"{{"type":"get_session","payload":{{"id":{session_id}}}}}"#);
    ws.send(WsMessage::Text(request.into())).await.unwrap();
    let envelope = next_envelope(&mut ws).await;
    assert_eq!(envelope["type"], "session_detail");
    assert_eq!(envelope["payload"]["config"]["name"], "alpha");

    // Unknown sessions come back as error envelopes, not dropped sockets.
    ws.send(WsMessage::Text(
        r#"{"type":"get_session","payload":{"id":99999}}"#.into(),
    ))
    .await
    .unwrap();
    let envelope = next_envelope(&mut ws).await;
    assert_eq!(envelope["type"], "error");
}

#[tokio::test(flavor = "multi_thread")]
async fn switch_team_resends_snapshot_with_requested_team_active() {
    let harness = start_harness().await;

    // Put one team into the aggregated state through a real merge.
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("config.json");
    std::fs::write(
        &config_path,
        r#"{"name":"alpha","createdAt":1000,"members":[]}"#,
    )
    .unwrap();
    let (updates_tx, _updates_rx) = flume::unbounded();
    let aggregator = StateAggregator::new(harness.teams.clone(), updates_tx);
    aggregator
        .apply(&ChangeEvent {
            class: PathClass::TeamConfig {
                team: "alpha".into(),
            },
            path: config_path,
        })
        .await;

    let mut ws = connect(harness.addr).await;
    let _snapshot = next_envelope(&mut ws).await;

    ws.send(WsMessage::Text(
        r#"{"type":"switch_team","payload":{"team":"alpha"}}"#.into(),
    ))
    .await
    .unwrap();
    let envelope = next_envelope(&mut ws).await;
    assert_eq!(envelope["type"], "full_state");
    assert_eq!(envelope["payload"]["activeTeam"], "alpha");

    ws.send(WsMessage::Text(
        r#"{"type":"switch_team","payload":{"team":"missing"}}"#.into(),
    ))
    .await
    .unwrap();
    let envelope = next_envelope(&mut ws).await;
    assert_eq!(envelope["type"], "error");
}

#[tokio::test(flavor = "multi_thread")]
async fn rest_surface_serves_history_and_detail() {
    let harness = start_harness().await;
    let config = team_config("alpha", 1000);
    let (session_id, _) = harness.store.ensure_session(&config).await.unwrap();
    harness
        .store
        .record_members(session_id, &config.members)
        .await
        .unwrap();

    let base = format!("http://{}", harness.addr);
    let client = reqwest::Client::new();

    let rows: serde_json::Value = client
        .get(format!("{base}/api/sessions"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(rows.as_array().unwrap().len(), 1);
    assert_eq!(rows[0]["teamName"], "alpha");

    let detail: serde_json::Value = client
        .get(format!("{base}/api/sessions/{session_id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(detail["config"]["name"], "alpha");
    assert_eq!(detail["members"].as_array().unwrap().len(), 1);

    let missing = client
        .get(format!("{base}/api/sessions/99999"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), reqwest::StatusCode::NOT_FOUND);
}
