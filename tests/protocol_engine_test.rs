//! Protocol engine integration tests over in-memory WebSocket pairs

mod common;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};
use tokio_util::sync::CancellationToken;

use common::{memory_store, next_json, ws_pair, ServerSide};
use tether::connectivity::{Connectivity, Watchdog};
use tether::identity::{IdentityKey, IdentityStore};
use tether::protocol::{ClientProfile, EngineConfig, EngineState, ProtocolEngine, Termination};
use tether::session::HeartbeatConfig;
use tether::transport::ProxySpec;

/// Heartbeat pushed far enough out that it never interferes
fn quiet_config() -> EngineConfig {
    EngineConfig {
        idle_timeout: Duration::from_secs(30),
        heartbeat: HeartbeatConfig {
            interval: Duration::from_secs(3600),
            initial_delay: Duration::from_secs(3600),
            version: "1.0.0".to_string(),
        },
    }
}

async fn engine_for(store: &IdentityStore, user: &str) -> ProtocolEngine {
    let identity = store.resolve(&IdentityKey::direct(user)).await.unwrap();
    let token = store.load_token(user).await.unwrap();
    ProtocolEngine::new(identity, ClientProfile::default(), token, store.clone())
}

async fn start(
    mut engine: ProtocolEngine,
    config: EngineConfig,
) -> (
    ServerSide,
    CancellationToken,
    JoinHandle<(ProtocolEngine, Termination)>,
) {
    let (client, server) = ws_pair().await;
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let handle = tokio::spawn(async move {
        let termination = engine.run(client, &config, None, &token).await;
        (engine, termination)
    });
    (server, cancel, handle)
}

async fn send(server: &mut ServerSide, value: serde_json::Value) {
    server.send(Message::Text(value.to_string())).await.unwrap();
}

async fn close(mut server: ServerSide) {
    server.close(None).await.unwrap();
    while let Some(Ok(_)) = server.next().await {}
}

#[tokio::test]
async fn test_auth_on_fresh_store_sends_browser_id() {
    let store = memory_store();
    let engine = engine_for(&store, "u1").await;
    let device_id = engine.identity().device_id.clone();
    let (mut server, _cancel, handle) = start(engine, quiet_config()).await;

    send(&mut server, json!({"id": "a1", "action": "AUTH", "data": {}})).await;
    let reply = next_json(&mut server).await.unwrap();

    assert_eq!(reply["id"], "a1");
    assert_eq!(reply["origin_action"], "AUTH");
    assert_eq!(reply["result"]["browser_id"], device_id.as_str());
    assert_eq!(reply["result"]["user_id"], "u1");
    assert_eq!(reply["result"]["device_type"], "extension");
    assert!(reply["result"]["timestamp"].as_i64().unwrap() > 0);
    assert!(reply["result"].get("token").is_none());

    close(server).await;
    let (engine, termination) = handle.await.unwrap();
    assert_eq!(termination, Termination::NormalClose);
    assert_eq!(engine.state(), EngineState::Closed);
}

#[tokio::test]
async fn test_auth_with_cached_token() {
    let store = memory_store();
    store.save_token("u1", "tok-1").await.unwrap();
    let engine = engine_for(&store, "u1").await;
    let device_id = engine.identity().device_id.clone();
    let (mut server, _cancel, handle) = start(engine, quiet_config()).await;

    send(&mut server, json!({"id": "a2", "action": "AUTH"})).await;
    let reply = next_json(&mut server).await.unwrap();

    assert_eq!(reply["id"], "a2");
    assert_eq!(reply["result"]["token"], "tok-1");
    assert_eq!(reply["result"]["device_id"], device_id.as_str());
    assert!(reply["result"].get("browser_id").is_none());

    close(server).await;
    handle.await.unwrap();
}

#[tokio::test]
async fn test_auth_success_persists_token_and_is_used_for_next_auth() {
    let store = memory_store();
    let engine = engine_for(&store, "u1").await;
    let (mut server, _cancel, handle) = start(engine, quiet_config()).await;

    send(
        &mut server,
        json!({"id": "s1", "action": "AUTH_SUCCESS", "result": {"token": "tok-2"}}),
    )
    .await;
    send(&mut server, json!({"id": "a3", "action": "AUTH"})).await;

    let reply = next_json(&mut server).await.unwrap();
    assert_eq!(reply["id"], "a3");
    assert_eq!(reply["result"]["token"], "tok-2");
    assert_eq!(store.load_token("u1").await.unwrap().as_deref(), Some("tok-2"));

    close(server).await;
    let (engine, _) = handle.await.unwrap();
    assert_eq!(engine.token(), Some("tok-2"));
}

#[tokio::test]
async fn test_server_ping_is_answered_with_pong() {
    let store = memory_store();
    let engine = engine_for(&store, "u1").await;
    let (mut server, _cancel, handle) = start(engine, quiet_config()).await;

    send(&mut server, json!({"id": "p1", "action": "PING", "data": {}})).await;
    let reply = next_json(&mut server).await.unwrap();
    assert_eq!(reply, json!({"id": "p1", "origin_action": "PONG"}));

    close(server).await;
    handle.await.unwrap();
}

#[tokio::test]
async fn test_unknown_and_malformed_messages_are_skipped() {
    let store = memory_store();
    let engine = engine_for(&store, "u1").await;
    let (mut server, _cancel, handle) = start(engine, quiet_config()).await;

    send(&mut server, json!({"id": "x1", "action": "HTTP_REQUEST", "data": {}})).await;
    server
        .send(Message::Text("{not json".to_string()))
        .await
        .unwrap();
    send(&mut server, json!({"id": "p2", "action": "PONG"})).await;

    // The first reply belongs to the last message
    let reply = next_json(&mut server).await.unwrap();
    assert_eq!(reply["id"], "p2");
    assert_eq!(reply["origin_action"], "PONG");

    close(server).await;
    handle.await.unwrap();
}

#[tokio::test]
async fn test_replies_follow_arrival_order() {
    let store = memory_store();
    let engine = engine_for(&store, "u1").await;
    let (mut server, _cancel, handle) = start(engine, quiet_config()).await;

    for id in ["m1", "m2", "m3"] {
        send(&mut server, json!({"id": id, "action": "PING"})).await;
    }
    for id in ["m1", "m2", "m3"] {
        assert_eq!(next_json(&mut server).await.unwrap()["id"], id);
    }

    close(server).await;
    handle.await.unwrap();
}

#[tokio::test]
async fn test_transport_ping_frame_gets_pong_frame() {
    let store = memory_store();
    let engine = engine_for(&store, "u1").await;
    let (mut server, _cancel, handle) = start(engine, quiet_config()).await;

    server.send(Message::Ping(b"hb".to_vec())).await.unwrap();
    let frame = server.next().await.unwrap().unwrap();
    assert_eq!(frame, Message::Pong(b"hb".to_vec()));

    close(server).await;
    handle.await.unwrap();
}

#[tokio::test]
async fn test_error_close_code_is_abnormal() {
    let store = memory_store();
    let engine = engine_for(&store, "u1").await;
    let (mut server, _cancel, handle) = start(engine, quiet_config()).await;

    server
        .close(Some(CloseFrame {
            code: CloseCode::Error,
            reason: "boom".into(),
        }))
        .await
        .unwrap();
    while let Some(Ok(_)) = server.next().await {}

    let (_, termination) = handle.await.unwrap();
    assert!(matches!(termination, Termination::AbnormalClose(reason) if reason.contains("boom")));
}

#[tokio::test]
async fn test_dropped_socket_is_abnormal() {
    let store = memory_store();
    let engine = engine_for(&store, "u1").await;
    let (server, _cancel, handle) = start(engine, quiet_config()).await;

    drop(server);

    let (_, termination) = handle.await.unwrap();
    assert!(matches!(termination, Termination::AbnormalClose(_)));
}

#[tokio::test(start_paused = true)]
async fn test_idle_connection_times_out() {
    let store = memory_store();
    let engine = engine_for(&store, "u1").await;
    let (_server, _cancel, handle) = start(engine, quiet_config()).await;

    let (engine, termination) = handle.await.unwrap();
    assert_eq!(termination, Termination::Timeout);
    assert_eq!(engine.state(), EngineState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_pings_until_cancelled() {
    let store = memory_store();
    let engine = engine_for(&store, "u1").await;
    let config = EngineConfig {
        idle_timeout: Duration::from_secs(3600),
        heartbeat: HeartbeatConfig {
            interval: Duration::from_secs(20),
            initial_delay: Duration::from_secs(1),
            version: "1.0.0".to_string(),
        },
    };
    let (mut server, cancel, handle) = start(engine, config).await;

    for _ in 0..2 {
        let ping = next_json(&mut server).await.unwrap();
        assert_eq!(ping["action"], "PING");
        assert_eq!(ping["version"], "1.0.0");
        assert_eq!(ping["data"], json!({}));
    }

    cancel.cancel();
    let (_, termination) = handle.await.unwrap();
    assert_eq!(termination, Termination::Cancelled);

    // Only the close handshake may follow
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert!(next_json(&mut server).await.is_none());
}

struct Offline;

#[async_trait]
impl Connectivity for Offline {
    async fn probe(&self, _proxy: Option<&ProxySpec>) -> bool {
        false
    }
}

#[tokio::test(start_paused = true)]
async fn test_failed_recheck_closes_connection() {
    let store = memory_store();
    let mut engine = engine_for(&store, "u1").await;
    let (client, _server) = ws_pair().await;
    let watchdog = Watchdog::new(Arc::new(Offline), None, Duration::from_secs(10));

    let config = EngineConfig {
        idle_timeout: Duration::from_secs(3600),
        ..quiet_config()
    };
    let termination = engine
        .run(client, &config, Some(&watchdog), &CancellationToken::new())
        .await;

    assert_eq!(
        termination,
        Termination::AbnormalClose("connectivity lost".to_string())
    );
}
