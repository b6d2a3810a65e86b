//! End-to-end WebSocket scenarios against a full server instance.
//!
//! Each test spins up its own server on an ephemeral port with in-memory
//! storage.  Client source addresses are injected through `x-forwarded-for`
//! so tests don't trip each other's per-source rate limits.

use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use drift::server::router::build_router;
use drift::server::state::AppState;
use drift::storage::Storage;

type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

async fn start_server() -> (String, AppState, oneshot::Sender<()>) {
    let storage = Storage::open_in_memory().expect("open storage");
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let media_dir =
        std::env::temp_dir().join(format!("drift-test-{}-{nanos}", std::process::id()));
    std::fs::create_dir_all(&media_dir).expect("media dir");

    let state = AppState::new(storage, media_dir);
    let app = build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind server");
    let addr = listener.local_addr().expect("server addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    (format!("127.0.0.1:{}", addr.port()), state, shutdown_tx)
}

async fn connect(addr: &str, source: &str) -> WsClient {
    let mut request = format!("ws://{addr}/ws")
        .into_client_request()
        .expect("ws request");
    request.headers_mut().insert(
        "x-forwarded-for",
        HeaderValue::from_str(source).expect("header value"),
    );
    let (socket, _) = tokio_tungstenite::connect_async(request)
        .await
        .expect("ws connect");
    socket
}

async fn send_frame(client: &mut WsClient, frame: Value) {
    client
        .send(Message::Text(frame.to_string()))
        .await
        .expect("send frame");
}

async fn recv_frame(client: &mut WsClient) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("timed out waiting for frame")
            .expect("connection closed")
            .expect("frame error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("frame json");
        }
    }
}

/// Receive one frame and assert its type tag, returning the data payload.
async fn expect_frame(client: &mut WsClient, expected: &str) -> Value {
    let frame = recv_frame(client).await;
    assert_eq!(
        frame["type"].as_str(),
        Some(expected),
        "unexpected frame: {frame}"
    );
    frame["data"].clone()
}

async fn assert_no_frame(client: &mut WsClient, wait_ms: u64) {
    let result = tokio::time::timeout(Duration::from_millis(wait_ms), client.next()).await;
    assert!(result.is_err(), "unexpected frame: {result:?}");
}

/// Join both clients and return the shared room id.
async fn pair(a: &mut WsClient, b: &mut WsClient) -> String {
    send_frame(a, json!({"type": "join_queue"})).await;
    expect_frame(a, "queue_joined").await;
    send_frame(b, json!({"type": "join_queue"})).await;
    expect_frame(b, "queue_joined").await;

    let data_a = expect_frame(a, "partner_found").await;
    let data_b = expect_frame(b, "partner_found").await;
    let room = data_a["roomId"].as_str().expect("roomId").to_string();
    assert_eq!(data_b["roomId"].as_str(), Some(room.as_str()));
    room
}

#[tokio::test]
async fn happy_pair_exchange_and_leave() {
    let (addr, state, _shutdown) = start_server().await;
    let mut a = connect(&addr, "10.1.0.1").await;
    let mut b = connect(&addr, "10.1.0.2").await;

    let room = pair(&mut a, &mut b).await;

    send_frame(&mut a, json!({"type": "send_message", "data": {"content": "hello"}})).await;
    let data = expect_frame(&mut b, "message_received").await;
    let message = &data["message"];
    assert_eq!(message["content"], "hello");
    assert_eq!(message["type"], "user");
    assert!(message["timestamp"].as_u64().unwrap() > 0);
    assert!(!message["senderId"].as_str().unwrap().is_empty());
    assert!(!message["id"].as_str().unwrap().is_empty());

    assert_eq!(state.chat.counters.messages_today().await, 1);

    send_frame(&mut a, json!({"type": "disconnect_chat"})).await;
    expect_frame(&mut b, "partner_disconnected").await;

    // Both sides cycled back to Idle: they can queue again
    send_frame(&mut a, json!({"type": "join_queue"})).await;
    expect_frame(&mut a, "queue_joined").await;
    send_frame(&mut b, json!({"type": "join_queue"})).await;
    expect_frame(&mut b, "queue_joined").await;
    expect_frame(&mut a, "partner_found").await;
    expect_frame(&mut b, "partner_found").await;

    // The first room was closed in the session log
    let storage = state.chat.storage.lock().await;
    let log = storage.get_session_log(&room).unwrap().unwrap();
    assert!(!log.is_active);
    assert_eq!(log.message_count, 1);
}

#[tokio::test]
async fn message_rate_limit_refuses_frame_21() {
    let (addr, _state, _shutdown) = start_server().await;
    let mut a = connect(&addr, "10.2.0.1").await;
    let mut b = connect(&addr, "10.2.0.2").await;
    pair(&mut a, &mut b).await;

    for i in 0..21 {
        send_frame(
            &mut a,
            json!({"type": "send_message", "data": {"content": format!("message {i}")}}),
        )
        .await;
    }

    for _ in 0..20 {
        expect_frame(&mut b, "message_received").await;
    }
    expect_frame(&mut a, "rate_limited").await;
    assert_no_frame(&mut b, 300).await;
}

#[tokio::test]
async fn profanity_is_flagged_and_never_relayed() {
    let (addr, state, _shutdown) = start_server().await;
    let mut a = connect(&addr, "10.3.0.1").await;
    let mut b = connect(&addr, "10.3.0.2").await;
    let room = pair(&mut a, &mut b).await;

    send_frame(
        &mut a,
        json!({"type": "send_message", "data": {"content": "you fucking idiot"}}),
    )
    .await;
    expect_frame(&mut a, "message_flagged").await;
    assert_no_frame(&mut b, 300).await;

    let storage = state.chat.storage.lock().await;
    let messages = storage.list_room_messages(&room).unwrap();
    assert_eq!(messages.len(), 1);
    assert!(messages[0].flagged);
    assert_eq!(messages[0].flag_reason.as_deref(), Some("profanity"));
}

#[tokio::test]
async fn banned_source_gets_one_frame_and_no_session() {
    let (addr, state, _shutdown) = start_server().await;
    {
        let storage = state.chat.storage.lock().await;
        storage
            .insert_ban("10.4.0.1", "test ban", "admin", 1)
            .unwrap();
    }

    let mut client = connect(&addr, "10.4.0.1").await;
    let frame = recv_frame(&mut client).await;
    assert_eq!(frame["type"], "banned");

    // The channel closes and no session was ever registered
    match tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .expect("timed out waiting for close")
    {
        None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
        Some(Ok(other)) => panic!("expected close, got {other:?}"),
    }
    assert_eq!(state.chat.registry.session_count().await, 0);
}

#[tokio::test]
async fn fifo_pairing_skips_dropped_waiter() {
    let (addr, _state, _shutdown) = start_server().await;
    let mut a = connect(&addr, "10.5.0.1").await;
    let mut b = connect(&addr, "10.5.0.2").await;
    let mut c = connect(&addr, "10.5.0.3").await;

    send_frame(&mut a, json!({"type": "join_queue"})).await;
    expect_frame(&mut a, "queue_joined").await;
    send_frame(&mut b, json!({"type": "join_queue"})).await;
    expect_frame(&mut b, "queue_joined").await;

    // a pairs with b first, in join order
    expect_frame(&mut a, "partner_found").await;
    expect_frame(&mut b, "partner_found").await;

    // a drops its channel; b reverts to Idle and rejoins
    a.close(None).await.ok();
    expect_frame(&mut b, "partner_disconnected").await;
    send_frame(&mut b, json!({"type": "join_queue"})).await;
    expect_frame(&mut b, "queue_joined").await;

    send_frame(&mut c, json!({"type": "join_queue"})).await;
    expect_frame(&mut c, "queue_joined").await;

    let room_b = expect_frame(&mut b, "partner_found").await;
    let room_c = expect_frame(&mut c, "partner_found").await;
    assert_eq!(room_b["roomId"], room_c["roomId"]);
}

#[tokio::test]
async fn partner_close_delivers_disconnect_and_nothing_after() {
    let (addr, _state, _shutdown) = start_server().await;
    let mut a = connect(&addr, "10.6.0.1").await;
    let mut b = connect(&addr, "10.6.0.2").await;
    pair(&mut a, &mut b).await;

    send_frame(&mut b, json!({"type": "send_message", "data": {"content": "hi"}})).await;
    a.close(None).await.ok();

    // b must see the disconnect, and no message delivery for this pairing
    // afterwards (a late error frame for b's own in-flight send is fine)
    expect_frame(&mut b, "partner_disconnected").await;
    while let Ok(Some(Ok(Message::Text(text)))) =
        tokio::time::timeout(Duration::from_millis(300), b.next()).await
    {
        let frame: Value = serde_json::from_str(&text).expect("frame json");
        assert_ne!(frame["type"], "message_received", "late delivery: {frame}");
    }
}

#[tokio::test]
async fn rejoining_queue_while_waiting_is_an_error() {
    let (addr, state, _shutdown) = start_server().await;
    let mut a = connect(&addr, "10.7.0.1").await;

    send_frame(&mut a, json!({"type": "join_queue"})).await;
    expect_frame(&mut a, "queue_joined").await;

    send_frame(&mut a, json!({"type": "join_queue"})).await;
    let data = expect_frame(&mut a, "error").await;
    assert_eq!(data["message"], "Already waiting for a partner");
    assert_eq!(state.chat.matchmaker.len().await, 1);
}

#[tokio::test]
async fn illegal_send_in_idle_keeps_connection() {
    let (addr, _state, _shutdown) = start_server().await;
    let mut a = connect(&addr, "10.8.0.1").await;

    send_frame(&mut a, json!({"type": "send_message", "data": {"content": "hi"}})).await;
    let data = expect_frame(&mut a, "error").await;
    assert_eq!(data["message"], "Not connected to a partner");

    // Still usable afterwards
    send_frame(&mut a, json!({"type": "join_queue"})).await;
    expect_frame(&mut a, "queue_joined").await;
}

#[tokio::test]
async fn malformed_and_unknown_frames_are_ignored() {
    let (addr, _state, _shutdown) = start_server().await;
    let mut a = connect(&addr, "10.9.0.1").await;

    a.send(Message::Text("not json at all".to_string()))
        .await
        .expect("send garbage");
    send_frame(&mut a, json!({"type": "warp_drive"})).await;

    // Connection survived both
    send_frame(&mut a, json!({"type": "join_queue"})).await;
    expect_frame(&mut a, "queue_joined").await;
}

#[tokio::test]
async fn media_reference_is_relayed() {
    let (addr, _state, _shutdown) = start_server().await;
    let mut a = connect(&addr, "10.10.0.1").await;
    let mut b = connect(&addr, "10.10.0.2").await;
    pair(&mut a, &mut b).await;

    send_frame(
        &mut a,
        json!({"type": "send_media", "data": {
            "url": "/media/abcd.png", "kind": "image", "name": "cat.png", "size": 512
        }}),
    )
    .await;
    let data = expect_frame(&mut b, "media_received").await;
    let message = &data["message"];
    assert_eq!(message["mediaUrl"], "/media/abcd.png");
    assert_eq!(message["mediaKind"], "image");
    assert_eq!(message["fileName"], "cat.png");
    assert_eq!(message["fileSize"], 512);

    // Bad kind is a validation error back to the sender
    send_frame(
        &mut a,
        json!({"type": "send_media", "data": {"url": "/media/x.bin", "kind": "audio"}}),
    )
    .await;
    let data = expect_frame(&mut a, "error").await;
    assert_eq!(data["message"], "Invalid media");
}

#[tokio::test]
async fn typing_indicators_are_forwarded_not_echoed() {
    let (addr, _state, _shutdown) = start_server().await;
    let mut a = connect(&addr, "10.11.0.1").await;
    let mut b = connect(&addr, "10.11.0.2").await;
    pair(&mut a, &mut b).await;

    send_frame(&mut a, json!({"type": "typing"})).await;
    expect_frame(&mut b, "partner_typing").await;
    // Repeats inside the coalescing window are absorbed
    send_frame(&mut a, json!({"type": "typing"})).await;
    assert_no_frame(&mut b, 300).await;

    send_frame(&mut a, json!({"type": "stop_typing"})).await;
    expect_frame(&mut b, "partner_stopped_typing").await;
    // Nothing ever came back to the typist
    assert_no_frame(&mut a, 100).await;
}

#[tokio::test]
async fn connection_rate_limit_refuses_sixth_connect() {
    let (addr, _state, _shutdown) = start_server().await;

    let mut held = Vec::new();
    for _ in 0..5 {
        let mut client = connect(&addr, "10.12.0.1").await;
        // Round-trip through the session loop so this connection's admission
        // (and its rate increment) has definitely completed
        send_frame(&mut client, json!({"type": "join_queue"})).await;
        expect_frame(&mut client, "queue_joined").await;
        held.push(client);
    }

    let mut sixth = connect(&addr, "10.12.0.1").await;
    let frame = recv_frame(&mut sixth).await;
    assert_eq!(frame["type"], "rate_limited");
}
