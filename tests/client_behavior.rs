use std::sync::{Arc, Mutex, Once};

use core_types::{
    ConnectionState, EventKind, ListenerId, OutboundMessage, SignalType, SignallingConfig,
    SignallingError, SignallingEvent, UserInfo, UserStatus,
};
use signalling::SignallingClient;
use signalling_mock::{ConnectBehavior, MockConnector, MockSession};
use tokio::time::{sleep, timeout, Duration, Instant};

static INIT_TRACING: Once = Once::new();

fn init_tracing() {
    INIT_TRACING.call_once(|| {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .init();
    });
}

fn test_config() -> SignallingConfig {
    SignallingConfig {
        url: "ws://localhost:9000/signalling".to_string(),
        protocols: Vec::new(),
        timeout: 1_000,
        reconnect_interval: 100,
        max_reconnect_attempts: 5,
        heartbeat_interval: 30_000,
    }
}

fn user(id: &str) -> UserInfo {
    UserInfo {
        id: id.to_string(),
        name: format!("user {id}"),
        avatar: None,
        status: UserStatus::Online,
    }
}

/// 全イベント種別を購読して記録する
fn record_events(client: &SignallingClient) -> Arc<Mutex<Vec<SignallingEvent>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    for kind in [
        EventKind::ConnectionStateChanged,
        EventKind::MessageReceived,
        EventKind::UserJoined,
        EventKind::UserLeft,
        EventKind::RoomUsersUpdated,
        EventKind::Error,
    ] {
        let log = log.clone();
        client.on(
            kind,
            Box::new(move |event| log.lock().unwrap().push(event.clone())),
        );
    }
    log
}

async fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        if Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        sleep(Duration::from_millis(5)).await;
    }
}

async fn next_session(
    sessions: &mut tokio::sync::mpsc::UnboundedReceiver<MockSession>,
) -> MockSession {
    timeout(Duration::from_secs(1), sessions.recv())
        .await
        .expect("timed out waiting for a session")
        .expect("connector dropped")
}

async fn next_frame(session: &mut MockSession) -> serde_json::Value {
    let text = timeout(Duration::from_secs(1), session.outbound.recv())
        .await
        .expect("timed out waiting for an outbound frame")
        .expect("connection dropped");
    serde_json::from_str(&text).expect("outbound frame is not json")
}

async fn assert_no_frame(session: &mut MockSession) {
    let result = timeout(Duration::from_millis(100), session.outbound.recv()).await;
    assert!(result.is_err(), "unexpected outbound frame: {result:?}");
}

fn state_changes(log: &Arc<Mutex<Vec<SignallingEvent>>>) -> Vec<ConnectionState> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            SignallingEvent::ConnectionStateChanged(state) => Some(*state),
            _ => None,
        })
        .collect()
}

fn errors(log: &Arc<Mutex<Vec<SignallingEvent>>>) -> Vec<SignallingError> {
    log.lock()
        .unwrap()
        .iter()
        .filter_map(|event| match event {
            SignallingEvent::Error(e) => Some(e.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn connect_opens_socket_and_reports_connected() {
    init_tracing();
    let (connector, mut sessions) = MockConnector::new();
    let client = SignallingClient::spawn("c1", connector.clone());
    let log = record_events(&client);

    client.connect(test_config()).await.unwrap();

    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert_eq!(connector.attempts(), 1);
    assert_eq!(
        state_changes(&log),
        vec![ConnectionState::Connecting, ConnectionState::Connected]
    );
    let _session = next_session(&mut sessions).await;
}

#[tokio::test]
async fn connect_times_out_when_socket_never_opens() {
    init_tracing();
    let (connector, _sessions) = MockConnector::new();
    connector.push(ConnectBehavior::Hang);
    let client = SignallingClient::spawn("c1", connector);

    let mut config = test_config();
    config.timeout = 100;
    let err = client.connect(config).await.unwrap_err();

    assert_eq!(err, SignallingError::ConnectionTimeout(100));
    assert_eq!(client.connection_state(), ConnectionState::Error);
}

#[tokio::test]
async fn connect_can_be_retried_after_failure() {
    init_tracing();
    let (connector, mut sessions) = MockConnector::new();
    connector.push(ConnectBehavior::Fail("refused".to_string()));
    let client = SignallingClient::spawn("c1", connector);

    let err = client.connect(test_config()).await.unwrap_err();
    assert_eq!(err, SignallingError::Transport("refused".to_string()));
    assert_eq!(client.connection_state(), ConnectionState::Error);

    // Error 状態からの connect のやり直し
    client.connect(test_config()).await.unwrap();
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    let _session = next_session(&mut sessions).await;
}

#[tokio::test]
async fn send_message_stamps_id_timestamp_and_from() {
    init_tracing();
    let (connector, mut sessions) = MockConnector::new();
    let client = SignallingClient::spawn("alice", connector);
    client.connect(test_config()).await.unwrap();
    let mut session = next_session(&mut sessions).await;

    let before = now_millis();
    client
        .send_message(OutboundMessage {
            kind: SignalType::Message,
            to: Some("bob".to_string()),
            room: None,
            data: Some(serde_json::json!({ "text": "hi" })),
        })
        .await
        .unwrap();

    let frame = next_frame(&mut session).await;
    assert_eq!(frame["type"], "message");
    assert_eq!(frame["from"], "alice");
    assert_eq!(frame["to"], "bob");
    assert_eq!(frame["data"]["text"], "hi");

    let id = frame["id"].as_str().unwrap();
    assert!(id.starts_with("alice-"), "unexpected id: {id}");
    let timestamp = frame["timestamp"].as_u64().unwrap();
    assert!(timestamp >= before && timestamp <= now_millis() + 1);
}

#[tokio::test]
async fn send_while_disconnected_fails_without_connecting() {
    init_tracing();
    let (connector, _sessions) = MockConnector::new();
    let client = SignallingClient::spawn("c1", connector.clone());

    let err = client
        .send_message(OutboundMessage::new(SignalType::Message))
        .await
        .unwrap_err();

    assert_eq!(err, SignallingError::NotConnected);
    assert_eq!(connector.attempts(), 0);
}

#[tokio::test]
async fn heartbeat_fires_on_the_configured_period() {
    init_tracing();
    let (connector, mut sessions) = MockConnector::new();
    let client = SignallingClient::spawn("c1", connector);

    let mut config = test_config();
    config.heartbeat_interval = 200;
    client.connect(config).await.unwrap();
    let mut session = next_session(&mut sessions).await;

    // 1 周期経過前には何も送られない
    assert_no_frame(&mut session).await;

    let frame = next_frame(&mut session).await;
    assert_eq!(frame["type"], "heartbeat");
    assert_eq!(frame["from"], "c1");
}

#[tokio::test]
async fn client_reconnects_after_peer_close() {
    init_tracing();
    let (connector, mut sessions) = MockConnector::new();
    let client = SignallingClient::spawn("c1", connector.clone());
    let log = record_events(&client);

    client.connect(test_config()).await.unwrap();
    let session = next_session(&mut sessions).await;

    session.close();
    let _replacement = next_session(&mut sessions).await;
    wait_for("reconnect to complete", || {
        client.connection_state() == ConnectionState::Connected && connector.attempts() == 2
    })
    .await;

    let states = state_changes(&log);
    assert!(
        states.contains(&ConnectionState::Reconnecting),
        "missing reconnecting transition: {states:?}"
    );
}

#[tokio::test]
async fn reconnect_gives_up_after_max_attempts() {
    init_tracing();
    let (connector, mut sessions) = MockConnector::new();
    let client = SignallingClient::spawn("c1", connector.clone());
    let log = record_events(&client);

    let mut config = test_config();
    config.max_reconnect_attempts = 3;
    config.reconnect_interval = 50;
    client.connect(config).await.unwrap();
    let session = next_session(&mut sessions).await;

    connector.push_n(ConnectBehavior::Fail("down".to_string()), 3);
    let started = Instant::now();
    session.close();

    wait_for("reconnects to be exhausted", || {
        client.connection_state() == ConnectionState::Error
    })
    .await;

    // 再接続 3 回分の待ち時間（50ms 間隔）を挟んでから諦めている
    let elapsed = started.elapsed();
    assert!(
        elapsed >= Duration::from_millis(150),
        "gave up too fast: {elapsed:?}"
    );
    assert!(
        elapsed < Duration::from_millis(1_500),
        "exhaustion took too long: {elapsed:?}"
    );

    // 初回接続 1 回 + 再接続 3 回
    assert_eq!(connector.attempts(), 4);
    let exhausted: Vec<_> = errors(&log)
        .into_iter()
        .filter(|e| matches!(e, SignallingError::ReconnectExhausted(_)))
        .collect();
    assert_eq!(exhausted, vec![SignallingError::ReconnectExhausted(3)]);
}

#[tokio::test]
async fn disconnect_cancels_pending_reconnect() {
    init_tracing();
    let (connector, mut sessions) = MockConnector::new();
    let client = SignallingClient::spawn("c1", connector.clone());

    let mut config = test_config();
    config.reconnect_interval = 500;
    client.connect(config).await.unwrap();
    let session = next_session(&mut sessions).await;

    session.close();
    wait_for("reconnect to be scheduled", || {
        client.connection_state() == ConnectionState::Reconnecting
    })
    .await;

    client.disconnect().await;
    sleep(Duration::from_millis(800)).await;

    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(connector.attempts(), 1);
    assert!(sessions.try_recv().is_err());
}

#[tokio::test]
async fn explicit_disconnect_does_not_trigger_reconnect() {
    init_tracing();
    let (connector, mut sessions) = MockConnector::new();
    let client = SignallingClient::spawn("c1", connector.clone());

    let mut config = test_config();
    config.reconnect_interval = 50;
    client.connect(config).await.unwrap();
    let _session = next_session(&mut sessions).await;

    client.disconnect().await;
    sleep(Duration::from_millis(300)).await;

    assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    assert_eq!(connector.attempts(), 1);
    assert!(sessions.try_recv().is_err());
}

#[tokio::test]
async fn join_and_leave_room_send_matching_frames() {
    init_tracing();
    let (connector, mut sessions) = MockConnector::new();
    let client = SignallingClient::spawn("c1", connector);
    client.connect(test_config()).await.unwrap();
    let mut session = next_session(&mut sessions).await;

    client.join_room("r1", user("c1")).await.unwrap();
    let frame = next_frame(&mut session).await;
    assert_eq!(frame["type"], "join-room");
    assert_eq!(frame["room"], "r1");
    assert_eq!(frame["data"]["userInfo"]["id"], "c1");

    // 追跡していないルームからの leave は何も送らない
    client.leave_room("r2").await.unwrap();
    assert_no_frame(&mut session).await;

    client.leave_room("r1").await.unwrap();
    let frame = next_frame(&mut session).await;
    assert_eq!(frame["type"], "leave-room");
    assert_eq!(frame["room"], "r1");

    // 離脱済みなので二度目は黙って無視される
    client.leave_room("r1").await.unwrap();
    assert_no_frame(&mut session).await;
}

#[tokio::test]
async fn joining_a_second_room_leaves_the_first() {
    init_tracing();
    let (connector, mut sessions) = MockConnector::new();
    let client = SignallingClient::spawn("c1", connector);
    client.connect(test_config()).await.unwrap();
    let mut session = next_session(&mut sessions).await;

    client.join_room("r1", user("c1")).await.unwrap();
    let _join = next_frame(&mut session).await;

    client.join_room("r2", user("c1")).await.unwrap();
    let leave = next_frame(&mut session).await;
    assert_eq!(leave["type"], "leave-room");
    assert_eq!(leave["room"], "r1");
    let join = next_frame(&mut session).await;
    assert_eq!(join["type"], "join-room");
    assert_eq!(join["room"], "r2");
}

#[tokio::test]
async fn inbound_messages_are_dispatched_by_type() {
    init_tracing();
    let (connector, mut sessions) = MockConnector::new();
    let client = SignallingClient::spawn("c1", connector);
    let log = record_events(&client);
    client.connect(test_config()).await.unwrap();
    let session = next_session(&mut sessions).await;

    session.inject_message(
        r#"{"id":"s-1","type":"room-users","timestamp":1,"data":{"users":["a","b"]}}"#,
    );
    wait_for("room-users dispatch", || {
        log.lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, SignallingEvent::RoomUsersUpdated(_)))
    })
    .await;

    session.inject_message(
        r#"{"id":"s-2","type":"join-room","timestamp":2,"data":{"userInfo":{"id":"u2","name":"peer","status":"online"}}}"#,
    );
    wait_for("join-room dispatch", || {
        log.lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, SignallingEvent::UserJoined(u) if u.id == "u2"))
    })
    .await;

    session.inject_message(r#"{"id":"s-3","type":"leave-room","timestamp":3,"from":"u2"}"#);
    wait_for("leave-room dispatch", || {
        log.lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, SignallingEvent::UserLeft(from) if from == "u2"))
    })
    .await;

    session.inject_message(
        r#"{"id":"s-4","type":"error","timestamp":4,"data":{"message":"room full"}}"#,
    );
    wait_for("server error dispatch", || {
        errors(&log).contains(&SignallingError::Server("room full".to_string()))
    })
    .await;

    let updated = log
        .lock()
        .unwrap()
        .iter()
        .find_map(|e| match e {
            SignallingEvent::RoomUsersUpdated(users) => Some(users.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(updated, vec![serde_json::json!("a"), serde_json::json!("b")]);

    // 生のメッセージは種別を問わず全て届いている
    let received = log
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, SignallingEvent::MessageReceived(_)))
        .count();
    assert_eq!(received, 4);
}

#[tokio::test]
async fn malformed_frames_report_parse_errors_without_killing_the_client() {
    init_tracing();
    let (connector, mut sessions) = MockConnector::new();
    let client = SignallingClient::spawn("c1", connector);
    let log = record_events(&client);
    client.connect(test_config()).await.unwrap();
    let session = next_session(&mut sessions).await;

    session.inject_message("not json at all");
    wait_for("parse error event", || {
        errors(&log)
            .iter()
            .any(|e| matches!(e, SignallingError::MessageParse(_)))
    })
    .await;

    // 壊れたフレームの後も通常のフレームは処理される
    session.inject_message(r#"{"id":"s-1","type":"heartbeat","timestamp":1}"#);
    wait_for("heartbeat after bad frame", || {
        log.lock()
            .unwrap()
            .iter()
            .any(|e| matches!(e, SignallingEvent::MessageReceived(m) if m.kind == SignalType::Heartbeat))
    })
    .await;
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn repeated_disconnects_emit_a_single_state_change() {
    init_tracing();
    let (connector, mut sessions) = MockConnector::new();
    let client = SignallingClient::spawn("c1", connector);
    let log = record_events(&client);

    client.connect(test_config()).await.unwrap();
    let _session = next_session(&mut sessions).await;
    client.disconnect().await;
    client.disconnect().await;

    assert_eq!(
        state_changes(&log),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected,
        ]
    );
}

#[tokio::test]
async fn listeners_may_unsubscribe_from_inside_a_callback() {
    init_tracing();
    let (connector, _sessions) = MockConnector::new();
    let client = SignallingClient::spawn("c1", connector);

    // コールバックの中から自分の購読を外す（once 相当の使い方）
    let log = Arc::new(Mutex::new(Vec::new()));
    let id_slot: Arc<Mutex<Option<ListenerId>>> = Arc::new(Mutex::new(None));
    let handle = client.clone();
    let sink = log.clone();
    let slot = id_slot.clone();
    let id = client.on(
        EventKind::ConnectionStateChanged,
        Box::new(move |event| {
            sink.lock().unwrap().push(event.clone());
            if let Some(id) = slot.lock().unwrap().take() {
                handle.off(EventKind::ConnectionStateChanged, id);
            }
        }),
    );
    *id_slot.lock().unwrap() = Some(id);

    timeout(Duration::from_secs(2), client.connect(test_config()))
        .await
        .expect("connect must not block on listener dispatch")
        .unwrap();

    // connecting の時点で解除済みなので connected は届かない
    assert_eq!(
        state_changes(&log),
        vec![ConnectionState::Connecting]
    );
}

#[tokio::test]
async fn client_debug_output_names_the_client() {
    init_tracing();
    let (connector, _sessions) = MockConnector::new();
    let client = SignallingClient::spawn("c1", connector);

    let text = format!("{client:?}");
    assert!(text.contains("c1"), "unexpected debug output: {text}");
    assert!(text.contains("Disconnected"), "unexpected debug output: {text}");
}

#[tokio::test]
async fn removed_listeners_no_longer_fire() {
    init_tracing();
    let (connector, _sessions) = MockConnector::new();
    let client = SignallingClient::spawn("c1", connector);

    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    let id = client.on(
        EventKind::ConnectionStateChanged,
        Box::new(move |event| sink.lock().unwrap().push(event.clone())),
    );
    client.off(EventKind::ConnectionStateChanged, id);

    client.connect(test_config()).await.unwrap();
    assert!(log.lock().unwrap().is_empty());
}

fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64
}
