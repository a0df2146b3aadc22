use super::harness::{
    ack_notification, message_notification, next_event, SessionHarness,
};
use crate::error::SessionError;
use crate::session::{
    SessionEvent, CLOSE_CODE_IDLE_TIMEOUT, CLOSE_CODE_SESSION_EXPIRED,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use sync_core::{
    ChannelId, ConnectionState, LocalId, MemoryStateStore, NotificationKind, OperationKind,
    StateStore,
};
use tokio::sync::broadcast;
use tokio::time::Instant;

fn channel(n: u32) -> ChannelId {
    ChannelId::from_string(format!("discuss.channel/{n}"))
}

/// Awaits the next decoded notification event, skipping state changes.
async fn next_notification(
    events: &mut broadcast::Receiver<SessionEvent>,
) -> (ChannelId, NotificationKind) {
    loop {
        if let SessionEvent::Notification { channel, kind } = next_event(events).await {
            return (channel, kind);
        }
    }
}

/// Awaits a specific connection state, skipping everything else.
async fn wait_for_state(events: &mut broadcast::Receiver<SessionEvent>, want: ConnectionState) {
    loop {
        if let SessionEvent::StateChanged(state) = next_event(events).await {
            if state == want {
                return;
            }
        }
    }
}

// ============================================================
// Connect and subscribe
// ============================================================

#[tokio::test(start_paused = true)]
async fn connect_sends_full_subscription_set_with_persisted_cursor() {
    let store = Arc::new(MemoryStateStore::new());
    store.save_cursor(42).unwrap();
    let mut harness = SessionHarness::with_store(store);
    harness.session.subscribe(&channel(2));
    harness.session.subscribe(&channel(1));
    // Subscribing twice to the same channel only adds a consumer.
    harness.session.subscribe(&channel(1));

    let mut conn = harness.start().await;
    let frame = conn.sent_frame().await;

    assert_eq!(frame["type"], "subscribe");
    assert_eq!(
        frame["channels"],
        json!(["discuss.channel/1", "discuss.channel/2"])
    );
    assert_eq!(frame["last"], 42);
}

#[tokio::test(start_paused = true)]
async fn subscribing_while_connected_resends_the_full_set() {
    let mut harness = SessionHarness::new();
    harness.session.subscribe(&channel(1));
    let mut conn = harness.start().await;
    let _ = conn.sent_frame().await;

    harness.session.subscribe(&channel(2));
    let frame = conn.sent_frame().await;
    assert_eq!(
        frame["channels"],
        json!(["discuss.channel/1", "discuss.channel/2"])
    );

    // Dropping the last consumer removes the channel from the wire set.
    assert!(harness.session.unsubscribe(&channel(2)));
    let frame = conn.sent_frame().await;
    assert_eq!(frame["channels"], json!(["discuss.channel/1"]));
}

#[tokio::test(start_paused = true)]
async fn subscription_bursts_coalesce_and_end_on_the_full_set() {
    let mut harness = SessionHarness::new();
    harness.session.subscribe(&channel(1));
    let mut conn = harness.start().await;
    let _ = conn.sent_frame().await;

    for n in 2..=20 {
        harness.session.subscribe(&channel(n));
    }

    let mut names: Vec<String> = (1..=20).map(|n| format!("discuss.channel/{n}")).collect();
    names.sort();
    // However many frames the burst produced, the last one carries the
    // complete desired set.
    loop {
        let frame = conn.sent_frame().await;
        assert_eq!(frame["type"], "subscribe");
        if frame["channels"] == json!(names) {
            break;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn notifications_are_decoded_and_emitted_in_order() {
    let mut harness = SessionHarness::new();
    let ch = channel(5);
    harness.session.subscribe(&ch);
    let mut events = harness.session.events();
    let mut conn = harness.start().await;
    let _ = conn.sent_frame().await;

    conn.push_notifications(vec![
        message_notification(10, &ch, "first"),
        message_notification(11, &ch, "second"),
    ]);

    for expected in ["first", "second"] {
        let (got_channel, kind) = next_notification(&mut events).await;
        assert_eq!(got_channel, ch);
        match kind {
            NotificationKind::Message(m) => assert_eq!(m.body, expected),
            other => panic!("unexpected kind: {other:?}"),
        }
    }
    assert_eq!(harness.session.cursor(), 11);
    assert_eq!(harness.store.load_cursor().unwrap(), Some(11));
}

// ============================================================
// Reconnect behavior
// ============================================================

#[tokio::test(start_paused = true)]
async fn reconnect_resends_subscriptions_and_resumes_from_cursor() {
    let mut harness = SessionHarness::new();
    let ch = channel(9);
    harness.session.subscribe(&ch);
    let mut events = harness.session.events();
    let mut conn = harness.start().await;
    let _ = conn.sent_frame().await;

    conn.push_notifications(vec![message_notification(7, &ch, "before drop")]);
    let _ = next_notification(&mut events).await;

    conn.close(Some(1006), "abnormal");

    let mut conn = harness.next_connection().await;
    let frame = conn.sent_frame().await;
    assert_eq!(frame["type"], "subscribe");
    assert_eq!(frame["channels"], json!(["discuss.channel/9"]));
    assert_eq!(frame["last"], 7);

    // The server replays from the cursor; a duplicate of id 7 is dropped.
    conn.push_notifications(vec![
        message_notification(7, &ch, "before drop"),
        message_notification(8, &ch, "after reconnect"),
    ]);
    let (_, kind) = next_notification(&mut events).await;
    match kind {
        NotificationKind::Message(m) => assert_eq!(m.body, "after reconnect"),
        other => panic!("unexpected kind: {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn abnormal_close_waits_for_backoff_before_reconnecting() {
    let mut harness = SessionHarness::new();
    let mut conn = harness.start().await;
    let _ = conn.sent_frame().await;

    let before = Instant::now();
    conn.sever();
    let _ = harness.next_connection().await;
    assert!(before.elapsed() >= Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn idle_timeout_close_reconnects_without_backoff() {
    let mut harness = SessionHarness::new();
    let mut conn = harness.start().await;
    let _ = conn.sent_frame().await;

    let before = Instant::now();
    conn.close(Some(CLOSE_CODE_IDLE_TIMEOUT), "idle");
    let _ = harness.next_connection().await;
    assert!(before.elapsed() < Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn failed_connect_attempts_back_off_and_eventually_succeed() {
    let mut harness = SessionHarness::new();
    harness.transport.fail_next_connects(2);

    let before = Instant::now();
    let _ = harness.start().await;

    assert_eq!(harness.transport.connect_count(), 3);
    // 100ms then 150ms, plus jitter.
    assert!(before.elapsed() >= Duration::from_millis(250));
}

#[tokio::test(start_paused = true)]
async fn successful_connection_resets_the_backoff() {
    let mut harness = SessionHarness::new();
    harness.transport.fail_next_connects(2);
    let mut conn = harness.start().await;
    let _ = conn.sent_frame().await;

    // After a healthy connection the next retry starts from the floor
    // again rather than continuing where the previous streak left off.
    let before = Instant::now();
    conn.sever();
    let _ = harness.next_connection().await;
    let elapsed = before.elapsed();
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(150));
}

// ============================================================
// Credential refresh
// ============================================================

#[tokio::test(start_paused = true)]
async fn session_expired_close_refreshes_credentials_before_reconnecting() {
    let mut harness = SessionHarness::new();
    let conn = harness.start().await;

    conn.close(Some(CLOSE_CODE_SESSION_EXPIRED), "session expired");
    let _ = harness.next_connection().await;
    assert_eq!(harness.auth.refresh_calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_parks_the_session_until_credentials_update() {
    let mut harness = SessionHarness::new();
    harness.auth.set_refresh_ok(false);
    let mut events = harness.session.events();
    let conn = harness.start().await;

    conn.close(Some(CLOSE_CODE_SESSION_EXPIRED), "session expired");

    loop {
        if let SessionEvent::AuthRequired { reason } = next_event(&mut events).await {
            assert!(reason.contains("refresh token expired"));
            break;
        }
    }
    // No reconnect attempts while parked.
    harness.expect_no_connection(Duration::from_secs(120)).await;

    harness.auth.set_refresh_ok(true);
    harness.session.notify_credentials_updated();
    let _ = harness.next_connection().await;
}

// ============================================================
// Operation delivery
// ============================================================

#[tokio::test(start_paused = true)]
async fn deliver_operation_resolves_when_the_ack_arrives() {
    let mut harness = SessionHarness::new();
    let ch = channel(3);
    harness.session.subscribe(&ch);
    let mut conn = harness.start().await;
    let _ = conn.sent_frame().await;

    let local_id = LocalId::new();
    let session = harness.session.clone();
    let ch_for_send = ch.clone();
    let delivery = tokio::spawn(async move {
        session
            .deliver_operation(
                OperationKind::SendMessage,
                local_id,
                ch_for_send,
                json!({ "body": "hello" }),
            )
            .await
    });

    let frame = conn.sent_frame().await;
    assert_eq!(frame["type"], "operation");
    assert_eq!(frame["kind"], "send_message");
    assert_eq!(frame["local_id"], json!(local_id));
    assert_eq!(frame["payload"]["body"], "hello");

    conn.push_notifications(vec![ack_notification(1, &ch, local_id, 777)]);
    assert_eq!(delivery.await.unwrap().unwrap(), 777);
}

#[tokio::test(start_paused = true)]
async fn deliver_operation_times_out_without_an_ack() {
    let mut harness = SessionHarness::new();
    let ch = channel(3);
    let mut conn = harness.start().await;
    let _ = conn.sent_frame().await;

    let result = harness
        .session
        .deliver_operation(
            OperationKind::SendMessage,
            LocalId::new(),
            ch,
            json!({ "body": "lost" }),
        )
        .await;
    assert!(matches!(result, Err(SessionError::Timeout)));
}

#[tokio::test(start_paused = true)]
async fn deliver_operation_fails_fast_when_disconnected() {
    let harness = SessionHarness::new();

    let result = harness
        .session
        .deliver_operation(
            OperationKind::SendMessage,
            LocalId::new(),
            channel(1),
            json!({ "body": "offline" }),
        )
        .await;
    assert!(matches!(result, Err(SessionError::NotConnected)));
}

// ============================================================
// Lifecycle
// ============================================================

#[tokio::test(start_paused = true)]
async fn state_transitions_are_emitted() {
    let mut harness = SessionHarness::new();
    let mut events = harness.session.events();
    let mut conn = harness.start().await;

    wait_for_state(&mut events, ConnectionState::Connected).await;

    conn.sever();
    wait_for_state(&mut events, ConnectionState::Disconnected).await;
    wait_for_state(&mut events, ConnectionState::Reconnecting).await;

    let _ = harness.next_connection().await;
    wait_for_state(&mut events, ConnectionState::Connected).await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_an_in_flight_connect_attempt() {
    let mut harness = SessionHarness::new();
    harness.transport.set_connect_delay(Duration::from_millis(500));
    let mut events = harness.session.events();
    harness.session.start();

    // Shut down while the dial is still pending.
    tokio::time::sleep(Duration::from_millis(100)).await;
    harness.session.shutdown();

    loop {
        match next_event(&mut events).await {
            SessionEvent::StateChanged(ConnectionState::Connected) => {
                panic!("session connected after shutdown")
            }
            SessionEvent::StateChanged(ConnectionState::Idle) => break,
            _ => {}
        }
    }
    harness.expect_no_connection(Duration::from_secs(120)).await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_is_terminal() {
    let mut harness = SessionHarness::new();
    let mut events = harness.session.events();
    let _conn = harness.start().await;
    wait_for_state(&mut events, ConnectionState::Connected).await;

    harness.session.shutdown();
    wait_for_state(&mut events, ConnectionState::Idle).await;
    harness.expect_no_connection(Duration::from_secs(120)).await;
}

#[tokio::test(start_paused = true)]
async fn malformed_frames_are_dropped_without_killing_the_session() {
    let mut harness = SessionHarness::new();
    let ch = channel(1);
    harness.session.subscribe(&ch);
    let mut events = harness.session.events();
    let mut conn = harness.start().await;
    let _ = conn.sent_frame().await;

    conn.push_raw("not json at all");
    conn.push_notifications(vec![message_notification(4, &ch, "still alive")]);

    let (_, kind) = next_notification(&mut events).await;
    match kind {
        NotificationKind::Message(m) => assert_eq!(m.body, "still alive"),
        other => panic!("unexpected kind: {other:?}"),
    }
}
