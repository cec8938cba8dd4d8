use super::*;

use shared::domain::Direction;
use tokio::time::sleep;

use crate::test_support::{message_frame, next_status, CountingTokens, RecordingChannelSink, ScriptedConnector};

fn config() -> ChannelConfig {
    ChannelConfig::from(&SyncSettings::default())
}

fn spawn_session(
    connector: &Arc<ScriptedConnector>,
    sink: Arc<RecordingChannelSink>,
) -> ChannelSession {
    ChannelSession::spawn(
        connector.clone(),
        Arc::new(CountingTokens::default()),
        config(),
        sink,
    )
}

#[tokio::test(start_paused = true)]
async fn reconnects_with_fresh_token_and_dispatches_frames() {
    let connector = ScriptedConnector::new();
    connector.refuse_next();
    let conn = connector.accept_next();
    let (sink, mut rx) = RecordingChannelSink::new();
    let _session = spawn_session(&connector, sink);

    assert_eq!(next_status(&mut rx).await, ChannelStatus::Connecting);
    assert_eq!(
        next_status(&mut rx).await,
        ChannelStatus::Reconnecting { attempt: 1 }
    );
    assert_eq!(next_status(&mut rx).await, ChannelStatus::Connecting);
    assert_eq!(next_status(&mut rx).await, ChannelStatus::Open);
    assert_eq!(connector.tokens(), vec!["token-1", "token-2"]);

    conn.push_text(r#"{"type":"pong"}"#);
    conn.push_text(message_frame("m1", "acc", "peer", Direction::In, "hi", 1));

    match rx.recv().await {
        Some(ChannelEvent::Heartbeat(_)) => {}
        other => panic!("expected heartbeat, got {other:?}"),
    }
    match rx.recv().await {
        Some(ChannelEvent::Frame(frame)) => {
            let event = frame.message_event().expect("message event");
            assert_eq!(event.text.as_deref(), Some("hi"));
        }
        other => panic!("expected message frame, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn clean_close_returns_to_idle_without_reconnecting() {
    let connector = ScriptedConnector::new();
    let conn = connector.accept_next();
    let (sink, mut rx) = RecordingChannelSink::new();
    let session = spawn_session(&connector, sink);

    assert_eq!(next_status(&mut rx).await, ChannelStatus::Connecting);
    assert_eq!(next_status(&mut rx).await, ChannelStatus::Open);

    conn.push(InboundFrame::Close(Some(NORMAL_CLOSE)));
    assert_eq!(next_status(&mut rx).await, ChannelStatus::Idle);

    sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 1);
    assert!(!session.is_running());
}

#[tokio::test(start_paused = true)]
async fn abnormal_close_reconnects_and_open_resets_attempts() {
    let connector = ScriptedConnector::new();
    let first = connector.accept_next();
    let second = connector.accept_next();
    let (sink, mut rx) = RecordingChannelSink::new();
    let _session = spawn_session(&connector, sink);

    assert_eq!(next_status(&mut rx).await, ChannelStatus::Connecting);
    assert_eq!(next_status(&mut rx).await, ChannelStatus::Open);

    first.push(InboundFrame::Close(Some(1006)));
    assert_eq!(
        next_status(&mut rx).await,
        ChannelStatus::Reconnecting { attempt: 1 }
    );
    assert_eq!(next_status(&mut rx).await, ChannelStatus::Connecting);
    assert_eq!(next_status(&mut rx).await, ChannelStatus::Open);

    second.fail("connection reset by peer");
    assert_eq!(
        next_status(&mut rx).await,
        ChannelStatus::Reconnecting { attempt: 1 }
    );
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_max_reconnect_attempts() {
    let connector = ScriptedConnector::new();
    let (sink, mut rx) = RecordingChannelSink::new();
    let start = Instant::now();
    let _session = spawn_session(&connector, sink);

    let mut statuses = Vec::new();
    let mut errors = 0;
    loop {
        match rx.recv().await.expect("event") {
            ChannelEvent::Status(status) => {
                statuses.push(status);
                if status == ChannelStatus::Failed {
                    break;
                }
            }
            ChannelEvent::TransportError(_) => errors += 1,
            _ => {}
        }
    }

    let retries: Vec<_> = statuses
        .iter()
        .filter_map(|s| match s {
            ChannelStatus::Reconnecting { attempt } => Some(*attempt),
            _ => None,
        })
        .collect();
    assert_eq!(retries, vec![1, 2, 3, 4, 5]);
    assert_eq!(connector.attempts(), 6);
    assert_eq!(errors, 6);
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(15) && elapsed < Duration::from_secs(16), "{elapsed:?}");

    sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts(), 6);
}

#[tokio::test(start_paused = true)]
async fn sends_heartbeats_and_drops_silent_connection() {
    let connector = ScriptedConnector::new();
    let conn = connector.accept_next();
    let (sink, mut rx) = RecordingChannelSink::new();
    let _session = spawn_session(&connector, sink);

    assert_eq!(next_status(&mut rx).await, ChannelStatus::Connecting);
    assert_eq!(next_status(&mut rx).await, ChannelStatus::Open);
    let opened_at = Instant::now();

    sleep(Duration::from_secs(26)).await;
    assert_eq!(conn.sent(), vec![r#"{"type":"ping"}"#]);

    assert_eq!(
        next_status(&mut rx).await,
        ChannelStatus::Reconnecting { attempt: 1 }
    );
    assert_eq!(opened_at.elapsed(), Duration::from_secs(35));
    assert!(conn.is_dropped());
}

#[tokio::test(start_paused = true)]
async fn pongs_keep_the_connection_alive() {
    let connector = ScriptedConnector::new();
    let conn = connector.accept_next();
    let (sink, mut rx) = RecordingChannelSink::new();
    let _session = spawn_session(&connector, sink);

    assert_eq!(next_status(&mut rx).await, ChannelStatus::Connecting);
    assert_eq!(next_status(&mut rx).await, ChannelStatus::Open);

    for _ in 0..4 {
        sleep(Duration::from_secs(20)).await;
        conn.push_text(r#"{"type":"pong"}"#);
    }
    sleep(Duration::from_secs(1)).await;

    let mut heartbeats = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            ChannelEvent::Heartbeat(_) => heartbeats += 1,
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert_eq!(heartbeats, 4);
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn malformed_and_unknown_frames_are_skipped() {
    let connector = ScriptedConnector::new();
    let conn = connector.accept_next();
    let (sink, mut rx) = RecordingChannelSink::new();
    let _session = spawn_session(&connector, sink);

    assert_eq!(next_status(&mut rx).await, ChannelStatus::Connecting);
    assert_eq!(next_status(&mut rx).await, ChannelStatus::Open);

    conn.push_text("definitely not json");
    conn.push(InboundFrame::Binary(vec![0xff, 0xfe, 0x00]));
    conn.push_text(r#"{"type":"typing","payload":{"peer":"p"}}"#);
    conn.push(InboundFrame::Binary(
        br#"{"type":"notification","payload":{"message":"quota low"}}"#.to_vec(),
    ));

    match rx.recv().await {
        Some(ChannelEvent::Frame(PushFrame::Notification(note))) => {
            assert_eq!(note.message, "quota low");
        }
        other => panic!("expected notification, got {other:?}"),
    }
    assert_eq!(connector.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn shutdown_is_idempotent_and_releases_the_connection() {
    let connector = ScriptedConnector::new();
    let conn = connector.accept_next();
    let (sink, mut rx) = RecordingChannelSink::new();
    let mut session = spawn_session(&connector, sink);

    assert_eq!(next_status(&mut rx).await, ChannelStatus::Connecting);
    assert_eq!(next_status(&mut rx).await, ChannelStatus::Open);

    session.shutdown();
    session.shutdown();
    sleep(Duration::from_millis(10)).await;

    assert!(!session.is_running());
    assert!(conn.is_dropped());

    sleep(Duration::from_secs(120)).await;
    assert_eq!(connector.attempts(), 1);
    assert!(conn.sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn dropping_the_session_cancels_pending_reconnects() {
    let connector = ScriptedConnector::new();
    let (sink, mut rx) = RecordingChannelSink::new();
    let session = spawn_session(&connector, sink);

    assert_eq!(next_status(&mut rx).await, ChannelStatus::Connecting);
    assert_eq!(
        next_status(&mut rx).await,
        ChannelStatus::Reconnecting { attempt: 1 }
    );
    drop(session);

    sleep(Duration::from_secs(60)).await;
    assert_eq!(connector.attempts(), 1);
}
