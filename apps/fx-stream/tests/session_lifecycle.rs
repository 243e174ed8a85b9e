//! Session Lifecycle Integration Tests
//!
//! Drives the supervisor against a scripted transport: normalization and
//! delivery, staleness and subscription timeouts, reconnection with
//! resubscription, peers that never finish a close, rejected credentials
//! and giving up after the attempt limit.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::{Instant, timeout};

use fx_stream::application::ports::TransportConnector;
use fx_stream::application::services::HeartbeatConfig;
use fx_stream::{ConnectionState, RejectReason, StreamSupervisor, Tick, TickSink, TransitionReason};
use support::{
    ScriptedConnector, WAIT, ack, eventually, fast_config, next_session, quote, replay_adapter,
    subscribe_request, wait_for_no_open_sessions, wait_for_state,
};

/// Counts ticks and reports the count when the stream closes.
struct CountingSink {
    seen: usize,
    closed: std::sync::mpsc::Sender<usize>,
}

impl TickSink for CountingSink {
    fn on_tick(&mut self, _tick: Tick) {
        self.seen += 1;
    }

    fn on_close(&mut self) {
        let _ = self.closed.send(self.seen);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ticks_survive_staleness_reconnect_in_order() {
    let (connector, mut sessions) = ScriptedConnector::new();
    let supervisor = StreamSupervisor::new(
        fast_config(&["USD/JPY"]),
        replay_adapter(),
        Arc::clone(&connector) as Arc<dyn TransportConnector>,
    )
    .unwrap();
    let buffer = supervisor.tick_buffer();
    supervisor.start().unwrap();

    // First session: subscribe, acknowledge, stream.
    let mut first = next_session(&mut sessions).await;
    assert_eq!(first.next_sent().await, subscribe_request(&["USD/JPY"]));
    first.send_json(&ack(&["USD/JPY"]));
    wait_for_state(&supervisor, ConnectionState::Live).await;

    let base = Utc::now() - chrono::Duration::seconds(2);
    let mut last_payload = None;
    for i in 0..5 {
        let payload = quote(
            "USD/JPY",
            &format!("150.1{i}"),
            &format!("150.2{i}"),
            base + chrono::Duration::milliseconds(100 * i),
        );
        first.send_json(&payload);
        last_payload = Some(payload);
    }
    first.send_text("{not json");
    first.send_json(&quote("USD/JPY", "abc", "150.30", base));
    first.send_json(&quote("EUR/GBP", "0.8500", "0.8502", base));

    let mut first_session = None;
    for expected in 1..=5 {
        let tick = timeout(WAIT, buffer.recv()).await.unwrap().unwrap();
        assert_eq!(tick.pair().to_string(), "USD/JPY");
        assert_eq!(tick.sequence(), expected);
        assert!(!tick.timestamp_anomaly());
        first_session = Some(tick.session());
    }

    // Silence until staleness ends the session; the client reconnects.
    let mut second = next_session(&mut sessions).await;
    assert_eq!(second.next_sent().await, subscribe_request(&["USD/JPY"]));
    assert!(first.pings() > 0);
    second.send_json(&ack(&["USD/JPY"]));
    wait_for_state(&supervisor, ConnectionState::Live).await;

    // Replay of the last accepted quote, then a fresh one.
    second.send_json(&last_payload.unwrap());
    second.send_json(&quote("USD/JPY", "150.50", "150.60", Utc::now()));

    let tick = timeout(WAIT, buffer.recv()).await.unwrap().unwrap();
    assert_eq!(tick.sequence(), 6);
    assert!(tick.session() > first_session.unwrap());
    assert!(buffer.is_empty());

    let health = supervisor.health();
    assert!(health.saw_transition(
        ConnectionState::Live,
        ConnectionState::Backoff,
        TransitionReason::StalenessTimeout
    ));
    assert!(health.saw_transition(
        ConnectionState::Backoff,
        ConnectionState::Connecting,
        TransitionReason::BackoffElapsed
    ));
    assert_eq!(health.connection.rejections.get(RejectReason::MalformedPayload), 1);
    assert_eq!(health.connection.rejections.get(RejectReason::UnknownPair), 1);
    assert_eq!(health.connection.rejections.get(RejectReason::StalePrice), 1);
    assert_eq!(connector.max_open(), 1);

    supervisor.stop().await;
    assert_eq!(supervisor.monitor().state(), ConnectionState::Disconnected);
    assert_eq!(connector.open(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unacknowledged_subscription_times_out_and_first_tick_goes_live() {
    let (connector, mut sessions) = ScriptedConnector::new();
    let supervisor = StreamSupervisor::new(
        fast_config(&["EUR/USD"]),
        replay_adapter(),
        Arc::clone(&connector) as Arc<dyn TransportConnector>,
    )
    .unwrap();
    let buffer = supervisor.tick_buffer();
    supervisor.start().unwrap();

    let mut first = next_session(&mut sessions).await;
    assert_eq!(first.next_sent().await, subscribe_request(&["EUR/USD"]));

    // No acknowledgment: the subscription timer ends the session.
    let mut second = next_session(&mut sessions).await;
    assert_eq!(second.next_sent().await, subscribe_request(&["EUR/USD"]));
    assert!(supervisor.health().saw_transition(
        ConnectionState::Subscribing,
        ConnectionState::Backoff,
        TransitionReason::SubscriptionTimeout
    ));

    // A valid tick counts as confirmation.
    second.send_json(&quote("EUR/USD", "1.0850", "1.0852", Utc::now()));
    let tick = timeout(WAIT, buffer.recv()).await.unwrap().unwrap();
    assert_eq!(tick.sequence(), 1);
    wait_for_state(&supervisor, ConnectionState::Live).await;
    assert!(supervisor.health().saw_transition(
        ConnectionState::Subscribing,
        ConnectionState::Live,
        TransitionReason::FirstTick
    ));
    assert_eq!(connector.max_open(), 1);

    supervisor.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn provider_close_triggers_reconnect() {
    let (connector, mut sessions) = ScriptedConnector::new();
    let supervisor = StreamSupervisor::new(
        fast_config(&["GBP/USD"]),
        replay_adapter(),
        Arc::clone(&connector) as Arc<dyn TransportConnector>,
    )
    .unwrap();
    supervisor.start().unwrap();

    let mut first = next_session(&mut sessions).await;
    first.next_sent().await;
    first.send_json(&ack(&["GBP/USD"]));
    wait_for_state(&supervisor, ConnectionState::Live).await;
    first.close();

    let mut second = next_session(&mut sessions).await;
    assert_eq!(second.next_sent().await, subscribe_request(&["GBP/USD"]));
    assert!(supervisor.health().saw_transition(
        ConnectionState::Live,
        ConnectionState::Backoff,
        TransitionReason::TransportClosed
    ));
    assert_eq!(connector.connects(), 2);
    assert_eq!(connector.max_open(), 1);

    supervisor.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gives_up_after_max_attempts() {
    let (connector, _sessions) = ScriptedConnector::new();
    connector.refuse_all();

    let mut config = fast_config(&["EUR/USD"]);
    config.session.reconnect.max_attempts = 2;
    let supervisor =
        StreamSupervisor::new(config, replay_adapter(), Arc::clone(&connector) as Arc<dyn TransportConnector>).unwrap();
    supervisor.start().unwrap();

    let health = eventually(&supervisor, "retries exhausted", |h| {
        h.saw_transition(
            ConnectionState::Backoff,
            ConnectionState::Disconnected,
            TransitionReason::RetriesExhausted,
        )
    })
    .await;

    assert_eq!(connector.connects(), 3);
    assert_eq!(health.connection.state, ConnectionState::Disconnected);
    assert!(
        health
            .connection
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains('2'))
    );

    supervisor.stop().await;
    assert!(!supervisor.is_running());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_during_backoff_is_prompt() {
    let (connector, _sessions) = ScriptedConnector::new();
    connector.refuse_all();

    let mut config = fast_config(&["EUR/USD"]);
    config.session.reconnect.initial_delay = Duration::from_secs(30);
    config.session.reconnect.max_delay = Duration::from_secs(30);
    let supervisor =
        StreamSupervisor::new(config, replay_adapter(), Arc::clone(&connector) as Arc<dyn TransportConnector>).unwrap();
    supervisor.start().unwrap();

    eventually(&supervisor, "backoff", |h| {
        h.connection.state == ConnectionState::Backoff
    })
    .await;

    timeout(Duration::from_secs(1), supervisor.stop())
        .await
        .expect("stop waited for the backoff delay");
    assert!(supervisor.health().saw_transition(
        ConnectionState::Backoff,
        ConnectionState::Disconnected,
        TransitionReason::Shutdown
    ));
    assert_eq!(connector.connects(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unanswered_close_does_not_hold_a_dead_session_live() {
    let (connector, mut sessions) = ScriptedConnector::new();
    connector.hang_on_close();
    let supervisor = StreamSupervisor::new(
        fast_config(&["EUR/USD"]),
        replay_adapter(),
        Arc::clone(&connector) as Arc<dyn TransportConnector>,
    )
    .unwrap();
    supervisor.start().unwrap();

    let mut first = next_session(&mut sessions).await;
    first.next_sent().await;
    first.send_json(&ack(&["EUR/USD"]));
    wait_for_state(&supervisor, ConnectionState::Live).await;

    // The peer goes silent and never answers the close.
    eventually(&supervisor, "staleness backoff", |h| {
        h.saw_transition(
            ConnectionState::Live,
            ConnectionState::Backoff,
            TransitionReason::StalenessTimeout,
        )
    })
    .await;

    let mut second = next_session(&mut sessions).await;
    assert_eq!(second.next_sent().await, subscribe_request(&["EUR/USD"]));
    assert_eq!(connector.connects(), 2);
    assert_eq!(connector.max_open(), 1);
    second.send_json(&ack(&["EUR/USD"]));
    wait_for_state(&supervisor, ConnectionState::Live).await;

    supervisor.stop().await;
    assert_eq!(supervisor.monitor().state(), ConnectionState::Disconnected);
    wait_for_no_open_sessions(&connector).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_is_bounded_when_close_never_finishes() {
    let (connector, mut sessions) = ScriptedConnector::new();
    connector.hang_on_close();

    let mut config = fast_config(&["EUR/USD"]);
    config.session.heartbeat =
        HeartbeatConfig::new(Duration::from_millis(100), Duration::from_secs(30));
    config.session.close_timeout = Duration::from_secs(30);
    config.shutdown_timeout = Duration::from_millis(300);
    let supervisor =
        StreamSupervisor::new(config, replay_adapter(), Arc::clone(&connector) as Arc<dyn TransportConnector>).unwrap();

    let (closed_tx, closed_rx) = std::sync::mpsc::channel();
    supervisor.subscribe(CountingSink {
        seen: 0,
        closed: closed_tx,
    });
    supervisor.start().unwrap();

    let mut session = next_session(&mut sessions).await;
    session.next_sent().await;
    session.send_json(&ack(&["EUR/USD"]));
    wait_for_state(&supervisor, ConnectionState::Live).await;
    session.send_json(&quote("EUR/USD", "1.0850", "1.0852", Utc::now()));
    eventually(&supervisor, "one accepted tick", |h| {
        h.connection.ticks_accepted == 1
    })
    .await;

    let started = Instant::now();
    timeout(WAIT, supervisor.stop())
        .await
        .expect("stop waited on the transport close");
    assert!(started.elapsed() < Duration::from_secs(2));

    let health = supervisor.health();
    assert!(!health.running);
    assert_eq!(health.connection.state, ConnectionState::Disconnected);
    assert!(health.saw_transition(
        ConnectionState::Live,
        ConnectionState::Disconnected,
        TransitionReason::Shutdown
    ));
    assert_eq!(closed_rx.recv_timeout(Duration::from_secs(1)), Ok(1));
    wait_for_no_open_sessions(&connector).await;

    // The aborted task took the normalizer with it: sequences restart and
    // the restart is visible in the health readout.
    supervisor.start().unwrap();
    let buffer = supervisor.tick_buffer();
    let mut next = next_session(&mut sessions).await;
    next.next_sent().await;
    next.send_json(&quote("EUR/USD", "1.0853", "1.0855", Utc::now()));

    let tick = timeout(WAIT, buffer.recv()).await.unwrap().unwrap();
    assert_eq!(tick.sequence(), 1);
    assert_eq!(supervisor.health().connection.sequence_resets, 1);

    supervisor.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejected_credentials_end_without_reconnect() {
    let (connector, mut sessions) = ScriptedConnector::new();
    let supervisor = StreamSupervisor::new(
        fast_config(&["EUR/USD"]),
        replay_adapter(),
        Arc::clone(&connector) as Arc<dyn TransportConnector>,
    )
    .unwrap();
    supervisor.start().unwrap();

    let mut session = next_session(&mut sessions).await;
    session.next_sent().await;
    session.send_json(&json!({"type": "auth_failed", "message": "invalid api key"}));

    let health = eventually(&supervisor, "authentication failure", |h| {
        h.saw_transition(
            ConnectionState::Subscribing,
            ConnectionState::Disconnected,
            TransitionReason::AuthenticationFailed,
        )
    })
    .await;
    assert!(
        health
            .connection
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("invalid api key"))
    );

    // Well past the backoff delay and the subscription timeout.
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(connector.connects(), 1);
    assert_eq!(supervisor.monitor().state(), ConnectionState::Disconnected);
    assert_eq!(connector.open(), 0);

    supervisor.stop().await;
}
