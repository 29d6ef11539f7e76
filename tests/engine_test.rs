mod common;

use std::time::Duration;

use common::{commits, event, eventually, typed_event, ScriptedStore};
use spitefeed::config::EngineConfig;
use spitefeed::{
    DropReason, EngineMessage, Error, EventId, Position, RecordedEvent, StopCause, StoreMessage,
    SubscriptionEngine, SubscriptionFailure, SubscriptionState,
};
use tokio::sync::mpsc;

async fn next(rx: &mut mpsc::Receiver<EngineMessage>) -> EngineMessage {
    tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("engine output within timeout")
        .expect("engine output open")
}

async fn next_event(rx: &mut mpsc::Receiver<EngineMessage>) -> RecordedEvent {
    match next(rx).await {
        EngineMessage::Event(event) => event,
        other => panic!("expected event, got {:?}", other),
    }
}

async fn assert_quiet(rx: &mut mpsc::Receiver<EngineMessage>) {
    let received = tokio::time::timeout(Duration::from_millis(50), rx.recv()).await;
    assert!(received.is_err(), "unexpected engine output: {:?}", received);
}

fn dropped(reason: DropReason, error: Option<&str>) -> StoreMessage {
    StoreMessage::Dropped {
        reason,
        error: error.map(str::to_string),
    }
}

// =============================================================================
// Delivery
// =============================================================================

#[tokio::test]
async fn events_are_forwarded_in_store_order() {
    let store = ScriptedStore::with_tail(Position::new(42, 42));
    let (mut engine, mut rx) = SubscriptionEngine::new(store.clone(), EngineConfig::default());
    engine.start(None, 10).unwrap();

    for n in 1..=3 {
        store.push(0, StoreMessage::Event(event("order-1", n))).await;
    }

    let mut received = Vec::new();
    for _ in 0..3 {
        received.push(next_event(&mut rx).await);
    }
    assert_eq!(commits(&received), vec![1, 2, 3]);
    assert_eq!(engine.checkpoint(), Some(Position::new(3, 3)));
    assert_eq!(engine.live_boundary(), Some(Position::new(42, 42)));
    assert_eq!(engine.state(), SubscriptionState::CatchingUp);
    assert_eq!(engine.stats().events_accepted, 3);

    engine.stop().await;
}

#[tokio::test]
async fn subscribe_uses_batch_size_for_catch_up_reads() {
    let store = ScriptedStore::new();
    let config = EngineConfig {
        max_live_queue_size: 500,
        ..EngineConfig::default()
    };
    let (mut engine, _rx) = SubscriptionEngine::new(store.clone(), config);
    engine.start(Some(Position::new(9, 9)), 25).unwrap();
    store.sink(0).await;

    let settings = store.settings(0);
    assert_eq!(settings.read_batch_size, 25);
    assert_eq!(settings.max_live_queue_size, 500);
    assert!(settings.resolve_link_tos);
    assert_eq!(store.subscribed_from(), vec![Some(Position::new(9, 9))]);
    assert_eq!(engine.checkpoint(), Some(Position::new(9, 9)));
    // A checkpoint was supplied, so the tail is never read.
    assert_eq!(engine.live_boundary(), None);

    engine.stop().await;
}

#[tokio::test]
async fn unreadable_tail_does_not_prevent_subscribing() {
    let store = ScriptedStore::new();
    let (mut engine, mut rx) = SubscriptionEngine::new(store.clone(), EngineConfig::default());
    engine.start(None, 10).unwrap();

    store.push(0, StoreMessage::Event(event("order-1", 1))).await;
    assert_eq!(next_event(&mut rx).await.position, Position::new(1, 1));
    assert_eq!(engine.live_boundary(), None);

    engine.stop().await;
}

#[tokio::test]
async fn redelivered_event_is_skipped() {
    let store = ScriptedStore::new();
    let (mut engine, mut rx) = SubscriptionEngine::new(store.clone(), EngineConfig::default());
    engine.start(None, 10).unwrap();

    let first = event("order-1", 1);
    let again = first.clone();
    store.push(0, StoreMessage::Event(first)).await;
    store.push(0, StoreMessage::Event(again)).await;
    store.push(0, StoreMessage::Event(event("order-1", 2))).await;

    assert_eq!(next_event(&mut rx).await.position, Position::new(1, 1));
    assert_eq!(next_event(&mut rx).await.position, Position::new(2, 2));
    assert_quiet(&mut rx).await;
    assert_eq!(engine.stats().duplicates_skipped, 1);

    engine.stop().await;
}

#[tokio::test]
async fn duplicate_outside_the_window_is_delivered_again() {
    let store = ScriptedStore::new();
    let config = EngineConfig {
        dedup_margin: 0,
        ..EngineConfig::default()
    };
    let (mut engine, mut rx) = SubscriptionEngine::new(store.clone(), config);
    // Capacity = batch_size + margin = 1.
    engine.start(None, 1).unwrap();

    let id = EventId::new();
    store.push(0, StoreMessage::Event(event("s", 1).with_id(id))).await;
    store.push(0, StoreMessage::Event(event("s", 2))).await;
    store.push(0, StoreMessage::Event(event("s", 3).with_id(id))).await;

    let received = vec![
        next_event(&mut rx).await,
        next_event(&mut rx).await,
        next_event(&mut rx).await,
    ];
    assert_eq!(commits(&received), vec![1, 2, 3]);
    assert_eq!(received[0].event_id, received[2].event_id);
    assert_eq!(engine.stats().duplicates_skipped, 0);

    engine.stop().await;
}

#[tokio::test]
async fn internal_events_are_never_forwarded() {
    let store = ScriptedStore::new();
    let (mut engine, mut rx) = SubscriptionEngine::new(store.clone(), EngineConfig::default());
    engine.start(None, 10).unwrap();

    store.push(0, StoreMessage::Event(typed_event("$stats-127.0.0.1:2113", "$statsCollected", 1))).await;
    store.push(0, StoreMessage::Event(typed_event("order-1", "$streamDeleted", 2))).await;
    store.push(0, StoreMessage::Event(typed_event("order-2", "Placed", 3))).await;

    let delivered = next_event(&mut rx).await;
    assert_eq!(delivered.position, Position::new(3, 3));
    assert_quiet(&mut rx).await;

    let stats = engine.stats();
    assert_eq!(stats.internal_skipped, 2);
    assert_eq!(stats.events_accepted, 1);
    // Internal events do not move the checkpoint.
    assert_eq!(engine.checkpoint(), Some(Position::new(3, 3)));

    engine.stop().await;
}

// =============================================================================
// Caught-Up Latch
// =============================================================================

#[tokio::test]
async fn caught_up_fires_once_per_cycle() {
    let store = ScriptedStore::new();
    let (mut engine, mut rx) = SubscriptionEngine::new(store.clone(), EngineConfig::default());
    engine.start(None, 10).unwrap();

    store.push(0, StoreMessage::Event(event("s", 1))).await;
    store.push(0, StoreMessage::LiveProcessingStarted).await;
    store.push(0, StoreMessage::LiveProcessingStarted).await;
    store.push(0, StoreMessage::Event(event("s", 2))).await;

    assert_eq!(next_event(&mut rx).await.position, Position::new(1, 1));
    assert_eq!(next(&mut rx).await, EngineMessage::CaughtUp);
    assert_eq!(next_event(&mut rx).await.position, Position::new(2, 2));
    assert_eq!(engine.state(), SubscriptionState::Live);

    // A new cycle re-arms the latch.
    store.push(0, dropped(DropReason::ProcessingQueueOverflow, None)).await;
    store.push(1, StoreMessage::LiveProcessingStarted).await;
    assert_eq!(next(&mut rx).await, EngineMessage::CaughtUp);
    assert_quiet(&mut rx).await;

    assert_eq!(engine.stats().catch_ups_completed, 2);
    engine.stop().await;
}

#[tokio::test]
async fn caught_up_rearms_after_operator_restart() {
    let store = ScriptedStore::new();
    let (mut engine, mut rx) = SubscriptionEngine::new(store.clone(), EngineConfig::default());
    engine.start(None, 10).unwrap();

    store.push(0, StoreMessage::LiveProcessingStarted).await;
    store.push(0, StoreMessage::LiveProcessingStarted).await;
    assert_eq!(next(&mut rx).await, EngineMessage::CaughtUp);
    assert_quiet(&mut rx).await;

    engine.restart().await.unwrap();

    store.push(1, StoreMessage::LiveProcessingStarted).await;
    store.push(1, StoreMessage::LiveProcessingStarted).await;
    assert_eq!(next(&mut rx).await, EngineMessage::CaughtUp);
    assert_quiet(&mut rx).await;

    assert_eq!(engine.stats().catch_ups_completed, 2);
    engine.stop().await;
}

// =============================================================================
// Drops and Restarts
// =============================================================================

#[tokio::test]
async fn overflow_restarts_from_last_checkpoint() {
    let store = ScriptedStore::new();
    let (mut engine, mut rx) = SubscriptionEngine::new(store.clone(), EngineConfig::default());
    engine.start(None, 10).unwrap();

    let e1 = event("s", 1);
    let e2 = event("s", 2);
    store.push(0, StoreMessage::Event(e1.clone())).await;
    store.push(0, StoreMessage::Event(e2.clone())).await;
    assert_eq!(next_event(&mut rx).await.event_id, e1.event_id);
    assert_eq!(next_event(&mut rx).await.event_id, e2.event_id);

    store
        .push(0, dropped(DropReason::ProcessingQueueOverflow, Some("live queue full")))
        .await;

    // The replacement subscription starts after the checkpoint.
    store.sink(1).await;
    assert_eq!(store.subscribed_from(), vec![None, Some(e2.position)]);
    assert_eq!(store.stop_count(), 1);
    assert_eq!(engine.stats().restarts, 1);

    // A store that replays the checkpoint event anyway is absorbed by the
    // dedup window.
    store.push(1, StoreMessage::Event(e2.clone())).await;
    store.push(1, StoreMessage::Event(event("s", 3))).await;
    assert_eq!(next_event(&mut rx).await.position, Position::new(3, 3));
    assert_quiet(&mut rx).await;
    assert!(engine.state().is_running());

    engine.stop().await;
}

#[tokio::test]
async fn overflow_before_any_event_restarts_from_start_position() {
    let store = ScriptedStore::new();
    let (mut engine, _rx) = SubscriptionEngine::new(store.clone(), EngineConfig::default());
    engine.start(Some(Position::new(5, 5)), 10).unwrap();

    store.push(0, dropped(DropReason::ProcessingQueueOverflow, None)).await;
    store.sink(1).await;

    assert_eq!(
        store.subscribed_from(),
        vec![Some(Position::new(5, 5)), Some(Position::new(5, 5))]
    );
    engine.stop().await;
}

#[tokio::test]
async fn other_drop_reasons_fail_without_restart() {
    let store = ScriptedStore::new();
    let (mut engine, mut rx) = SubscriptionEngine::new(store.clone(), EngineConfig::default());
    engine.start(None, 10).unwrap();

    store.push(0, dropped(DropReason::ServerError, Some("boom"))).await;

    assert_eq!(
        next(&mut rx).await,
        EngineMessage::Failed(SubscriptionFailure {
            reason: DropReason::ServerError,
            detail: Some("boom".to_string()),
        })
    );
    assert_eq!(
        engine.state(),
        SubscriptionState::Stopped(StopCause::Failed(DropReason::ServerError))
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(store.subscribe_count(), 1);
    assert_eq!(engine.stats().restarts, 0);
    assert_eq!(store.stop_count(), 1);

    engine.stop().await;
}

#[test]
fn failure_converts_into_error() {
    let failure = SubscriptionFailure {
        reason: DropReason::AccessDenied,
        detail: Some("$all".to_string()),
    };
    let err = failure.into_error();
    assert!(err.is_terminal());
    assert_eq!(err.to_string(), "subscription dropped because access denied: $all");
}

#[tokio::test]
async fn closed_push_stream_fails_with_connection_closed() {
    let store = ScriptedStore::new();
    let (mut engine, mut rx) = SubscriptionEngine::new(store.clone(), EngineConfig::default());
    engine.start(None, 10).unwrap();
    store.sink(0).await;

    store.disconnect();

    match next(&mut rx).await {
        EngineMessage::Failed(failure) => assert_eq!(failure.reason, DropReason::ConnectionClosed),
        other => panic!("expected failure, got {:?}", other),
    }
    engine.stop().await;
}

#[tokio::test]
async fn subscribe_error_fails_with_subscribing_error() {
    let store = ScriptedStore::new();
    store.fail_subscribes("connection refused");
    let (mut engine, mut rx) = SubscriptionEngine::new(store.clone(), EngineConfig::default());
    engine.start(None, 10).unwrap();

    assert_eq!(
        next(&mut rx).await,
        EngineMessage::Failed(SubscriptionFailure {
            reason: DropReason::SubscribingError,
            detail: Some("store error: connection refused".to_string()),
        })
    );
    engine.stop().await;
}

#[tokio::test]
async fn restart_after_failure_resumes_from_checkpoint() {
    let store = ScriptedStore::new();
    let (mut engine, mut rx) = SubscriptionEngine::new(store.clone(), EngineConfig::default());
    engine.start(None, 10).unwrap();

    let e1 = event("s", 1);
    store.push(0, StoreMessage::Event(e1.clone())).await;
    store.push(0, dropped(DropReason::ConnectionClosed, None)).await;
    assert_eq!(next_event(&mut rx).await.event_id, e1.event_id);
    assert!(matches!(next(&mut rx).await, EngineMessage::Failed(_)));

    engine.restart().await.unwrap();
    store.push(1, StoreMessage::Event(event("s", 2))).await;

    assert_eq!(next_event(&mut rx).await.position, Position::new(2, 2));
    assert_eq!(store.subscribed_from(), vec![None, Some(e1.position)]);
    assert_eq!(engine.stats().restarts, 1);

    engine.stop().await;
}

#[tokio::test]
async fn restart_while_running_reconnects() {
    let store = ScriptedStore::new();
    let (mut engine, mut rx) = SubscriptionEngine::new(store.clone(), EngineConfig::default());
    engine.start(None, 10).unwrap();

    store.push(0, StoreMessage::Event(event("s", 4))).await;
    next_event(&mut rx).await;

    engine.restart().await.unwrap();
    store.sink(1).await;

    assert_eq!(store.subscribed_from(), vec![None, Some(Position::new(4, 4))]);
    assert_eq!(store.stop_count(), 1);
    engine.stop().await;
}

#[tokio::test]
async fn restart_is_not_blocked_by_a_stalled_consumer() {
    let store = ScriptedStore::new();
    let config = EngineConfig {
        stop_timeout: Duration::from_millis(200),
        ..EngineConfig::default()
    };
    let (mut engine, mut rx) = SubscriptionEngine::new(store.clone(), config);
    engine.start(None, 10).unwrap();

    let events: Vec<_> = (1..=70).map(|n| event("s", n)).collect();
    for e in &events {
        store.push(0, StoreMessage::Event(e.clone())).await;
    }

    // Nobody drains the output: 64 events fill it and the 65th waits for room.
    eventually(Duration::from_secs(2), Duration::from_millis(5), || {
        (engine.stats().events_accepted == 65).then_some(())
    })
    .await;

    let restarted = tokio::time::timeout(Duration::from_secs(3), engine.restart()).await;
    assert!(matches!(restarted, Ok(Ok(()))), "restart stalled: {:?}", restarted);

    // The waiting event was never delivered, so the new connection resumes
    // before it.
    store.sink(1).await;
    assert_eq!(store.subscribed_from(), vec![None, Some(Position::new(64, 64))]);
    assert_eq!(engine.checkpoint(), Some(Position::new(64, 64)));

    let mut drained = Vec::new();
    for _ in 0..64 {
        drained.push(next_event(&mut rx).await);
    }
    assert_eq!(commits(&drained), (1..=64).collect::<Vec<_>>());

    store.push(1, StoreMessage::Event(events[64].clone())).await;
    assert_eq!(next_event(&mut rx).await.event_id, events[64].event_id);
    assert_eq!(engine.stats().duplicates_skipped, 0);

    engine.stop().await;
}

// =============================================================================
// Lifecycle
// =============================================================================

#[tokio::test]
async fn start_twice_is_rejected() {
    let store = ScriptedStore::new();
    let (mut engine, _rx) = SubscriptionEngine::new(store.clone(), EngineConfig::default());

    engine.start(None, 10).unwrap();
    assert_eq!(engine.start(None, 10), Err(Error::AlreadyStarted));

    engine.stop().await;
    assert_eq!(engine.start(None, 10), Err(Error::AlreadyStarted));
}

#[tokio::test]
async fn zero_batch_size_is_rejected() {
    let store = ScriptedStore::new();
    let (mut engine, _rx) = SubscriptionEngine::new(store.clone(), EngineConfig::default());

    assert!(matches!(engine.start(None, 0), Err(Error::InvalidConfig(_))));
    assert_eq!(engine.state(), SubscriptionState::Idle);
}

#[tokio::test]
async fn restart_before_start_is_rejected() {
    let store = ScriptedStore::new();
    let (mut engine, _rx) = SubscriptionEngine::new(store, EngineConfig::default());

    assert_eq!(engine.restart().await, Err(Error::NotStarted));
}

#[tokio::test]
async fn stop_is_idempotent_and_final() {
    let store = ScriptedStore::new();
    let (mut engine, mut rx) = SubscriptionEngine::new(store.clone(), EngineConfig::default());
    engine.start(None, 10).unwrap();
    store.sink(0).await;

    engine.stop().await;
    engine.stop().await;

    assert_eq!(engine.state(), SubscriptionState::Stopped(StopCause::Requested));
    assert_eq!(store.stop_count(), 1);

    // Restart after a requested stop is a no-op.
    engine.restart().await.unwrap();
    assert_eq!(store.subscribe_count(), 1);

    // The output closes once the engine is stopped.
    assert!(rx.recv().await.is_none());
}
