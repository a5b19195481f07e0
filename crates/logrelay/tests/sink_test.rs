// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Streaming sink against a scripted receiver.

mod common;

use common::helpers::{eventually, static_credentials, RecordingListener, RotatingCredentials};
use common::mock_backend::MockBackend;
use logrelay::batcher::{self, BatcherConfig, EventProducer};
use logrelay::credential::CredentialProvider;
use logrelay::event::LogEvent;
use logrelay::sink::{self, SinkConfig, SinkError, SinkHandle, SinkState};
use logrelay::transport::TransportConfig;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn sink_config() -> SinkConfig {
    SinkConfig {
        name: "test".to_string(),
        transport: TransportConfig {
            request_timeout: Duration::from_secs(30),
            compression_level: 3,
        },
        reconnect_base: Duration::from_millis(10),
        reconnect_cap: Duration::from_millis(50),
    }
}

fn start_sink(
    backend: &MockBackend,
    batcher_config: BatcherConfig,
    credentials: Arc<dyn CredentialProvider>,
    listener: Arc<RecordingListener>,
) -> (EventProducer, SinkHandle) {
    let (producer, source) = batcher::channel(batcher_config);
    let handle = sink::start(
        &CancellationToken::new(),
        sink_config(),
        backend.destination(),
        credentials,
        source,
        listener,
    )
    .unwrap();
    (producer, handle)
}

/// Batches seal on count only, so their contents are deterministic.
fn batches_of(max_events: usize) -> BatcherConfig {
    BatcherConfig {
        max_events,
        flush_interval: Duration::from_secs(60),
        ..BatcherConfig::default()
    }
}

#[tokio::test]
async fn test_events_arrive_in_push_order() {
    let backend = MockBackend::start().await;
    let listener = Arc::new(RecordingListener::default());
    let (producer, mut handle) =
        start_sink(&backend, batches_of(3), static_credentials(), listener.clone());

    let cancel = CancellationToken::new();
    let expected: Vec<String> = (0..25).map(|i| format!("event {i}")).collect();
    for text in &expected {
        producer
            .push(LogEvent::new(text.clone()), &cancel)
            .await
            .unwrap();
    }
    drop(producer);

    handle.close(Duration::from_secs(5)).await.unwrap();

    assert_eq!(backend.acknowledged_texts(), expected);
    let sequences: Vec<u64> = backend
        .acknowledged()
        .iter()
        .map(|batch| batch.sequence())
        .collect();
    assert!(sequences.windows(2).all(|pair| pair[0] < pair[1]), "{sequences:?}");
    assert!(backend.acknowledged().iter().all(|batch| batch.len() <= 3));
    assert_eq!(handle.stats().events_sent, 25);
    assert_eq!(handle.state(), SinkState::Closed);
    assert_eq!(listener.count(), 0);
}

#[tokio::test]
async fn test_transient_failures_resend_the_same_batch() {
    let backend = MockBackend::start().await;
    backend.script(&[503, 429]);
    let listener = Arc::new(RecordingListener::default());
    let (producer, mut handle) =
        start_sink(&backend, batches_of(3), static_credentials(), listener.clone());

    let cancel = CancellationToken::new();
    for text in ["a", "b", "c"] {
        producer.push(LogEvent::new(text), &cancel).await.unwrap();
    }

    assert!(eventually(|| async { backend.acknowledged().len() == 1 }).await);
    let attempts = backend.received();
    assert_eq!(attempts.len(), 3);
    assert!(attempts
        .iter()
        .all(|received| received.batch.sequence() == attempts[0].batch.sequence()));
    assert_eq!(backend.acknowledged_texts(), ["a", "b", "c"]);
    assert_eq!(handle.stats().reconnects, 2);

    drop(producer);
    handle.close(Duration::from_secs(5)).await.unwrap();
    assert_eq!(listener.count(), 0);
}

#[tokio::test]
async fn test_rejected_credential_is_refreshed_once() {
    let backend = MockBackend::start().await;
    backend.script(&[401]);
    let credentials = Arc::new(RotatingCredentials::default());
    let listener = Arc::new(RecordingListener::default());
    let (producer, mut handle) =
        start_sink(&backend, batches_of(1), credentials.clone(), listener.clone());

    producer
        .push(LogEvent::new("needs auth"), &CancellationToken::new())
        .await
        .unwrap();
    drop(producer);
    handle.close(Duration::from_secs(5)).await.unwrap();

    let received = backend.received();
    assert_eq!(received.len(), 2);
    assert_eq!(received[0].authorization.as_deref(), Some("Bearer token-1"));
    assert_eq!(received[1].authorization.as_deref(), Some("Bearer token-2"));
    assert_eq!(backend.acknowledged_texts(), ["needs auth"]);
    assert_eq!(credentials.invalidations.load(Ordering::SeqCst), 1);
    assert_eq!(handle.stats().auth_refreshes, 1);
    assert_eq!(listener.count(), 0);
}

#[tokio::test]
async fn test_terminal_auth_failure_notifies_exactly_once() {
    let backend = MockBackend::start().await;
    backend.respond_always(401);
    let credentials = Arc::new(RotatingCredentials::default());
    let listener = Arc::new(RecordingListener::default());
    let (producer, mut handle) =
        start_sink(&backend, batches_of(3), credentials.clone(), listener.clone());
    let mut states = handle.subscribe();

    let cancel = CancellationToken::new();
    for text in ["a", "b", "c"] {
        producer.push(LogEvent::new(text), &cancel).await.unwrap();
    }
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == SinkState::Halted),
    )
    .await
    .unwrap()
    .unwrap();

    // A halted sink keeps the producer moving and stops sending.
    for i in 0..10 {
        producer
            .push(LogEvent::new(format!("late {i}")), &cancel)
            .await
            .unwrap();
    }
    drop(producer);
    handle.close(Duration::from_secs(5)).await.unwrap();

    assert_eq!(listener.count(), 1);
    assert!(matches!(
        listener.failures.lock().unwrap()[0],
        SinkError::Unauthenticated(_)
    ));
    assert_eq!(backend.ingest_calls(), 2);
    assert_eq!(credentials.invalidations.load(Ordering::SeqCst), 1);
    assert!(backend.acknowledged().is_empty());
    assert_eq!(handle.stats().events_dropped, 13);
    assert_eq!(handle.state(), SinkState::Closed);
}

#[tokio::test]
async fn test_permanent_rejection_is_terminal() {
    let backend = MockBackend::start().await;
    backend.respond_always(413);
    let listener = Arc::new(RecordingListener::default());
    let (producer, mut handle) =
        start_sink(&backend, batches_of(1), static_credentials(), listener.clone());
    let mut states = handle.subscribe();

    producer
        .push(LogEvent::new("too big"), &CancellationToken::new())
        .await
        .unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        states.wait_for(|state| *state == SinkState::Halted),
    )
    .await
    .unwrap()
    .unwrap();

    assert_eq!(backend.ingest_calls(), 1);
    assert!(matches!(
        listener.failures.lock().unwrap()[0],
        SinkError::Rejected(_)
    ));
    drop(producer);
    handle.close(Duration::from_secs(5)).await.unwrap();
    assert_eq!(listener.count(), 1);
}

#[tokio::test]
async fn test_close_is_bounded_when_destination_never_answers() {
    let backend = MockBackend::start().await;
    backend.hang();
    let listener = Arc::new(RecordingListener::default());
    let (producer, mut handle) =
        start_sink(&backend, batches_of(1), static_credentials(), listener.clone());

    producer
        .push(LogEvent::new("stuck"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(eventually(|| async { backend.ingest_calls() == 1 }).await);

    let deadline = Duration::from_millis(200);
    let started = Instant::now();
    let result = handle.close(deadline).await;
    let elapsed = started.elapsed();

    assert_eq!(result, Err(SinkError::DrainDeadlineExceeded));
    assert!(elapsed >= deadline, "{elapsed:?}");
    assert!(elapsed < deadline + Duration::from_millis(500), "{elapsed:?}");
    assert_eq!(handle.state(), SinkState::Closed);
    assert_eq!(listener.count(), 0);
}

#[tokio::test]
async fn test_slow_destination_blocks_the_producer_instead_of_dropping() {
    let backend = MockBackend::start().await;
    backend.hang();
    let listener = Arc::new(RecordingListener::default());
    let config = BatcherConfig {
        max_events: 1,
        capacity: 1,
        flush_interval: Duration::from_millis(20),
        ..BatcherConfig::default()
    };
    let (producer, mut handle) = start_sink(&backend, config, static_credentials(), listener);

    let cancel = CancellationToken::new();
    producer.push(LogEvent::new("in flight"), &cancel).await.unwrap();
    assert!(eventually(|| async { backend.ingest_calls() == 1 }).await);
    producer.push(LogEvent::new("queued"), &cancel).await.unwrap();

    let blocked = tokio::time::timeout(
        Duration::from_millis(200),
        producer.push(LogEvent::new("waiting"), &cancel),
    )
    .await;
    assert!(blocked.is_err(), "push should wait for queue capacity");

    let stopping = CancellationToken::new();
    stopping.cancel();
    assert_eq!(
        producer.push(LogEvent::new("given up"), &stopping).await,
        Err(batcher::PushError::Cancelled)
    );
    assert_eq!(handle.stats().events_dropped, 0);

    let _ = handle.close(Duration::from_millis(100)).await;
}
