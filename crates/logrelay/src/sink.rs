// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The streaming sink.
//!
//! One task per sink owns the connection to its destination and drains a
//! [`BatchStream`]:
//!
//! ```text
//!   Connecting ──> Streaming ──> (Reconnecting ──> Streaming)* ──> Draining ──> Closed
//!       │              │
//!       │              └── terminal failure ──> Halted ──(close)──> Closed
//!       └── cancelled before the first connect ──────────────────────────> Closed
//! ```
//!
//! Delivery is at least once: a batch that was not acknowledged is sent
//! again after reconnecting, so receivers must tolerate duplicates (every
//! batch carries its sequence number).
//!
//! A terminal failure is reported once through [`IngestFailureListener`].
//! The halted sink then keeps reading its source and discards what it reads,
//! counting it as dropped, so producers never block behind a dead sink.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::backoff::{retry, AttemptError, Backoff, RetryError};
use crate::batcher::BatchStream;
use crate::constants;
use crate::credential::{CredentialError, CredentialProvider};
use crate::event::Batch;
use crate::transport::{Destination, IngestClient, TransmitError, TransportConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkState {
    Connecting,
    Streaming,
    Reconnecting,
    Draining,
    /// Stopped sending after a terminal failure; discarding until closed.
    Halted,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("destination rejected the ingestion credential after a refresh: {0}")]
    Unauthenticated(String),
    #[error("unable to obtain an ingestion credential: {0}")]
    Credential(#[from] CredentialError),
    #[error("destination permanently rejected a batch: {0}")]
    Rejected(String),
    #[error("sink could not be set up: {0}")]
    Setup(TransmitError),
    #[error("drain deadline exceeded before the sink closed")]
    DrainDeadlineExceeded,
    #[error("sink task failed: {0}")]
    Task(String),
}

/// Receives the single terminal failure of a sink.
pub trait IngestFailureListener: Send + Sync + Debug {
    fn on_terminal_failure(&self, error: &SinkError);
}

/// Listener for callers that only rely on the sink's state and stats.
#[derive(Debug, Default, Clone, Copy)]
pub struct IgnoreFailures;

impl IngestFailureListener for IgnoreFailures {
    fn on_terminal_failure(&self, _error: &SinkError) {}
}

#[derive(Debug, Clone)]
pub struct SinkConfig {
    /// Shows up in the sink's log span.
    pub name: String,
    pub transport: TransportConfig,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            name: "sink".to_string(),
            transport: TransportConfig::default(),
            reconnect_base: constants::RECONNECT_BACKOFF_BASE,
            reconnect_cap: constants::RECONNECT_BACKOFF_CAP,
        }
    }
}

#[derive(Debug, Default)]
struct SinkStats {
    batches_sent: AtomicU64,
    events_sent: AtomicU64,
    events_dropped: AtomicU64,
    reconnects: AtomicU64,
    auth_refreshes: AtomicU64,
}

impl SinkStats {
    fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SinkStatsSnapshot {
    pub batches_sent: u64,
    pub events_sent: u64,
    pub events_dropped: u64,
    pub reconnects: u64,
    pub auth_refreshes: u64,
}

/// Controls a running sink.
///
/// Dropping the handle without [`SinkHandle::close`] aborts the sink task.
#[derive(Debug)]
pub struct SinkHandle {
    destination: Destination,
    state: Arc<watch::Sender<SinkState>>,
    drain: CancellationToken,
    stats: Arc<SinkStats>,
    task: Option<JoinHandle<()>>,
}

impl SinkHandle {
    #[must_use]
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    #[must_use]
    pub fn state(&self) -> SinkState {
        *self.state.borrow()
    }

    /// Receiver observing every state transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<SinkState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn stats(&self) -> SinkStatsSnapshot {
        SinkStatsSnapshot {
            batches_sent: self.stats.batches_sent.load(Ordering::Relaxed),
            events_sent: self.stats.events_sent.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            reconnects: self.stats.reconnects.load(Ordering::Relaxed),
            auth_refreshes: self.stats.auth_refreshes.load(Ordering::Relaxed),
        }
    }

    /// Moves the sink to `Draining` and waits up to `deadline` for it to
    /// flush what is buffered and close.
    ///
    /// # Errors
    ///
    /// [`SinkError::DrainDeadlineExceeded`] if the deadline elapses first; the
    /// task is aborted and whatever it still held is lost.
    pub async fn close(&mut self, deadline: Duration) -> Result<(), SinkError> {
        self.drain.cancel();
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        let abort = task.abort_handle();
        match tokio::time::timeout(deadline, task).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.state.send_replace(SinkState::Closed);
                Err(SinkError::Task(err.to_string()))
            }
            Err(_) => {
                abort.abort();
                self.state.send_replace(SinkState::Closed);
                Err(SinkError::DrainDeadlineExceeded)
            }
        }
    }
}

impl Drop for SinkHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Starts a sink task streaming `source` to `destination`.
///
/// Batches go out in the order `source` yields them, one at a time.
///
/// Cancelling `parent` has the same effect as [`SinkHandle::close`] without a
/// deadline.
///
/// # Errors
///
/// [`SinkError::Setup`] if the HTTP client cannot be built.
pub fn start(
    parent: &CancellationToken,
    config: SinkConfig,
    destination: Destination,
    credentials: Arc<dyn CredentialProvider>,
    source: impl BatchStream + 'static,
    listener: Arc<dyn IngestFailureListener>,
) -> Result<SinkHandle, SinkError> {
    let client = IngestClient::new(destination.clone(), config.transport).map_err(SinkError::Setup)?;
    let (state, _) = watch::channel(SinkState::Connecting);
    let state = Arc::new(state);
    let drain = parent.child_token();
    let stats = Arc::new(SinkStats::default());

    let worker = SinkWorker {
        client,
        credentials,
        source: Box::new(source),
        listener,
        drain: drain.clone(),
        state: Arc::clone(&state),
        stats: Arc::clone(&stats),
        backoff: Backoff::new(config.reconnect_base, config.reconnect_cap),
        phase: SinkState::Connecting,
        notified: false,
    };
    let span = info_span!("sink", name = %config.name, destination = %destination);
    let task = tokio::spawn(worker.run().instrument(span));

    Ok(SinkHandle {
        destination,
        state,
        drain,
        stats,
        task: Some(task),
    })
}

enum Delivery {
    Sent,
    /// Draining was requested while waiting to resend; the batch is handed back.
    Interrupted(Batch),
    Halted,
}

struct SinkWorker {
    client: IngestClient,
    credentials: Arc<dyn CredentialProvider>,
    source: Box<dyn BatchStream>,
    listener: Arc<dyn IngestFailureListener>,
    drain: CancellationToken,
    state: Arc<watch::Sender<SinkState>>,
    stats: Arc<SinkStats>,
    backoff: Backoff,
    /// The state to return to after reconnecting.
    phase: SinkState,
    notified: bool,
}

impl SinkWorker {
    fn enter(&mut self, state: SinkState) {
        if state != SinkState::Reconnecting {
            self.phase = state;
        }
        self.state.send_replace(state);
    }

    async fn run(mut self) {
        let drain = self.drain.clone();
        if !self.connect(&drain).await {
            debug!("Cancelled before the first connection");
            self.discard_remaining();
            self.enter(SinkState::Closed);
            return;
        }
        info!("Connected");
        self.enter(SinkState::Streaming);

        let mut pending = None;
        while !drain.is_cancelled() {
            let batch = self.source.next_batch(&drain).await;
            if batch.is_empty() {
                if self.source.is_exhausted() {
                    break;
                }
                continue;
            }
            match self.deliver(batch, &drain).await {
                Delivery::Sent => {}
                Delivery::Interrupted(batch) => {
                    pending = Some(batch);
                    break;
                }
                Delivery::Halted => {
                    self.discard_until_closed().await;
                    return;
                }
            }
        }

        self.drain_remaining(pending).await;
    }

    async fn connect(&mut self, cancel: &CancellationToken) -> bool {
        let client = self.client.clone();
        let connected = retry(cancel, &mut self.backoff, || {
            let client = client.clone();
            async move {
                client.probe().await.map_err(|err| match err {
                    TransmitError::Transient(_) => AttemptError::Transient(err),
                    other => AttemptError::Terminal(other),
                })
            }
        })
        .await;
        self.backoff.reset();
        match connected {
            Ok(()) => true,
            Err(RetryError::Cancelled) => false,
            // Only a malformed probe request is terminal; let the first send
            // classify the destination.
            Err(RetryError::Terminal(err)) => {
                debug!("Health probe could not be built: {err}");
                true
            }
        }
    }

    /// Backs off, then re-establishes the connection. Returns false if
    /// `cancel` fired first.
    async fn reconnect(&mut self, cancel: &CancellationToken) -> bool {
        self.enter(SinkState::Reconnecting);
        SinkStats::add(&self.stats.reconnects, 1);
        let delay = self.backoff.next_delay();
        let waited = tokio::select! {
            biased;
            () = cancel.cancelled() => false,
            () = sleep(delay) => true,
        };
        let client = self.client.clone();
        let reconnected = waited
            && retry(cancel, &mut self.backoff, || {
                let client = client.clone();
                async move {
                    client.probe().await.map_err(|err| match err {
                        TransmitError::Transient(_) => AttemptError::Transient(err),
                        other => AttemptError::Terminal(other),
                    })
                }
            })
            .await
            .map_or_else(|err| matches!(err, RetryError::Terminal(_)), |()| true);
        let phase = self.phase;
        self.enter(phase);
        reconnected
    }

    /// Sends `batch` until it is acknowledged, the failure is terminal, or
    /// `cancel` interrupts a reconnect.
    async fn deliver(&mut self, batch: Batch, cancel: &CancellationToken) -> Delivery {
        let mut refreshed = false;
        loop {
            let credential = match self.credentials.ensure_credential().await {
                Ok(credential) => credential,
                Err(err) if err.is_transient() => {
                    warn!("Credential refresh failed, retrying: {err}");
                    if !self.reconnect(cancel).await {
                        return Delivery::Interrupted(batch);
                    }
                    continue;
                }
                Err(err) => return self.fail(SinkError::Credential(err), &batch),
            };

            match self.client.send(&batch, &credential).await {
                Ok(()) => {
                    SinkStats::add(&self.stats.batches_sent, 1);
                    SinkStats::add(&self.stats.events_sent, batch.len());
                    self.backoff.reset();
                    debug!(
                        "Batch {} acknowledged ({} events)",
                        batch.sequence(),
                        batch.len()
                    );
                    return Delivery::Sent;
                }
                Err(TransmitError::Unauthenticated(detail)) if !refreshed => {
                    debug!("Credential rejected, refreshing: {detail}");
                    refreshed = true;
                    SinkStats::add(&self.stats.auth_refreshes, 1);
                    self.credentials.invalidate(&credential).await;
                }
                Err(TransmitError::Unauthenticated(detail)) => {
                    return self.fail(SinkError::Unauthenticated(detail), &batch);
                }
                Err(TransmitError::Transient(detail)) => {
                    warn!("Batch {} not acknowledged, reconnecting: {detail}", batch.sequence());
                    if !self.reconnect(cancel).await {
                        return Delivery::Interrupted(batch);
                    }
                }
                Err(TransmitError::Terminal(detail)) => {
                    return self.fail(SinkError::Rejected(detail), &batch);
                }
            }
        }
    }

    fn fail(&mut self, err: SinkError, batch: &Batch) -> Delivery {
        error!("Unable to ingest, halting sink: {err}");
        SinkStats::add(&self.stats.events_dropped, batch.len());
        if !self.notified {
            self.notified = true;
            self.listener.on_terminal_failure(&err);
        }
        Delivery::Halted
    }

    async fn discard_until_closed(&mut self) {
        self.enter(SinkState::Halted);
        let drain = self.drain.clone();
        while !drain.is_cancelled() && !self.source.is_exhausted() {
            let batch = self.source.next_batch(&drain).await;
            SinkStats::add(&self.stats.events_dropped, batch.len());
        }
        self.discard_remaining();
        self.enter(SinkState::Closed);
    }

    fn discard_remaining(&mut self) {
        self.source.close();
        while let Some(batch) = self.source.try_next_batch() {
            SinkStats::add(&self.stats.events_dropped, batch.len());
        }
    }

    /// Flushes `pending` and whatever is still queued. Bounded only by the
    /// deadline of [`SinkHandle::close`], which aborts this task.
    async fn drain_remaining(&mut self, pending: Option<Batch>) {
        self.enter(SinkState::Draining);
        self.source.close();
        let uninterruptible = CancellationToken::new();
        let mut next = pending.or_else(|| self.source.try_next_batch());
        while let Some(batch) = next {
            match self.deliver(batch, &uninterruptible).await {
                Delivery::Sent => {}
                Delivery::Interrupted(batch) => {
                    SinkStats::add(&self.stats.events_dropped, batch.len());
                }
                Delivery::Halted => {
                    self.discard_remaining();
                    break;
                }
            }
            next = self.source.try_next_batch();
        }
        info!("Drained");
        self.enter(SinkState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batcher::{self, BatcherConfig};
    use crate::credential::{CredentialScope, StaticCredential};
    use crate::event::LogEvent;

    fn unreachable_destination() -> Destination {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);
        Destination::from_socket_addr(address)
    }

    #[tokio::test]
    async fn test_cancelled_before_first_connect_goes_straight_to_closed() {
        let (producer, source) = batcher::channel(BatcherConfig::default());
        producer.try_push(LogEvent::new("never sent")).unwrap();
        let parent = CancellationToken::new();
        let mut handle = start(
            &parent,
            SinkConfig {
                reconnect_base: Duration::from_millis(10),
                reconnect_cap: Duration::from_millis(50),
                ..SinkConfig::default()
            },
            unreachable_destination(),
            Arc::new(StaticCredential::new("t", CredentialScope::new("env"))),
            source,
            Arc::new(IgnoreFailures),
        )
        .unwrap();
        let mut states = handle.subscribe();
        assert_eq!(handle.state(), SinkState::Connecting);

        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.close(Duration::from_secs(2)).await.unwrap();

        assert_eq!(handle.state(), SinkState::Closed);
        assert_eq!(*states.borrow_and_update(), SinkState::Closed);
        assert_eq!(handle.stats().events_dropped, 1);
        assert_eq!(handle.stats().batches_sent, 0);
    }

    #[tokio::test]
    async fn test_close_twice_is_ok() {
        let (_producer, source) = batcher::channel(BatcherConfig::default());
        let parent = CancellationToken::new();
        let mut handle = start(
            &parent,
            SinkConfig::default(),
            unreachable_destination(),
            Arc::new(StaticCredential::new("t", CredentialScope::new("env"))),
            source,
            Arc::new(IgnoreFailures),
        )
        .unwrap();

        parent.cancel();
        handle.close(Duration::from_secs(2)).await.unwrap();
        handle.close(Duration::from_secs(2)).await.unwrap();
        assert_eq!(handle.state(), SinkState::Closed);
    }
}
