// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Size and time bounded event batching.
//!
//! [`channel`] splits a batcher into two halves:
//!
//! ```text
//!   EventProducer (Clone) ──bounded queue──> BatchSource ──next_batch──> sink
//! ```
//!
//! The queue is bounded. Once it is full, [`EventProducer::push`] waits for
//! room instead of dropping: a slow consumer slows the producer down. The
//! wait ends with [`PushError::Cancelled`] as soon as the caller's token
//! fires.
//!
//! A batch closes when it reaches `max_events`, when adding the next event
//! would make its serialized form exceed `max_bytes`, or when
//! `flush_interval` has elapsed since the previous batch, whichever comes
//! first. Events keep their push order across batches. An event that could
//! not fit even in a batch of its own is refused at push time with
//! [`PushError::TooLarge`].

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TryRecvError, error::TrySendError};
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

use crate::constants;
use crate::event::{Batch, LogEvent, Resource, Scope, SourceTag};

#[derive(Debug, Clone)]
pub struct BatcherConfig {
    pub max_events: usize,
    /// Bound on a batch's serialized size, before compression.
    pub max_bytes: usize,
    pub flush_interval: Duration,
    /// Events queued before `push` starts waiting.
    pub capacity: usize,
    pub source: SourceTag,
    pub resource: Resource,
    pub scope: Scope,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_events: constants::DEFAULT_MAX_BATCH_EVENTS,
            max_bytes: constants::DEFAULT_MAX_BATCH_BYTES,
            flush_interval: constants::DEFAULT_FLUSH_INTERVAL,
            capacity: constants::DEFAULT_QUEUE_CAPACITY,
            source: SourceTag::Local,
            resource: Resource::default(),
            scope: Scope::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PushError {
    #[error("push cancelled while waiting for queue capacity")]
    Cancelled,
    #[error("batcher is closed")]
    Closed,
    #[error("batcher queue is full")]
    Full,
    #[error("event needs {size} bytes once encoded, a batch has room for {limit}")]
    TooLarge { size: usize, limit: usize },
}

/// What a sink drains, in delivery order.
///
/// [`BatchSource`] seals batches from single events; the owner's relay queue
/// hands on batches that were sealed elsewhere.
#[async_trait]
pub trait BatchStream: Send + Debug {
    /// Waits for the next batch. May return an empty batch when `cancel`
    /// fires, when a flush timer expires or at the end of input.
    async fn next_batch(&mut self, cancel: &CancellationToken) -> Batch;

    /// A batch from what is queued right now, `None` when nothing is.
    fn try_next_batch(&mut self) -> Option<Batch>;

    /// Stops accepting input. Already queued input can still be read.
    fn close(&mut self);

    /// True once no producer is left and nothing is left to hand out.
    fn is_exhausted(&self) -> bool;
}

static STREAMS_OPENED: AtomicU64 = AtomicU64::new(0);

/// Unique per process start and batcher, fixed width.
fn new_stream_id() -> String {
    let started = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX));
    let opened = STREAMS_OPENED.fetch_add(1, Ordering::Relaxed);
    format!("{:08x}-{started:016x}-{opened:08x}", std::process::id())
}

/// Creates a connected producer/source pair with a fresh stream id.
///
/// Zero limits are raised to one so a batch can always make progress.
#[must_use]
pub fn channel(config: BatcherConfig) -> (EventProducer, BatchSource) {
    let (tx, rx) = mpsc::channel(config.capacity.max(1));
    let config = BatcherConfig {
        max_events: config.max_events.max(1),
        max_bytes: config.max_bytes.max(1),
        ..config
    };
    let stream = new_stream_id();
    let envelope_bytes = Batch::new(
        0,
        config.source,
        config.resource.clone(),
        config.scope.clone(),
        Vec::new(),
    )
    .with_stream(stream.as_str())
    .envelope_len();
    (
        EventProducer {
            tx,
            max_event_bytes: config.max_bytes.saturating_sub(envelope_bytes),
        },
        BatchSource {
            rx,
            config,
            stream,
            envelope_bytes,
            carry: None,
            next_sequence: 1,
            last_flush: Instant::now(),
            exhausted: false,
        },
    )
}

/// Producer half. Cheap to clone; the source sees the end of input once every
/// clone is dropped.
#[derive(Debug, Clone)]
pub struct EventProducer {
    tx: mpsc::Sender<LogEvent>,
    max_event_bytes: usize,
}

impl EventProducer {
    /// Largest [`LogEvent::encoded_len`] a push accepts.
    #[must_use]
    pub fn max_event_bytes(&self) -> usize {
        self.max_event_bytes
    }

    fn check_size(&self, event: &LogEvent) -> Result<(), PushError> {
        let size = event.encoded_len();
        if size > self.max_event_bytes {
            return Err(PushError::TooLarge {
                size,
                limit: self.max_event_bytes,
            });
        }
        Ok(())
    }

    /// Queues `event`, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// [`PushError::TooLarge`] if the event cannot fit in any batch,
    /// [`PushError::Cancelled`] if `cancel` fires first, [`PushError::Closed`]
    /// if the source has been dropped.
    pub async fn push(&self, event: LogEvent, cancel: &CancellationToken) -> Result<(), PushError> {
        self.check_size(&event)?;
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PushError::Cancelled),
            sent = self.tx.send(event) => sent.map_err(|_| PushError::Closed),
        }
    }

    /// Queues `event` only if there is room right now.
    ///
    /// # Errors
    ///
    /// [`PushError::TooLarge`], [`PushError::Full`] or [`PushError::Closed`].
    pub fn try_push(&self, event: LogEvent) -> Result<(), PushError> {
        self.check_size(&event)?;
        self.tx.try_send(event).map_err(|err| match err {
            TrySendError::Full(_) => PushError::Full,
            TrySendError::Closed(_) => PushError::Closed,
        })
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer half, owned by exactly one sink.
#[derive(Debug)]
pub struct BatchSource {
    rx: mpsc::Receiver<LogEvent>,
    config: BatcherConfig,
    stream: String,
    /// Serialized size of a batch with no events.
    envelope_bytes: usize,
    carry: Option<LogEvent>,
    next_sequence: u64,
    last_flush: Instant,
    exhausted: bool,
}

impl BatchSource {
    #[must_use]
    pub fn config(&self) -> &BatcherConfig {
        &self.config
    }

    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    #[must_use]
    pub fn envelope_len(&self) -> usize {
        self.envelope_bytes
    }

    /// True once every producer is gone and nothing is left to hand out.
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.carry.is_none()
    }

    /// Waits for the next batch.
    ///
    /// Returns when the batch is full, when the flush interval has elapsed
    /// since the previous call returned, when every producer is gone, or when
    /// `cancel` fires. The batch may be empty in the last three cases.
    pub async fn next_batch(&mut self, cancel: &CancellationToken) -> Batch {
        let deadline = self.last_flush + self.config.flush_interval;
        let mut events = Vec::new();
        let mut bytes = self.envelope_bytes;
        if let Some(event) = self.carry.take() {
            bytes += event.encoded_len();
            events.push(event);
        }

        while !self.is_full(events.len(), bytes) && !self.exhausted {
            let received = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                received = self.rx.recv() => received,
                () = sleep_until(deadline) => break,
            };
            match received {
                Some(event) => {
                    if !self.admit(&mut events, &mut bytes, event) {
                        break;
                    }
                }
                None => self.exhausted = true,
            }
        }

        self.last_flush = Instant::now();
        self.seal(events)
    }

    /// Builds a batch from whatever is queued right now, without waiting.
    ///
    /// Returns `None` when nothing is queued.
    pub fn try_next_batch(&mut self) -> Option<Batch> {
        let mut events = Vec::new();
        let mut bytes = self.envelope_bytes;
        if let Some(event) = self.carry.take() {
            bytes += event.encoded_len();
            events.push(event);
        }

        while !self.is_full(events.len(), bytes) && !self.exhausted {
            match self.rx.try_recv() {
                Ok(event) => {
                    if !self.admit(&mut events, &mut bytes, event) {
                        break;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => self.exhausted = true,
            }
        }

        if events.is_empty() {
            None
        } else {
            self.last_flush = Instant::now();
            Some(self.seal(events))
        }
    }

    /// Stops accepting new events. Already queued events can still be read.
    pub fn close(&mut self) {
        self.rx.close();
    }

    fn is_full(&self, count: usize, bytes: usize) -> bool {
        count >= self.config.max_events || bytes >= self.config.max_bytes
    }

    /// Adds `event` unless it would overflow a non-empty batch, in which case
    /// it is carried to the next one. Returns whether the batch stays open.
    fn admit(&mut self, events: &mut Vec<LogEvent>, bytes: &mut usize, event: LogEvent) -> bool {
        let size = event.encoded_len();
        if !events.is_empty() && bytes.saturating_add(size) > self.config.max_bytes {
            self.carry = Some(event);
            return false;
        }
        *bytes = bytes.saturating_add(size);
        events.push(event);
        true
    }

    fn seal(&mut self, events: Vec<LogEvent>) -> Batch {
        let sequence = self.next_sequence;
        if !events.is_empty() {
            self.next_sequence += 1;
        }
        Batch::new(
            sequence,
            self.config.source,
            self.config.resource.clone(),
            self.config.scope.clone(),
            events,
        )
        .with_stream(self.stream.as_str())
    }
}

#[async_trait]
impl BatchStream for BatchSource {
    async fn next_batch(&mut self, cancel: &CancellationToken) -> Batch {
        BatchSource::next_batch(self, cancel).await
    }

    fn try_next_batch(&mut self) -> Option<Batch> {
        BatchSource::try_next_batch(self)
    }

    fn close(&mut self) {
        BatchSource::close(self);
    }

    fn is_exhausted(&self) -> bool {
        BatchSource::is_exhausted(self)
    }
}
