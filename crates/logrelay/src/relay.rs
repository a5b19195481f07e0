// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The owner's queue toward the remote backend.
//!
//! Ingested batches are queued whole, so each one reaches the backend with
//! the stream, sequence, source, resource and scope of the process that
//! sealed it. The queue is bounded: [`RelayProducer::push`] waits for room.

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio_util::sync::CancellationToken;

use crate::batcher::{BatchStream, PushError};
use crate::event::{Batch, Resource, Scope, SourceTag};

/// Creates a relay queue holding up to `capacity` batches.
#[must_use]
pub fn channel(capacity: usize) -> (RelayProducer, RelayedBatches) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (
        RelayProducer { tx },
        RelayedBatches {
            rx,
            exhausted: false,
        },
    )
}

#[derive(Debug, Clone)]
pub struct RelayProducer {
    tx: mpsc::Sender<Batch>,
}

impl RelayProducer {
    /// Queues `batch`, waiting while the queue is full.
    ///
    /// # Errors
    ///
    /// [`PushError::Cancelled`] if `cancel` fires first, [`PushError::Closed`]
    /// if the relay sink is gone.
    pub async fn push(&self, batch: Batch, cancel: &CancellationToken) -> Result<(), PushError> {
        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(PushError::Cancelled),
            sent = self.tx.send(batch) => sent.map_err(|_| PushError::Closed),
        }
    }
}

/// Consumer half, drained by the relay sink.
#[derive(Debug)]
pub struct RelayedBatches {
    rx: mpsc::Receiver<Batch>,
    exhausted: bool,
}

fn nothing() -> Batch {
    Batch::new(
        0,
        SourceTag::default(),
        Resource::default(),
        Scope::default(),
        Vec::new(),
    )
}

#[async_trait]
impl BatchStream for RelayedBatches {
    async fn next_batch(&mut self, cancel: &CancellationToken) -> Batch {
        if self.exhausted {
            return nothing();
        }
        tokio::select! {
            biased;
            () = cancel.cancelled() => nothing(),
            received = self.rx.recv() => received.unwrap_or_else(|| {
                self.exhausted = true;
                nothing()
            }),
        }
    }

    fn try_next_batch(&mut self) -> Option<Batch> {
        match self.rx.try_recv() {
            Ok(batch) => Some(batch),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.exhausted = true;
                None
            }
        }
    }

    fn close(&mut self) {
        self.rx.close();
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LogEvent;
    use std::time::Duration;

    fn batch(stream: &str, sequence: u64, service: &str) -> Batch {
        Batch::new(
            sequence,
            SourceTag::Api,
            Resource {
                service_name: service.to_string(),
                ..Resource::default()
            },
            Scope::default(),
            vec![LogEvent::new(format!("{service} {sequence}"))],
        )
        .with_stream(stream)
    }

    #[tokio::test]
    async fn test_batches_pass_through_unchanged() {
        let (producer, mut relayed) = channel(4);
        let cancel = CancellationToken::new();
        let sent = [batch("a", 7, "checkout"), batch("b", 1, "billing")];
        for b in &sent {
            producer.push(b.clone(), &cancel).await.unwrap();
        }
        drop(producer);

        assert_eq!(relayed.next_batch(&cancel).await, sent[0]);
        assert_eq!(relayed.try_next_batch(), Some(sent[1].clone()));
        assert!(relayed.next_batch(&cancel).await.is_empty());
        assert!(relayed.is_exhausted());
    }

    #[tokio::test]
    async fn test_full_queue_waits_until_cancelled() {
        let (producer, _relayed) = channel(1);
        let cancel = CancellationToken::new();
        producer.push(batch("a", 1, "svc"), &cancel).await.unwrap();

        let blocked = {
            let producer = producer.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { producer.push(batch("a", 2, "svc"), &cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!blocked.is_finished());
        cancel.cancel();

        assert_eq!(blocked.await.unwrap(), Err(PushError::Cancelled));
    }

    #[tokio::test]
    async fn test_cancelled_wait_yields_an_empty_batch() {
        let (_producer, mut relayed) = channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert!(relayed.next_batch(&cancel).await.is_empty());
        assert!(!relayed.is_exhausted());
    }

    #[tokio::test]
    async fn test_push_after_close_is_closed() {
        let (producer, mut relayed) = channel(1);
        relayed.close();
        assert_eq!(
            producer
                .push(batch("a", 1, "svc"), &CancellationToken::new())
                .await,
            Err(PushError::Closed)
        );
    }
}
