// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded shutdown.
//!
//! Each sink gets `2 × flush_interval` to flush what it holds. Missing the
//! deadline is reported, never fatal: the loss is accepted on a forced
//! shutdown. Resources the sinks depend on are released only after the sinks
//! are done with them:
//!
//! ```text
//!   own sink ──> owner server (listener) ──> relay sink ──> storage
//! ```
//!
//! A forwarder only has its own sink.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::server::OwnerServerHandle;
use crate::sink::{SinkError, SinkHandle, SinkStatsSnapshot};
use crate::storage::StorageEngine;

/// What the owner role holds besides its own sink.
#[derive(Debug)]
pub struct OwnerResources {
    pub server: OwnerServerHandle,
    pub relay: Option<SinkHandle>,
    pub storage: Arc<dyn StorageEngine>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Drained,
    DeadlineExceeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkReport {
    pub outcome: DrainOutcome,
    pub stats: SinkStatsSnapshot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub sink: SinkReport,
    pub relay: Option<SinkReport>,
    /// Errors hit while releasing the listener or storage.
    pub problems: Vec<String>,
}

impl ShutdownReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.sink.outcome == DrainOutcome::Drained
            && self
                .relay
                .as_ref()
                .map_or(true, |relay| relay.outcome == DrainOutcome::Drained)
            && self.problems.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DrainCoordinator {
    flush_interval: Duration,
}

impl DrainCoordinator {
    #[must_use]
    pub fn new(flush_interval: Duration) -> Self {
        Self { flush_interval }
    }

    /// Time each sink gets to flush: one full flush cycle plus margin.
    #[must_use]
    pub fn drain_deadline(&self) -> Duration {
        self.flush_interval.saturating_mul(2)
    }

    /// Closes `sink` within the drain deadline.
    pub async fn close_sink(&self, sink: &mut SinkHandle) -> SinkReport {
        let deadline = self.drain_deadline();
        let outcome = match sink.close(deadline).await {
            Ok(()) => DrainOutcome::Drained,
            Err(SinkError::DrainDeadlineExceeded) => {
                warn!(
                    "Sink to {} did not drain within {deadline:?}; undelivered events are dropped",
                    sink.destination()
                );
                DrainOutcome::DeadlineExceeded
            }
            Err(err) => {
                warn!("Sink to {} failed while draining: {err}", sink.destination());
                DrainOutcome::Failed
            }
        };
        let stats = sink.stats();
        info!(
            "Sink to {} closed: {} events sent, {} dropped",
            sink.destination(),
            stats.events_sent,
            stats.events_dropped
        );
        SinkReport { outcome, stats }
    }

    /// Shuts a whole role down in dependency order.
    pub async fn shutdown(&self, mut sink: SinkHandle, owner: Option<OwnerResources>) -> ShutdownReport {
        let sink = self.close_sink(&mut sink).await;
        let mut report = ShutdownReport {
            sink,
            relay: None,
            problems: Vec::new(),
        };

        let Some(OwnerResources {
            server,
            relay,
            storage,
        }) = owner
        else {
            return report;
        };

        if let Err(err) = server.close().await {
            warn!("Owner server stopped with an error: {err}");
            report.problems.push(err.to_string());
        }
        if let Some(mut relay) = relay {
            report.relay = Some(self.close_sink(&mut relay).await);
        }
        if let Err(err) = storage.close().await {
            warn!("Storage did not close cleanly: {err}");
            report.problems.push(err.to_string());
        }
        report
    }
}
