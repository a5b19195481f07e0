// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Storage engines behind the owner.
//!
//! The owner only talks to [`StorageEngine`]: bulk export of received
//! batches, queries, stats and close. Events are kept ordered by capture
//! timestamp (ties keep arrival order), never by arrival alone, since
//! batches from different forwarders interleave arbitrarily.

pub mod file;
pub mod memory;

use std::fmt::Debug;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::constants;
use crate::event::{Batch, LogEvent, SourceTag};

/// One stored event with the batch metadata it arrived with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event: LogEvent,
    pub source: SourceTag,
    pub service_name: String,
    pub host_name: String,
    pub scope_name: String,
}

impl StoredEvent {
    #[must_use]
    pub fn from_batch(batch: Batch) -> Vec<Self> {
        let source = batch.source();
        let service_name = batch.resource().service_name.clone();
        let host_name = batch.resource().host_name.clone();
        let scope_name = batch.scope().name.clone();
        batch
            .into_events()
            .into_iter()
            .map(|event| Self {
                event,
                source,
                service_name: service_name.clone(),
                host_name: host_name.clone(),
                scope_name: scope_name.clone(),
            })
            .collect()
    }

    #[must_use]
    pub fn timestamp(&self) -> u64 {
        self.event.captured_at_unix_nano()
    }
}

/// Filters for [`StorageEngine::query`]. Every set filter must match.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogQuery {
    /// Substring of the raw event text.
    pub contains: Option<String>,
    pub since_unix_nano: Option<u64>,
    pub source: Option<SourceTag>,
    pub service_name: Option<String>,
    /// Most recent matches to return; defaults to 100.
    pub limit: Option<usize>,
}

impl LogQuery {
    #[must_use]
    pub fn matches(&self, stored: &StoredEvent) -> bool {
        if self.since_unix_nano.is_some_and(|since| stored.timestamp() < since) {
            return false;
        }
        if self.source.is_some_and(|source| stored.source != source) {
            return false;
        }
        if let Some(service) = &self.service_name {
            if &stored.service_name != service {
                return false;
            }
        }
        match &self.contains {
            Some(needle) => stored.event.text().contains(needle.as_str()),
            None => true,
        }
    }

    #[must_use]
    pub fn effective_limit(&self) -> usize {
        self.limit.unwrap_or(constants::DEFAULT_QUERY_LIMIT)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub events: u64,
    pub raw_bytes: u64,
    /// Batches exported since the engine was opened.
    pub batches_exported: u64,
    pub oldest_unix_nano: Option<u64>,
    pub newest_unix_nano: Option<u64>,
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to encode stored event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("storage engine is closed")]
    Closed,
}

#[async_trait]
pub trait StorageEngine: Send + Sync + Debug {
    /// Stores every event of `batch`; returns how many were stored.
    async fn export_logs(&self, batch: Batch) -> Result<usize, StorageError>;

    /// Matching events, oldest first, keeping only the newest `limit`.
    async fn query(&self, query: &LogQuery) -> Result<Vec<StoredEvent>, StorageError>;

    async fn stats(&self) -> Result<StorageStats, StorageError>;

    /// Flushes and releases the engine. Later calls fail with
    /// [`StorageError::Closed`].
    async fn close(&self) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageConfig {
    /// Directory of the file engine. `None` keeps everything in memory.
    pub data_dir: Option<PathBuf>,
}

/// Opens the engine selected by `config`.
///
/// # Errors
///
/// Whatever the file engine hits while creating or reloading its directory.
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn StorageEngine>, StorageError> {
    match &config.data_dir {
        Some(dir) => Ok(Arc::new(FileStorage::open(dir).await?)),
        None => Ok(Arc::new(MemoryStorage::default())),
    }
}

/// Timestamp-ordered event index shared by the engines.
#[derive(Debug, Default)]
pub(crate) struct EventIndex {
    events: Vec<StoredEvent>,
    raw_bytes: u64,
    batches_exported: u64,
}

impl EventIndex {
    pub(crate) fn insert(&mut self, stored: StoredEvent) {
        let at = self
            .events
            .partition_point(|existing| existing.timestamp() <= stored.timestamp());
        self.raw_bytes += stored.event.size_bytes() as u64;
        self.events.insert(at, stored);
    }

    pub(crate) fn record_batch(&mut self) {
        self.batches_exported += 1;
    }

    pub(crate) fn query(&self, query: &LogQuery) -> Vec<StoredEvent> {
        let limit = query.effective_limit();
        let mut newest_first: Vec<StoredEvent> = self
            .events
            .iter()
            .rev()
            .filter(|stored| query.matches(stored))
            .take(limit)
            .cloned()
            .collect();
        newest_first.reverse();
        newest_first
    }

    pub(crate) fn stats(&self) -> StorageStats {
        StorageStats {
            events: self.events.len() as u64,
            raw_bytes: self.raw_bytes,
            batches_exported: self.batches_exported,
            oldest_unix_nano: self.events.first().map(StoredEvent::timestamp),
            newest_unix_nano: self.events.last().map(StoredEvent::timestamp),
        }
    }
}
