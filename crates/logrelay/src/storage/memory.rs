// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{EventIndex, LogQuery, StorageEngine, StorageError, StorageStats, StoredEvent};
use crate::event::Batch;

/// Keeps every event in memory until the process exits.
#[derive(Debug)]
pub struct MemoryStorage {
    inner: RwLock<Option<EventIndex>>,
}

impl MemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Some(EventIndex::default())),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageEngine for MemoryStorage {
    async fn export_logs(&self, batch: Batch) -> Result<usize, StorageError> {
        let mut inner = self.inner.write().await;
        let index = inner.as_mut().ok_or(StorageError::Closed)?;
        let stored = StoredEvent::from_batch(batch);
        let count = stored.len();
        for event in stored {
            index.insert(event);
        }
        index.record_batch();
        Ok(count)
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<StoredEvent>, StorageError> {
        let inner = self.inner.read().await;
        let index = inner.as_ref().ok_or(StorageError::Closed)?;
        Ok(index.query(query))
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let inner = self.inner.read().await;
        let index = inner.as_ref().ok_or(StorageError::Closed)?;
        Ok(index.stats())
    }

    async fn close(&self) -> Result<(), StorageError> {
        self.inner.write().await.take();
        Ok(())
    }
}
