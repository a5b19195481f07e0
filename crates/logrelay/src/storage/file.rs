// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Append-only JSON-lines engine.
//!
//! Every stored event is one line of `events.jsonl`. The in-memory index is
//! rebuilt from the file on open; a torn last line left by a crash is skipped.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{EventIndex, LogQuery, StorageEngine, StorageError, StorageStats, StoredEvent};
use crate::event::Batch;

const EVENTS_FILE: &str = "events.jsonl";

#[derive(Debug)]
struct Inner {
    index: EventIndex,
    file: File,
}

#[derive(Debug)]
pub struct FileStorage {
    path: PathBuf,
    inner: Mutex<Option<Inner>>,
}

fn io_error(path: &Path, source: std::io::Error) -> StorageError {
    StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl FileStorage {
    /// Opens (creating if needed) the engine in `dir` and reloads its events.
    ///
    /// # Errors
    ///
    /// [`StorageError::Io`] if the directory or file cannot be created or read.
    pub async fn open(dir: &Path) -> Result<Self, StorageError> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|err| io_error(dir, err))?;
        let path = dir.join(EVENTS_FILE);

        let mut index = EventIndex::default();
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => {
                let mut skipped = 0usize;
                for line in contents.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<StoredEvent>(line) {
                        Ok(stored) => index.insert(stored),
                        Err(_) => skipped += 1,
                    }
                }
                if skipped > 0 {
                    warn!("STORAGE | Skipped {skipped} unreadable lines in {}", path.display());
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_error(&path, err)),
        }
        debug!(
            "STORAGE | Reloaded {} events from {}",
            index.stats().events,
            path.display()
        );

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|err| io_error(&path, err))?;

        Ok(Self {
            path,
            inner: Mutex::new(Some(Inner { index, file })),
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StorageEngine for FileStorage {
    async fn export_logs(&self, batch: Batch) -> Result<usize, StorageError> {
        let stored = StoredEvent::from_batch(batch);
        let mut lines = Vec::new();
        for event in &stored {
            serde_json::to_writer(&mut lines, event)?;
            lines.push(b'\n');
        }

        let mut guard = self.inner.lock().await;
        let inner = guard.as_mut().ok_or(StorageError::Closed)?;
        inner
            .file
            .write_all(&lines)
            .await
            .map_err(|err| io_error(&self.path, err))?;
        inner
            .file
            .flush()
            .await
            .map_err(|err| io_error(&self.path, err))?;

        let count = stored.len();
        for event in stored {
            inner.index.insert(event);
        }
        inner.index.record_batch();
        Ok(count)
    }

    async fn query(&self, query: &LogQuery) -> Result<Vec<StoredEvent>, StorageError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(StorageError::Closed)?;
        Ok(inner.index.query(query))
    }

    async fn stats(&self) -> Result<StorageStats, StorageError> {
        let guard = self.inner.lock().await;
        let inner = guard.as_ref().ok_or(StorageError::Closed)?;
        Ok(inner.index.stats())
    }

    async fn close(&self) -> Result<(), StorageError> {
        let Some(mut inner) = self.inner.lock().await.take() else {
            return Ok(());
        };
        inner
            .file
            .flush()
            .await
            .map_err(|err| io_error(&self.path, err))?;
        inner
            .file
            .sync_all()
            .await
            .map_err(|err| io_error(&self.path, err))
    }
}
