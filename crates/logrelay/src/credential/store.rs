// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host-local persistence for the current ingestion credential, so a restarted
//! process does not mint a new one every time.

use std::fmt::Debug;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{CredentialError, IngestionCredential};

#[async_trait]
pub trait CredentialStore: Send + Sync + Debug {
    /// `Ok(None)` when nothing has been stored yet.
    async fn load(&self) -> Result<Option<IngestionCredential>, CredentialError>;
    async fn save(&self, credential: &IngestionCredential) -> Result<(), CredentialError>;
    async fn clear(&self) -> Result<(), CredentialError>;
}

#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    slot: Mutex<Option<IngestionCredential>>,
}

impl MemoryCredentialStore {
    #[must_use]
    pub fn with(credential: IngestionCredential) -> Self {
        Self {
            slot: Mutex::new(Some(credential)),
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn load(&self) -> Result<Option<IngestionCredential>, CredentialError> {
        Ok(self.slot.lock().await.clone())
    }

    async fn save(&self, credential: &IngestionCredential) -> Result<(), CredentialError> {
        *self.slot.lock().await = Some(credential.clone());
        Ok(())
    }

    async fn clear(&self) -> Result<(), CredentialError> {
        *self.slot.lock().await = None;
        Ok(())
    }
}

/// One JSON file per environment, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileCredentialStore {
    path: PathBuf,
}

impl FileCredentialStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<state_dir>/credentials/<environment_id>.json`
    #[must_use]
    pub fn in_state_dir(state_dir: &Path, environment_id: &str) -> Self {
        let file_name: String = environment_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        Self::new(state_dir.join("credentials").join(format!("{file_name}.json")))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn persist_error(context: &str, path: &Path, err: impl std::fmt::Display) -> CredentialError {
    CredentialError::Persist(format!("{context} {}: {err}", path.display()))
}

#[async_trait]
impl CredentialStore for FileCredentialStore {
    async fn load(&self) -> Result<Option<IngestionCredential>, CredentialError> {
        let contents = match tokio::fs::read(&self.path).await {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(persist_error("reading", &self.path, err)),
        };
        serde_json::from_slice(&contents)
            .map(Some)
            .map_err(|err| persist_error("parsing", &self.path, err))
    }

    async fn save(&self, credential: &IngestionCredential) -> Result<(), CredentialError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|err| persist_error("creating", parent, err))?;
        }
        let body = serde_json::to_vec(credential)
            .map_err(|err| persist_error("encoding", &self.path, err))?;

        let temp = self.temp_path();
        let mut options = tokio::fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        options.mode(0o600);
        let mut file = options
            .open(&temp)
            .await
            .map_err(|err| persist_error("opening", &temp, err))?;
        file.write_all(&body)
            .await
            .map_err(|err| persist_error("writing", &temp, err))?;
        file.sync_all()
            .await
            .map_err(|err| persist_error("syncing", &temp, err))?;
        drop(file);

        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|err| persist_error("replacing", &self.path, err))
    }

    async fn clear(&self) -> Result<(), CredentialError> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(persist_error("removing", &self.path, err)),
        }
    }
}
