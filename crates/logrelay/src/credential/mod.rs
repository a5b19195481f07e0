// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scoped, expiring ingestion credentials.
//!
//! The sink only sees the [`CredentialProvider`] seam. [`CredentialManager`]
//! implements it by caching one credential, reloading it from a
//! [`CredentialStore`] and minting a new one through a [`CredentialMinter`]
//! when the cached one is missing, about to expire or was rejected.
//! [`StaticCredential`] serves a fixed token for local-only setups.
//!
//! Callers get `Arc<IngestionCredential>` snapshots; the cache itself is never
//! handed out.

pub mod minter;
pub mod store;

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub use minter::{HttpCredentialMinter, SessionProvider, StaticSession};
pub use store::{CredentialStore, FileCredentialStore, MemoryCredentialStore};

use crate::constants;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngestRole {
    Ingestor,
}

/// What a credential grants access to. Credentials are environment wide.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CredentialScope {
    pub environment_id: String,
}

impl CredentialScope {
    #[must_use]
    pub fn new(environment_id: impl Into<String>) -> Self {
        Self {
            environment_id: environment_id.into(),
        }
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionCredential {
    token: String,
    /// `None` for tokens that never expire.
    expires_at: Option<SystemTime>,
    scope: CredentialScope,
    roles: Vec<IngestRole>,
}

impl IngestionCredential {
    /// An ingestor-only credential valid until `expires_at`.
    #[must_use]
    pub fn new(token: impl Into<String>, expires_at: SystemTime, scope: CredentialScope) -> Self {
        Self {
            token: token.into(),
            expires_at: Some(expires_at),
            scope,
            roles: vec![IngestRole::Ingestor],
        }
    }

    #[must_use]
    pub fn non_expiring(token: impl Into<String>, scope: CredentialScope) -> Self {
        Self {
            token: token.into(),
            expires_at: None,
            scope,
            roles: vec![IngestRole::Ingestor],
        }
    }

    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    #[must_use]
    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    #[must_use]
    pub fn scope(&self) -> &CredentialScope {
        &self.scope
    }

    #[must_use]
    pub fn roles(&self) -> &[IngestRole] {
        &self.roles
    }

    /// True if the credential is still valid `skew` after `now`.
    #[must_use]
    pub fn is_valid_at(&self, now: SystemTime, skew: Duration) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => now
                .checked_add(skew)
                .is_some_and(|horizon| expires_at > horizon),
        }
    }
}

impl Debug for IngestionCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestionCredential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .field("roles", &self.roles)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CredentialError {
    /// The session proof is missing or was refused. Retrying with the same
    /// session will not help; the user has to authenticate again.
    #[error("unauthenticated: {0}")]
    Unauthenticated(String),
    #[error("transient credential failure: {0}")]
    Transient(String),
    #[error("credential request rejected: {0}")]
    Rejected(String),
    #[error("credential store failure: {0}")]
    Persist(String),
}

impl CredentialError {
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Source of the bearer credential attached to every transmitted batch.
#[async_trait]
pub trait CredentialProvider: Send + Sync + Debug {
    /// Returns a credential that is not expired.
    async fn ensure_credential(&self) -> Result<Arc<IngestionCredential>, CredentialError>;

    /// Reports that the destination refused `rejected`. The next
    /// `ensure_credential` must not hand it out again.
    async fn invalidate(&self, rejected: &IngestionCredential);
}

/// Mints new credentials from the control plane.
#[async_trait]
pub trait CredentialMinter: Send + Sync + Debug {
    async fn mint(
        &self,
        scope: &CredentialScope,
        ttl: Duration,
    ) -> Result<IngestionCredential, CredentialError>;
}

/// A fixed token, handed out as is.
#[derive(Debug, Clone)]
pub struct StaticCredential {
    credential: Arc<IngestionCredential>,
}

impl StaticCredential {
    #[must_use]
    pub fn new(token: impl Into<String>, scope: CredentialScope) -> Self {
        Self {
            credential: Arc::new(IngestionCredential::non_expiring(token, scope)),
        }
    }
}

#[async_trait]
impl CredentialProvider for StaticCredential {
    async fn ensure_credential(&self) -> Result<Arc<IngestionCredential>, CredentialError> {
        Ok(Arc::clone(&self.credential))
    }

    async fn invalidate(&self, _rejected: &IngestionCredential) {
        debug!("CREDENTIAL | Static credential rejected; it cannot be refreshed");
    }
}

#[derive(Debug, Clone)]
pub struct CredentialManagerConfig {
    pub scope: CredentialScope,
    /// Lifetime requested for minted credentials.
    pub ttl: Duration,
    /// A credential expiring within this window is treated as expired.
    pub refresh_skew: Duration,
}

impl CredentialManagerConfig {
    #[must_use]
    pub fn new(scope: CredentialScope) -> Self {
        Self {
            scope,
            ttl: constants::DEFAULT_CREDENTIAL_TTL,
            refresh_skew: constants::DEFAULT_CREDENTIAL_REFRESH_SKEW,
        }
    }
}

/// Caches one credential and keeps it valid.
#[derive(Debug)]
pub struct CredentialManager {
    config: CredentialManagerConfig,
    minter: Arc<dyn CredentialMinter>,
    store: Arc<dyn CredentialStore>,
    cached: Mutex<Option<Arc<IngestionCredential>>>,
}

impl CredentialManager {
    #[must_use]
    pub fn new(
        config: CredentialManagerConfig,
        minter: Arc<dyn CredentialMinter>,
        store: Arc<dyn CredentialStore>,
    ) -> Self {
        Self {
            config,
            minter,
            store,
            cached: Mutex::new(None),
        }
    }

    fn usable(&self, credential: &IngestionCredential) -> bool {
        credential.scope() == &self.config.scope
            && credential.is_valid_at(SystemTime::now(), self.config.refresh_skew)
    }

    async fn load_stored(&self) -> Option<IngestionCredential> {
        match self.store.load().await {
            Ok(Some(stored)) if self.usable(&stored) => Some(stored),
            Ok(_) => None,
            Err(err) => {
                warn!("CREDENTIAL | Ignoring unreadable stored credential: {err}");
                None
            }
        }
    }
}

#[async_trait]
impl CredentialProvider for CredentialManager {
    async fn ensure_credential(&self) -> Result<Arc<IngestionCredential>, CredentialError> {
        // Held across the mint so concurrent callers share one request.
        let mut cached = self.cached.lock().await;
        if let Some(credential) = cached.as_ref() {
            if self.usable(credential) {
                return Ok(Arc::clone(credential));
            }
        }

        if let Some(stored) = self.load_stored().await {
            debug!("CREDENTIAL | Reusing stored ingestion credential");
            let stored = Arc::new(stored);
            *cached = Some(Arc::clone(&stored));
            return Ok(stored);
        }

        let minted = self.minter.mint(&self.config.scope, self.config.ttl).await?;
        // A credential that is stale on arrival would be minted again on
        // every call.
        if !self.usable(&minted) {
            warn!(
                "CREDENTIAL | Control plane returned a credential expiring within the {:?} refresh window",
                self.config.refresh_skew
            );
            return Err(CredentialError::Rejected(format!(
                "minted credential expires within the {:?} refresh window",
                self.config.refresh_skew
            )));
        }
        debug!(
            "CREDENTIAL | Minted ingestion credential for environment {}",
            self.config.scope.environment_id
        );
        if let Err(err) = self.store.save(&minted).await {
            warn!("CREDENTIAL | Failed to persist ingestion credential: {err}");
        }
        let minted = Arc::new(minted);
        *cached = Some(Arc::clone(&minted));
        Ok(minted)
    }

    async fn invalidate(&self, rejected: &IngestionCredential) {
        let mut cached = self.cached.lock().await;
        if cached.as_ref().is_some_and(|c| c.token() == rejected.token()) {
            *cached = None;
        }
        match self.store.load().await {
            Ok(Some(stored)) if stored.token() == rejected.token() => {
                if let Err(err) = self.store.clear().await {
                    warn!("CREDENTIAL | Failed to clear rejected credential: {err}");
                }
            }
            _ => {}
        }
        debug!("CREDENTIAL | Ingestion credential invalidated");
    }
}
