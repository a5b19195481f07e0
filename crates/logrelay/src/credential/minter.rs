// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Control-plane client minting ingestion credentials.
//!
//! `POST {control_plane}/v1/environments/{environment_id}/ingestion-tokens`
//! authenticated with the user's session token. The interactive login that
//! produces that session lives outside this crate and is reached through
//! [`SessionProvider`].

use std::fmt::Debug;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use logrelay_tls::ClientSettings;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use super::{CredentialError, CredentialMinter, CredentialScope, IngestRole, IngestionCredential};

/// Supplies the session proof of the signed-in user.
pub trait SessionProvider: Send + Sync + Debug {
    /// `None` when nobody is signed in.
    fn session_token(&self) -> Option<String>;
}

#[derive(Clone, Default)]
pub struct StaticSession(Option<String>);

impl StaticSession {
    #[must_use]
    pub fn new(token: Option<String>) -> Self {
        Self(token.filter(|t| !t.is_empty()))
    }
}

impl Debug for StaticSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StaticSession({})", if self.0.is_some() { "set" } else { "unset" })
    }
}

impl SessionProvider for StaticSession {
    fn session_token(&self) -> Option<String> {
        self.0.clone()
    }
}

#[derive(Debug, Serialize)]
struct MintRequest {
    roles: Vec<IngestRole>,
    ttl_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct MintResponse {
    token: String,
    /// Unix seconds.
    expires_at: u64,
}

#[derive(Debug, Clone)]
pub struct HttpCredentialMinter {
    client: reqwest::Client,
    control_plane_url: String,
    session: Arc<dyn SessionProvider>,
}

impl HttpCredentialMinter {
    /// # Errors
    ///
    /// [`CredentialError::Rejected`] if the HTTP client cannot be built.
    pub fn new(
        control_plane_url: &str,
        session: Arc<dyn SessionProvider>,
        timeout: Duration,
    ) -> Result<Self, CredentialError> {
        let client = logrelay_tls::build_client(&ClientSettings::request(timeout))
            .map_err(|err| CredentialError::Rejected(format!("building HTTP client: {err}")))?;
        Ok(Self {
            client,
            control_plane_url: control_plane_url.trim_end_matches('/').to_string(),
            session,
        })
    }

    fn endpoint(&self, scope: &CredentialScope) -> String {
        format!(
            "{}/v1/environments/{}/ingestion-tokens",
            self.control_plane_url, scope.environment_id
        )
    }
}

fn classify_status(status: StatusCode, body: &str) -> CredentialError {
    let detail = format!("control plane returned {status}: {body}");
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => CredentialError::Unauthenticated(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            CredentialError::Transient(detail)
        }
        s if s.is_client_error() => CredentialError::Rejected(detail),
        _ => CredentialError::Transient(detail),
    }
}

#[async_trait]
impl CredentialMinter for HttpCredentialMinter {
    async fn mint(
        &self,
        scope: &CredentialScope,
        ttl: Duration,
    ) -> Result<IngestionCredential, CredentialError> {
        let session = self.session.session_token().ok_or_else(|| {
            CredentialError::Unauthenticated("no session token; sign in first".to_string())
        })?;

        let response = self
            .client
            .post(self.endpoint(scope))
            .bearer_auth(session)
            .json(&MintRequest {
                roles: vec![IngestRole::Ingestor],
                ttl_seconds: ttl.as_secs(),
            })
            .send()
            .await
            .map_err(|err| {
                if err.is_builder() {
                    CredentialError::Rejected(err.to_string())
                } else {
                    CredentialError::Transient(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_status(status, &body));
        }

        let minted: MintResponse = response
            .json()
            .await
            .map_err(|err| CredentialError::Transient(format!("decoding mint response: {err}")))?;
        Ok(IngestionCredential::new(
            minted.token,
            UNIX_EPOCH + Duration::from_secs(minted.expires_at),
            scope.clone(),
        ))
    }
}
