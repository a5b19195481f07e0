// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use logrelay::config::AgentConfig;
use logrelay::credential::{
    CredentialError, CredentialProvider, CredentialScope, IngestionCredential, StaticCredential,
};
use logrelay::sink::{IngestFailureListener, SinkError};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Records every terminal failure it is told about.
#[derive(Debug, Default)]
pub struct RecordingListener {
    pub failures: Mutex<Vec<SinkError>>,
}

impl RecordingListener {
    pub fn count(&self) -> usize {
        self.failures.lock().unwrap().len()
    }
}

impl IngestFailureListener for RecordingListener {
    fn on_terminal_failure(&self, error: &SinkError) {
        self.failures.lock().unwrap().push(error.clone());
    }
}

/// Hands out `token-1`, and `token-N+1` after each invalidation.
#[derive(Debug, Default)]
pub struct RotatingCredentials {
    generation: AtomicUsize,
    pub invalidations: AtomicUsize,
}

#[async_trait]
impl CredentialProvider for RotatingCredentials {
    async fn ensure_credential(&self) -> Result<Arc<IngestionCredential>, CredentialError> {
        let generation = self.generation.load(Ordering::SeqCst) + 1;
        Ok(Arc::new(IngestionCredential::non_expiring(
            format!("token-{generation}"),
            CredentialScope::new("env-test"),
        )))
    }

    async fn invalidate(&self, _rejected: &IngestionCredential) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn static_credentials() -> Arc<dyn CredentialProvider> {
    Arc::new(StaticCredential::new("local", CredentialScope::new("local")))
}

/// A loopback address nothing listens on right now.
pub fn free_address() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}

pub fn agent_config(local_address: &str) -> AgentConfig {
    AgentConfig {
        local_address: local_address.to_string(),
        flush_interval_ms: 50,
        reconnect_base_ms: 10,
        reconnect_cap_ms: 100,
        ..AgentConfig::default()
    }
}

/// Polls `condition` every 10ms for up to five seconds.
pub async fn eventually<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
