// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process startup and the single dispatch point on [`Role`].
//!
//! ```text
//! ensure credential ──> arbitrate ──┬─ Owner:     storage, server, [relay sink], own sink ─> own listener
//!                                   └─ Forwarder: own sink ─> owner's address
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::arbiter::{self, ArbiterConfig, Role};
use crate::batcher::{self, BatcherConfig, EventProducer};
use crate::config::AgentConfig;
use crate::constants;
use crate::credential::{
    CredentialError, CredentialManager, CredentialManagerConfig, CredentialProvider,
    CredentialScope, CredentialStore, FileCredentialStore, HttpCredentialMinter,
    MemoryCredentialStore, StaticCredential, StaticSession,
};
use crate::error::AgentError;
use crate::event::{Resource, Scope, SourceTag};
use crate::relay;
use crate::server::{self, OwnerServerConfig, OwnerState, ServerStats};
use crate::shutdown::{DrainCoordinator, OwnerResources, ShutdownReport};
use crate::sink::{self, IngestFailureListener, SinkConfig, SinkHandle, SinkState, SinkStatsSnapshot};
use crate::storage::{self, StorageConfig, StorageStats};
use crate::transport::{Destination, TransportConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentRole {
    Owner,
    Forwarder,
}

impl AgentRole {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Owner => "owner",
            Self::Forwarder => "forwarder",
        }
    }
}

/// A started agent in either role.
#[derive(Debug)]
pub struct RunningAgent {
    role: AgentRole,
    address: SocketAddr,
    producer: EventProducer,
    sink: SinkHandle,
    owner: Option<OwnerResources>,
    coordinator: DrainCoordinator,
}

impl RunningAgent {
    #[must_use]
    pub fn role(&self) -> AgentRole {
        self.role
    }

    /// The host-local address, held by this process when it is the owner.
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    /// Producer for this process' own events.
    #[must_use]
    pub fn producer(&self) -> EventProducer {
        self.producer.clone()
    }

    #[must_use]
    pub fn sink_state(&self) -> SinkState {
        self.sink.state()
    }

    #[must_use]
    pub fn sink_stats(&self) -> SinkStatsSnapshot {
        self.sink.stats()
    }

    #[must_use]
    pub fn relay_stats(&self) -> Option<SinkStatsSnapshot> {
        self.owner
            .as_ref()
            .and_then(|owner| owner.relay.as_ref())
            .map(SinkHandle::stats)
    }

    #[must_use]
    pub fn server_stats(&self) -> Option<ServerStats> {
        self.owner.as_ref().map(|owner| owner.server.stats())
    }

    /// Owner only.
    pub async fn storage_stats(&self) -> Option<Result<StorageStats, storage::StorageError>> {
        match &self.owner {
            Some(owner) => Some(owner.storage.stats().await),
            None => None,
        }
    }

    /// Drains and releases everything this process holds.
    ///
    /// Producers handed out by [`RunningAgent::producer`] should be dropped
    /// first; events they push after this point are not delivered.
    pub async fn shutdown(self) -> ShutdownReport {
        let Self {
            role,
            producer,
            sink,
            owner,
            coordinator,
            ..
        } = self;
        drop(producer);
        info!(
            "Shutting down {}, drain deadline {:?}",
            role.name(),
            coordinator.drain_deadline()
        );
        coordinator.shutdown(sink, owner).await
    }
}

/// Starts the agent.
///
/// Cancelling `cancel` makes the sinks start draining on their own; call
/// [`RunningAgent::shutdown`] to wait for them with a deadline and release
/// the owner's listener and storage.
///
/// # Errors
///
/// - [`AgentError::Config`] if `config` fails [`AgentConfig::validate`].
/// - [`AgentError::Unauthenticated`] if there is no valid session to mint an
///   ingestion credential with.
/// - [`AgentError::Arbitration`] if the local address cannot be bound for a
///   reason other than being in use.
/// - [`AgentError::Storage`] if this process won the bind but storage failed
///   to open. The listener is released before returning.
pub async fn start(
    config: &AgentConfig,
    credentials: Arc<dyn CredentialProvider>,
    listener: Arc<dyn IngestFailureListener>,
    cancel: &CancellationToken,
) -> Result<RunningAgent, AgentError> {
    config.validate()?;
    match credentials.ensure_credential().await {
        Ok(_) => {}
        Err(err @ CredentialError::Unauthenticated(_)) => {
            return Err(AgentError::Unauthenticated(err));
        }
        Err(err) => warn!("No ingestion credential yet, sinks will retry: {err}"),
    }

    let address = config.local_address()?;
    let role = arbiter::acquire_or_forward(cancel, address, &ArbiterConfig::default()).await?;
    info!("Acting as {} on {}", role.name(), role.address());

    match role {
        Role::Owner {
            listener: tcp,
            address,
        } => {
            let storage = match storage::open(&StorageConfig {
                data_dir: config.data_dir.clone(),
            })
            .await
            {
                Ok(storage) => storage,
                Err(source) => {
                    drop(tcp);
                    error!("Storage failed to open, released {address}: {source}");
                    return Err(AgentError::Storage { address, source });
                }
            };

            let (relay_producer, relay) = match &config.remote_url {
                Some(url) => {
                    let destination = Destination::new(url)?;
                    let (producer, source) = relay::channel(relay_capacity(config));
                    // Not tied to `cancel`: the relay keeps draining until the
                    // server has stopped feeding it.
                    let sink = sink::start(
                        &CancellationToken::new(),
                        sink_config(config, "relay"),
                        destination,
                        Arc::clone(&credentials),
                        source,
                        Arc::clone(&listener),
                    )?;
                    (Some(producer), Some(sink))
                }
                None => (None, None),
            };

            let server = server::spawn(
                tcp,
                OwnerState::new(
                    OwnerServerConfig {
                        max_request_content_length: config.max_request_content_length,
                        ..OwnerServerConfig::default()
                    },
                    Arc::clone(&storage),
                    relay_producer,
                ),
            );

            let (producer, source) = batcher::channel(batcher_config(config));
            let sink = sink::start(
                cancel,
                sink_config(config, "local"),
                Destination::from_socket_addr(address),
                credentials,
                source,
                listener,
            )?;

            Ok(RunningAgent {
                role: AgentRole::Owner,
                address,
                producer,
                sink,
                owner: Some(OwnerResources {
                    server,
                    relay,
                    storage,
                }),
                coordinator: DrainCoordinator::new(config.flush_interval()),
            })
        }
        Role::Forwarder { address } => {
            let (producer, source) = batcher::channel(batcher_config(config));
            let sink = sink::start(
                cancel,
                sink_config(config, "forward"),
                Destination::from_socket_addr(address),
                credentials,
                source,
                listener,
            )?;

            Ok(RunningAgent {
                role: AgentRole::Forwarder,
                address,
                producer,
                sink,
                owner: None,
                coordinator: DrainCoordinator::new(config.flush_interval()),
            })
        }
    }
}

/// Builds the credential source `config` asks for, in order of preference:
/// a fixed `ingest_token`, minting through the control plane, or the local
/// token that is enough for a host-local owner.
///
/// # Errors
///
/// [`AgentError::Credential`] if the control-plane client cannot be built.
pub fn credential_provider(config: &AgentConfig) -> Result<Arc<dyn CredentialProvider>, AgentError> {
    if let Some(token) = config.ingest_token.as_deref().filter(|token| !token.is_empty()) {
        let environment = config
            .environment_id
            .as_deref()
            .unwrap_or(constants::LOCAL_CREDENTIAL_SCOPE);
        return Ok(Arc::new(StaticCredential::new(
            token,
            CredentialScope::new(environment),
        )));
    }

    let (Some(control_plane_url), Some(environment_id)) =
        (&config.control_plane_url, &config.environment_id)
    else {
        if config.remote_url.is_some() {
            warn!("remote_url is set without ingest_token or control plane settings, relaying with the local token");
        }
        return Ok(Arc::new(StaticCredential::new(
            constants::LOCAL_INGEST_TOKEN,
            CredentialScope::new(constants::LOCAL_CREDENTIAL_SCOPE),
        )));
    };

    let minter = HttpCredentialMinter::new(
        control_plane_url,
        Arc::new(StaticSession::new(config.session_token.clone())),
        config.request_timeout(),
    )?;
    let store: Arc<dyn CredentialStore> = match &config.state_dir {
        Some(dir) => Arc::new(FileCredentialStore::in_state_dir(dir, environment_id)),
        None => Arc::new(MemoryCredentialStore::default()),
    };
    Ok(Arc::new(CredentialManager::new(
        CredentialManagerConfig::new(CredentialScope::new(environment_id.clone())),
        Arc::new(minter),
        store,
    )))
}

fn batcher_config(config: &AgentConfig) -> BatcherConfig {
    BatcherConfig {
        max_events: config.max_batch_events,
        max_bytes: config.max_batch_bytes,
        flush_interval: config.flush_interval(),
        capacity: config.queue_capacity,
        source: SourceTag::Local,
        resource: Resource {
            service_name: config.service_name.clone(),
            host_name: config.host_name.clone().unwrap_or_default(),
            ..Resource::default()
        },
        scope: Scope::default(),
    }
}

/// Batches the relay queue holds: about as many events as the producer queue.
fn relay_capacity(config: &AgentConfig) -> usize {
    (config.queue_capacity / config.max_batch_events.max(1)).max(1)
}

fn sink_config(config: &AgentConfig, name: &str) -> SinkConfig {
    SinkConfig {
        name: name.to_string(),
        transport: TransportConfig {
            request_timeout: config.request_timeout(),
            compression_level: config.compression_level,
        },
        reconnect_base: config.reconnect_base(),
        reconnect_cap: config.reconnect_cap(),
    }
}
