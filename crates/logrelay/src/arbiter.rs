// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Owner/forwarder election.
//!
//! Holding the bind on the fixed local address *is* ownership: the operating
//! system guarantees a single holder per host and releases the address when
//! the holder exits, however it exits.
//!
//! When the bind fails with `AddrInUse` the address is probed with a plain TCP
//! connect. A live owner answers and the caller becomes a forwarder right
//! away. Nobody answering means the previous owner is on its way out, so the
//! bind is retried with backoff for a bounded number of attempts before
//! settling for the forwarder role.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::backoff::{retry, AttemptError, Backoff, RetryError};
use crate::constants;

/// What this process is on the host.
#[derive(Debug)]
pub enum Role {
    /// Holds the bind. The listener is handed to the owner server.
    Owner {
        listener: TcpListener,
        address: SocketAddr,
    },
    /// Another process holds the bind; stream to it.
    Forwarder { address: SocketAddr },
}

impl Role {
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        match self {
            Self::Owner { address, .. } | Self::Forwarder { address } => *address,
        }
    }

    #[must_use]
    pub fn is_owner(&self) -> bool {
        matches!(self, Self::Owner { .. })
    }

    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Owner { .. } => "owner",
            Self::Forwarder { .. } => "forwarder",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArbitrationError {
    #[error("cannot bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        source: std::io::Error,
    },
    #[error("arbitration cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy)]
pub struct ArbiterConfig {
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub max_attempts: u32,
    pub probe_timeout: Duration,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            backoff_base: constants::BIND_BACKOFF_BASE,
            backoff_cap: constants::BIND_BACKOFF_CAP,
            max_attempts: constants::BIND_MAX_ATTEMPTS,
            probe_timeout: constants::OWNER_PROBE_TIMEOUT,
        }
    }
}

enum BindOutcome {
    Forward,
    Fatal(std::io::Error),
}

/// Binds `address` or finds out who holds it.
///
/// # Errors
///
/// [`ArbitrationError::Bind`] for any bind failure other than the address
/// being in use (permission denied, address not available on this host...),
/// [`ArbitrationError::Cancelled`] if `cancel` fires while retrying.
pub async fn acquire_or_forward(
    cancel: &CancellationToken,
    address: SocketAddr,
    config: &ArbiterConfig,
) -> Result<Role, ArbitrationError> {
    let mut backoff = Backoff::new(config.backoff_base, config.backoff_cap);
    let attempts = AtomicU32::new(0);
    let max_attempts = config.max_attempts.max(1);

    let outcome = retry(cancel, &mut backoff, || {
        let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
        async move {
            match TcpListener::bind(address).await {
                Ok(listener) => Ok(listener),
                Err(err) if err.kind() == ErrorKind::AddrInUse => {
                    if owner_is_alive(address, config.probe_timeout).await {
                        Err(AttemptError::Terminal(BindOutcome::Forward))
                    } else if attempt >= max_attempts {
                        debug!("ARBITER | {address} still held after {attempt} attempts");
                        Err(AttemptError::Terminal(BindOutcome::Forward))
                    } else {
                        debug!("ARBITER | {address} held but not answering, retrying bind");
                        Err(AttemptError::Transient(BindOutcome::Forward))
                    }
                }
                Err(err) => Err(AttemptError::Terminal(BindOutcome::Fatal(err))),
            }
        }
    })
    .await;

    match outcome {
        Ok(listener) => {
            let address = listener.local_addr().unwrap_or(address);
            info!("ARBITER | Bound {address}, running as owner");
            Ok(Role::Owner { listener, address })
        }
        Err(RetryError::Terminal(BindOutcome::Forward)) => {
            info!("ARBITER | {address} is owned by another process, running as forwarder");
            Ok(Role::Forwarder { address })
        }
        Err(RetryError::Terminal(BindOutcome::Fatal(source))) => {
            Err(ArbitrationError::Bind { address, source })
        }
        Err(RetryError::Cancelled) => Err(ArbitrationError::Cancelled),
    }
}

async fn owner_is_alive(address: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(address)).await,
        Ok(Ok(_))
    )
}
