// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;

use crate::arbiter::ArbitrationError;
use crate::config::ConfigError;
use crate::credential::CredentialError;
use crate::server::ServerError;
use crate::sink::SinkError;
use crate::storage::StorageError;
use crate::transport::TransmitError;

/// Errors that stop an agent from starting or from shutting down cleanly.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Not signed in, authenticate again: {0}")]
    Unauthenticated(CredentialError),

    #[error("Failed to set up credentials: {0}")]
    Credential(#[from] CredentialError),

    #[error("Endpoint arbitration failed: {0}")]
    Arbitration(#[from] ArbitrationError),

    #[error("Owner storage failed to open, released {address}: {source}")]
    Storage {
        address: SocketAddr,
        source: StorageError,
    },

    #[error("Invalid destination: {0}")]
    Destination(#[from] TransmitError),

    #[error("Failed to start sink: {0}")]
    Sink(#[from] SinkError),

    #[error("Owner server failed: {0}")]
    Server(#[from] ServerError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = AgentError::Storage {
            address: "127.0.0.1:7645".parse().unwrap(),
            source: StorageError::Closed,
        };
        assert_eq!(
            error.to_string(),
            "Owner storage failed to open, released 127.0.0.1:7645: storage engine is closed"
        );
    }

    #[test]
    fn test_unauthenticated_is_distinct() {
        let error = AgentError::Unauthenticated(CredentialError::Unauthenticated(
            "no session token".to_string(),
        ));
        assert!(error.to_string().starts_with("Not signed in"));
    }
}
