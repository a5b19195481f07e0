// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! # logrelay
//!
//! Ingestion pipeline and local-endpoint arbitration for a host-local log
//! shipping agent.
//!
//! Every process that starts on a host races to bind one fixed local address.
//! The winner becomes the **owner**: it opens durable storage and serves the
//! ingest, query and stats endpoints on that address. Every other process
//! becomes a **forwarder** and streams its batches to the owner instead of
//! dialing the remote backend itself.
//!
//! ```text
//!   producer ──push──> Batcher ──next_batch──> StreamingSink ──HTTP──> destination
//!                                                   │
//!                                     CredentialProvider (bearer token)
//! ```
//!
//! - [`backoff`]: bounded exponential retry executor
//! - [`credential`]: scoped, expiring ingestion credentials
//! - [`batcher`]: size/time bounded batching with producer back-pressure
//! - [`sink`]: the streaming sink state machine
//! - [`arbiter`]: owner/forwarder election through an exclusive bind
//! - [`server`]: the owner's HTTP endpoints
//! - [`relay`]: the owner's queue of batches bound for the remote backend
//! - [`storage`]: the owner's storage engines
//! - [`shutdown`]: bounded drain on shutdown
//! - [`agent`]: single dispatch point wiring a process into its role

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod agent;
pub mod arbiter;
pub mod backoff;
pub mod batcher;
pub mod config;
pub mod constants;
pub mod credential;
pub mod error;
pub mod event;
pub mod http_utils;
pub mod logger;
pub mod relay;
pub mod server;
pub mod shutdown;
pub mod sink;
pub mod storage;
pub mod transport;

/// Version reported by the owner's health endpoint.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
