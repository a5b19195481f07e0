// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Defaults and protocol constants shared by the pipeline, the owner server
//! and the configuration layer.

use std::time::Duration;

/// Fixed host-local address every process races to bind.
pub const DEFAULT_LOCAL_ADDRESS: &str = "127.0.0.1:7645";

/// Maximum number of events per batch.
pub const DEFAULT_MAX_BATCH_EVENTS: usize = 1000;

/// Maximum serialized size of a batch, before compression (5 MiB).
///
/// An event that would push a non-empty batch past this budget starts the
/// next batch. An event too big for a batch of its own is refused at push.
pub const DEFAULT_MAX_BATCH_BYTES: usize = 5 * 1_024 * 1_024;

/// Events the batcher queues before `push` starts blocking the producer.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Local bind attempts: 20ms doubling up to 1s.
pub const BIND_BACKOFF_BASE: Duration = Duration::from_millis(20);
pub const BIND_BACKOFF_CAP: Duration = Duration::from_secs(1);

/// Bind attempts spent on an address that is held but not answering before
/// settling for the forwarder role.
pub const BIND_MAX_ATTEMPTS: u32 = 8;

/// Time allowed for the connect probe that tells a live owner apart from an
/// exiting one.
pub const OWNER_PROBE_TIMEOUT: Duration = Duration::from_millis(250);

pub const RECONNECT_BACKOFF_BASE: Duration = Duration::from_millis(100);
pub const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(30);

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// zstd level applied to ingest bodies. Zero disables compression.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

/// Largest ingest body the owner accepts (compressed size as sent).
pub const DEFAULT_MAX_REQUEST_CONTENT_LENGTH: usize = 10 * 1_024 * 1_024;

/// Producer streams whose highest stored sequence the owner remembers.
pub const DEFAULT_MAX_TRACKED_STREAMS: usize = 4096;

/// Credentials are refreshed this long before their expiry.
pub const DEFAULT_CREDENTIAL_REFRESH_SKEW: Duration = Duration::from_secs(30);

/// Lifetime requested for newly minted ingestion credentials.
pub const DEFAULT_CREDENTIAL_TTL: Duration = Duration::from_secs(60 * 60);

pub const DEFAULT_QUERY_LIMIT: usize = 100;

pub const HEALTH_ENDPOINT_PATH: &str = "/v1/health";
pub const INGEST_ENDPOINT_PATH: &str = "/v1/ingest";
pub const QUERY_ENDPOINT_PATH: &str = "/v1/query";
pub const STATS_ENDPOINT_PATH: &str = "/v1/stats";

/// Token and scope used when neither a fixed token nor a control plane is
/// configured. The local owner only checks that a bearer is present.
pub const LOCAL_INGEST_TOKEN: &str = "local";
pub const LOCAL_CREDENTIAL_SCOPE: &str = "local";
