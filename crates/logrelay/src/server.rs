// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The owner's HTTP surface on the host-local address.
//!
//! | Method | Path         |                                           |
//! |--------|--------------|-------------------------------------------|
//! | GET    | `/v1/health` | liveness, used by sinks as connect probe  |
//! | POST   | `/v1/ingest` | one batch from a sink (bearer required)   |
//! | POST   | `/v1/query`  | [`LogQuery`] in, stored events out        |
//! | GET    | `/v1/stats`  | storage and server counters               |
//!
//! Each accepted connection is served on its own task. Handlers share
//! nothing but the storage engine, the relay producer, the stream table and
//! atomic counters.
//!
//! Ingest is idempotent per `(stream, sequence)`: a batch at or below the
//! highest sequence already stored for its stream is acknowledged without
//! being stored or relayed again. Batches of one stream are handled one at a
//! time.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{header, http, Method, Request, StatusCode};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::batcher::PushError;
use crate::constants;
use crate::event::Batch;
use crate::http_utils::{
    bearer_token, json_response, log_and_create_http_response, verify_request_content_length,
    HttpResponse,
};
use crate::relay::RelayProducer;
use crate::storage::{LogQuery, StorageEngine, StorageError, StorageStats};
use crate::transport::decode_batch;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("accepting connections failed: {0}")]
    Accept(#[from] io::Error),
    #[error("server task failed: {0}")]
    Task(String),
}

#[derive(Debug, Clone, Copy)]
pub struct OwnerServerConfig {
    /// Largest ingest body accepted on the wire.
    pub max_request_content_length: usize,
    /// Streams whose highest sequence is remembered. The least recently
    /// started stream is forgotten first.
    pub max_tracked_streams: usize,
}

impl Default for OwnerServerConfig {
    fn default() -> Self {
        Self {
            max_request_content_length: constants::DEFAULT_MAX_REQUEST_CONTENT_LENGTH,
            max_tracked_streams: constants::DEFAULT_MAX_TRACKED_STREAMS,
        }
    }
}

/// Highest stored sequence per stream.
#[derive(Debug)]
struct StreamTable {
    capacity: usize,
    inner: Mutex<StreamTableInner>,
}

#[derive(Debug, Default)]
struct StreamTableInner {
    cursors: HashMap<String, Arc<tokio::sync::Mutex<u64>>>,
    /// Insertion order, for eviction.
    order: VecDeque<String>,
}

impl StreamTable {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(StreamTableInner::default()),
        }
    }

    fn cursor(&self, stream: &str) -> Arc<tokio::sync::Mutex<u64>> {
        let mut inner = match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(cursor) = inner.cursors.get(stream) {
            return Arc::clone(cursor);
        }
        while inner.order.len() >= self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.cursors.remove(&oldest);
                }
                None => break,
            }
        }
        let cursor = Arc::new(tokio::sync::Mutex::new(0));
        inner.cursors.insert(stream.to_string(), Arc::clone(&cursor));
        inner.order.push_back(stream.to_string());
        cursor
    }
}

#[derive(Debug, Default)]
struct ServerCounters {
    ingest_requests: AtomicU64,
    batches_ingested: AtomicU64,
    events_ingested: AtomicU64,
    ingest_rejected: AtomicU64,
    duplicates_acknowledged: AtomicU64,
    events_relayed: AtomicU64,
    queries: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct ServerStats {
    pub ingest_requests: u64,
    pub batches_ingested: u64,
    pub events_ingested: u64,
    pub ingest_rejected: u64,
    /// Resent batches answered without storing them again.
    pub duplicates_acknowledged: u64,
    pub events_relayed: u64,
    pub queries: u64,
}

/// Everything the request handlers need.
#[derive(Debug)]
pub struct OwnerState {
    config: OwnerServerConfig,
    storage: Arc<dyn StorageEngine>,
    relay: Option<RelayProducer>,
    streams: StreamTable,
    counters: ServerCounters,
    shutdown: CancellationToken,
}

impl OwnerState {
    /// `relay` receives every newly stored batch when the owner relays
    /// onward to a remote backend.
    #[must_use]
    pub fn new(
        config: OwnerServerConfig,
        storage: Arc<dyn StorageEngine>,
        relay: Option<RelayProducer>,
    ) -> Self {
        Self {
            config,
            storage,
            relay,
            streams: StreamTable::new(config.max_tracked_streams),
            counters: ServerCounters::default(),
            shutdown: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn stats(&self) -> ServerStats {
        let c = &self.counters;
        ServerStats {
            ingest_requests: c.ingest_requests.load(Ordering::Relaxed),
            batches_ingested: c.batches_ingested.load(Ordering::Relaxed),
            events_ingested: c.events_ingested.load(Ordering::Relaxed),
            ingest_rejected: c.ingest_rejected.load(Ordering::Relaxed),
            duplicates_acknowledged: c.duplicates_acknowledged.load(Ordering::Relaxed),
            events_relayed: c.events_relayed.load(Ordering::Relaxed),
            queries: c.queries.load(Ordering::Relaxed),
        }
    }

    fn reject(&self, message: &str, status: StatusCode) -> http::Result<HttpResponse> {
        self.counters.ingest_rejected.fetch_add(1, Ordering::Relaxed);
        log_and_create_http_response(message, status)
    }
}

/// Body of `GET /v1/stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, serde::Deserialize)]
pub struct StatsResponse {
    pub version: String,
    pub storage: StorageStats,
    pub server: ServerStats,
}

/// A running owner server.
#[derive(Debug)]
pub struct OwnerServerHandle {
    address: SocketAddr,
    state: Arc<OwnerState>,
    task: JoinHandle<Result<(), ServerError>>,
}

impl OwnerServerHandle {
    #[must_use]
    pub fn address(&self) -> SocketAddr {
        self.address
    }

    #[must_use]
    pub fn stats(&self) -> ServerStats {
        self.state.stats()
    }

    /// Stops accepting, drops every open connection and releases the
    /// listener.
    ///
    /// # Errors
    ///
    /// The error that stopped the accept loop, if it stopped on its own.
    pub async fn close(self) -> Result<(), ServerError> {
        self.state.shutdown.cancel();
        match self.task.await {
            Ok(result) => result,
            Err(err) => Err(ServerError::Task(err.to_string())),
        }
    }
}

/// Serves the owner endpoints on `listener` until the handle is closed.
pub fn spawn(listener: TcpListener, state: OwnerState) -> OwnerServerHandle {
    let address = listener
        .local_addr()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 0)));
    let state = Arc::new(state);
    let task = tokio::spawn(
        serve_tcp(listener, Arc::clone(&state)).instrument(info_span!("owner", %address)),
    );
    info!("Owner server listening on {address}");
    OwnerServerHandle {
        address,
        state,
        task,
    }
}

async fn serve_tcp(listener: TcpListener, state: Arc<OwnerState>) -> Result<(), ServerError> {
    let shutdown = state.shutdown.clone();
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { endpoint_handler(state, req).await }
    });
    let server = hyper::server::conn::http1::Builder::new();
    let mut joinset = tokio::task::JoinSet::new();

    loop {
        let conn = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            con_res = listener.accept() => match con_res {
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted
                            | io::ErrorKind::ConnectionReset
                            | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    error!("Server error: {e}");
                    joinset.shutdown().await;
                    return Err(e.into());
                }
                Ok((conn, _)) => conn,
            },
            finished = async {
                match joinset.join_next().await {
                    Some(finished) => finished,
                    None => std::future::pending().await,
                }
            } => match finished {
                Err(e) if e.is_panic() => {
                    // Don't kill server on panic - log and continue
                    error!("Connection handler panicked: {:?}", e);
                    continue;
                },
                Ok(()) | Err(_) => continue,
            },
        };
        let conn = hyper_util::rt::TokioIo::new(conn);
        let server = server.clone();
        let service = service.clone();
        joinset.spawn(
            async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    debug!("Connection error: {e}");
                }
            }
            .in_current_span(),
        );
    }

    drop(listener);
    joinset.shutdown().await;
    info!("Owner server stopped");
    Ok(())
}

async fn endpoint_handler(
    state: Arc<OwnerState>,
    req: Request<Incoming>,
) -> http::Result<HttpResponse> {
    match (req.method(), req.uri().path()) {
        (&Method::GET | &Method::HEAD, constants::HEALTH_ENDPOINT_PATH) => json_response(
            &json!({ "status": "ok", "role": "owner", "version": crate::AGENT_VERSION }),
            StatusCode::OK,
        ),
        (&Method::POST, constants::INGEST_ENDPOINT_PATH) => ingest_handler(&state, req).await,
        (&Method::POST | &Method::GET, constants::QUERY_ENDPOINT_PATH) => {
            query_handler(&state, req).await
        }
        (&Method::GET, constants::STATS_ENDPOINT_PATH) => stats_handler(&state).await,
        (
            _,
            constants::HEALTH_ENDPOINT_PATH
            | constants::INGEST_ENDPOINT_PATH
            | constants::QUERY_ENDPOINT_PATH
            | constants::STATS_ENDPOINT_PATH,
        ) => log_and_create_http_response("Method not allowed", StatusCode::METHOD_NOT_ALLOWED),
        _ => {
            let mut not_found = HttpResponse::default();
            *not_found.status_mut() = StatusCode::NOT_FOUND;
            Ok(not_found)
        }
    }
}

async fn read_body(
    req: Request<Incoming>,
    max_content_length: usize,
) -> Result<(http::request::Parts, Bytes), (String, StatusCode)> {
    let (parts, body) = req.into_parts();
    match Limited::new(body, max_content_length).collect().await {
        Ok(collected) => Ok((parts, collected.to_bytes())),
        Err(err) if err.downcast_ref::<LengthLimitError>().is_some() => {
            Err(("Payload too large".to_string(), StatusCode::PAYLOAD_TOO_LARGE))
        }
        Err(err) => Err((format!("Error reading request body: {err}"), StatusCode::BAD_REQUEST)),
    }
}

async fn ingest_handler(state: &OwnerState, req: Request<Incoming>) -> http::Result<HttpResponse> {
    state.counters.ingest_requests.fetch_add(1, Ordering::Relaxed);
    let max = state.config.max_request_content_length;

    if let Some(response) =
        verify_request_content_length(req.headers(), max, "Error processing ingest request")
    {
        state.counters.ingest_rejected.fetch_add(1, Ordering::Relaxed);
        return response;
    }
    if bearer_token(req.headers()).is_none() {
        return state.reject(
            "Error processing ingest request: missing bearer token",
            StatusCode::UNAUTHORIZED,
        );
    }

    let (parts, body) = match read_body(req, max).await {
        Ok(read) => read,
        Err((message, status)) => {
            return state.reject(&format!("Error processing ingest request: {message}"), status)
        }
    };
    let encoding = parts
        .headers
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok());
    let batch = match decode_batch(&body, encoding, max.saturating_mul(8)) {
        Ok(batch) => batch,
        Err(reason) => {
            return state.reject(
                &format!("Error processing ingest request: {reason}"),
                StatusCode::BAD_REQUEST,
            )
        }
    };

    let sequence = batch.sequence();
    let cursor = (!batch.stream().is_empty()).then(|| state.streams.cursor(batch.stream()));
    let mut stored_up_to = match &cursor {
        Some(cursor) => Some(cursor.lock().await),
        None => None,
    };
    if stored_up_to.as_deref().is_some_and(|stored| sequence <= *stored) {
        state
            .counters
            .duplicates_acknowledged
            .fetch_add(1, Ordering::Relaxed);
        debug!(
            "Batch {sequence} of stream {} already stored, acknowledging",
            batch.stream()
        );
        return json_response(
            &json!({ "accepted": 0, "sequence": sequence, "duplicate": true }),
            StatusCode::OK,
        );
    }

    let relayed = state.relay.as_ref().map(|_| batch.clone());
    let accepted = match state.storage.export_logs(batch).await {
        Ok(accepted) => accepted,
        Err(err @ StorageError::Closed) => {
            return log_and_create_http_response(
                &format!("Error storing batch {sequence}: {err}"),
                StatusCode::SERVICE_UNAVAILABLE,
            )
        }
        Err(err) => {
            return log_and_create_http_response(
                &format!("Error storing batch {sequence}: {err}"),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
        }
    };
    if let Some(stored) = stored_up_to.as_deref_mut() {
        *stored = sequence;
    }
    state.counters.batches_ingested.fetch_add(1, Ordering::Relaxed);
    state
        .counters
        .events_ingested
        .fetch_add(accepted as u64, Ordering::Relaxed);

    // Still holding the stream's cursor: its batches enter the relay queue
    // in sequence order.
    if let (Some(relay), Some(batch)) = (state.relay.as_ref(), relayed) {
        relay_batch(state, relay, batch).await;
    }
    drop(stored_up_to);

    json_response(
        &json!({ "accepted": accepted, "sequence": sequence }),
        StatusCode::OK,
    )
}

/// Hands a stored batch to the relay queue, waiting while it is full. A relay
/// failure never fails the request.
async fn relay_batch(state: &OwnerState, relay: &RelayProducer, batch: Batch) {
    let (sequence, events) = (batch.sequence(), batch.len());
    match relay.push(batch, &state.shutdown).await {
        Ok(()) => {
            state
                .counters
                .events_relayed
                .fetch_add(events as u64, Ordering::Relaxed);
        }
        Err(PushError::Cancelled) => {
            warn!("Owner shutting down, batch {sequence} kept locally only");
        }
        Err(err) => warn!("Relay unavailable, batch {sequence} kept locally only: {err}"),
    }
}

async fn query_handler(state: &OwnerState, req: Request<Incoming>) -> http::Result<HttpResponse> {
    state.counters.queries.fetch_add(1, Ordering::Relaxed);
    let body = match read_body(req, state.config.max_request_content_length).await {
        Ok((_, body)) => body,
        Err((message, status)) => {
            return log_and_create_http_response(
                &format!("Error processing query request: {message}"),
                status,
            )
        }
    };
    let query = if body.iter().all(u8::is_ascii_whitespace) {
        LogQuery::default()
    } else {
        match serde_json::from_slice::<LogQuery>(&body) {
            Ok(query) => query,
            Err(err) => {
                return log_and_create_http_response(
                    &format!("Error processing query request: invalid query: {err}"),
                    StatusCode::BAD_REQUEST,
                )
            }
        }
    };

    match state.storage.query(&query).await {
        Ok(events) => json_response(&json!({ "events": events }), StatusCode::OK),
        Err(err) => log_and_create_http_response(
            &format!("Error running query: {err}"),
            StatusCode::SERVICE_UNAVAILABLE,
        ),
    }
}

async fn stats_handler(state: &OwnerState) -> http::Result<HttpResponse> {
    match state.storage.stats().await {
        Ok(storage) => json_response(
            &StatsResponse {
                version: crate::AGENT_VERSION.to_string(),
                storage,
                server: state.stats(),
            },
            StatusCode::OK,
        ),
        Err(err) => log_and_create_http_response(
            &format!("Error reading storage stats: {err}"),
            StatusCode::SERVICE_UNAVAILABLE,
        ),
    }
}
