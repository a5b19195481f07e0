// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scriptable ingest receiver speaking the sink protocol.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Incoming, header, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use logrelay::event::Batch;
use logrelay::transport::{decode_batch, Destination};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;

#[derive(Clone, Debug)]
pub struct ReceivedBatch {
    pub authorization: Option<String>,
    pub status: StatusCode,
    pub batch: Batch,
}

#[derive(Debug)]
struct BackendState {
    received: Mutex<Vec<ReceivedBatch>>,
    /// Statuses for the next ingest requests, in order.
    script: Mutex<VecDeque<StatusCode>>,
    /// Status once the script runs out.
    fallback: Mutex<StatusCode>,
    hang: AtomicBool,
    ingest_calls: AtomicUsize,
}

#[derive(Clone, Debug)]
pub struct MockBackend {
    pub addr: SocketAddr,
    state: Arc<BackendState>,
}

impl MockBackend {
    /// Start a mock backend on a random port. Health probes always succeed.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock backend");
        let addr = listener.local_addr().expect("Failed to get local addr");
        let state = Arc::new(BackendState {
            received: Mutex::new(Vec::new()),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(StatusCode::OK),
            hang: AtomicBool::new(false),
            ingest_calls: AtomicUsize::new(0),
        });

        let accept_state = Arc::clone(&state);
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                let io = TokioIo::new(stream);
                let state = Arc::clone(&accept_state);

                tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                        let state = Arc::clone(&state);
                        async move { Ok::<_, hyper::http::Error>(handle(&state, req).await) }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(io, service)
                        .await;
                });
            }
        });

        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn destination(&self) -> Destination {
        Destination::from_socket_addr(self.addr)
    }

    /// Answers the next ingest requests with `statuses`, then with the
    /// fallback.
    pub fn script(&self, statuses: &[u16]) {
        let mut script = self.state.script.lock().unwrap();
        script.extend(
            statuses
                .iter()
                .map(|status| StatusCode::from_u16(*status).unwrap()),
        );
    }

    pub fn respond_always(&self, status: u16) {
        *self.state.fallback.lock().unwrap() = StatusCode::from_u16(status).unwrap();
    }

    /// Ingest requests are read but never answered.
    pub fn hang(&self) {
        self.state.hang.store(true, Ordering::SeqCst);
    }

    pub fn ingest_calls(&self) -> usize {
        self.state.ingest_calls.load(Ordering::SeqCst)
    }

    pub fn received(&self) -> Vec<ReceivedBatch> {
        self.state.received.lock().unwrap().clone()
    }

    /// Batches answered with a 2xx, in arrival order.
    pub fn acknowledged(&self) -> Vec<Batch> {
        self.received()
            .into_iter()
            .filter(|received| received.status.is_success())
            .map(|received| received.batch)
            .collect()
    }

    /// Raw text of every acknowledged event, in arrival order.
    pub fn acknowledged_texts(&self) -> Vec<String> {
        self.acknowledged()
            .iter()
            .flat_map(|batch| batch.events().iter().map(|event| event.text()))
            .collect()
    }
}

async fn handle(state: &BackendState, req: Request<Incoming>) -> Response<Full<Bytes>> {
    match req.uri().path() {
        "/v1/health" => respond(StatusCode::OK, r#"{"status":"ok"}"#),
        "/v1/ingest" => ingest(state, req).await,
        _ => respond(StatusCode::NOT_FOUND, "Not Found"),
    }
}

async fn ingest(state: &BackendState, req: Request<Incoming>) -> Response<Full<Bytes>> {
    state.ingest_calls.fetch_add(1, Ordering::SeqCst);
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let encoding = req
        .headers()
        .get(header::CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let body = req
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();

    if state.hang.load(Ordering::SeqCst) {
        std::future::pending::<()>().await;
    }

    let Ok(batch) = decode_batch(&body, encoding.as_deref(), 64 * 1024 * 1024) else {
        return respond(StatusCode::BAD_REQUEST, "undecodable batch");
    };
    let status = state
        .script
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| *state.fallback.lock().unwrap());
    state.received.lock().unwrap().push(ReceivedBatch {
        authorization,
        status,
        batch,
    });
    respond(status, "")
}

fn respond(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .unwrap()
}
