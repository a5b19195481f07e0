// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP transport shared by both sink destinations.
//!
//! The remote backend and the local owner speak the same protocol: a `GET`
//! health probe and one `POST` per batch, JSON encoded and optionally zstd
//! compressed, authenticated with a bearer token. The client keeps a single
//! idle connection per destination so a sink streams over one long-lived
//! connection.

use std::io::{Read, Write};
use std::net::SocketAddr;
use std::time::Duration;

use logrelay_tls::{build_client, ClientSettings};
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE};
use reqwest::StatusCode;
use tracing::debug;
use zstd::stream::read::Decoder;
use zstd::stream::write::Encoder;

use crate::constants;
use crate::credential::IngestionCredential;
use crate::event::Batch;

pub const ZSTD_ENCODING: &str = "zstd";
pub const SEQUENCE_HEADER: &str = "x-logrelay-sequence";

/// Base URL of a receiver, without a trailing slash.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination(String);

impl Destination {
    /// # Errors
    ///
    /// [`TransmitError::Terminal`] unless `url` is an absolute http(s) URL.
    pub fn new(url: &str) -> Result<Self, TransmitError> {
        let parsed = reqwest::Url::parse(url)
            .map_err(|err| TransmitError::Terminal(format!("invalid destination {url}: {err}")))?;
        if !matches!(parsed.scheme(), "http" | "https") || !parsed.has_host() {
            return Err(TransmitError::Terminal(format!(
                "destination {url} must be an http(s) URL"
            )));
        }
        Ok(Self(url.trim_end_matches('/').to_string()))
    }

    /// The owner's ingest endpoint on the host-local address.
    #[must_use]
    pub fn from_socket_addr(address: SocketAddr) -> Self {
        Self(format!("http://{address}"))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{path}", self.0)
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransmitError {
    /// Worth retrying after a backoff: resets, timeouts, overloaded receiver.
    #[error("transient transmission failure: {0}")]
    Transient(String),
    /// The receiver refused the credential.
    #[error("credential rejected by destination: {0}")]
    Unauthenticated(String),
    #[error("destination rejected the batch: {0}")]
    Terminal(String),
}

/// Maps a non-success HTTP status to its error class. `None` for 2xx.
#[must_use]
pub fn classify_status(status: StatusCode, detail: &str) -> Option<TransmitError> {
    if status.is_success() {
        return None;
    }
    let detail = format!("{status}: {detail}");
    Some(match status {
        StatusCode::UNAUTHORIZED => TransmitError::Unauthenticated(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            TransmitError::Transient(detail)
        }
        s if s.is_server_error() => TransmitError::Transient(detail),
        _ => TransmitError::Terminal(detail),
    })
}

fn classify_reqwest_error(err: &reqwest::Error) -> TransmitError {
    if err.is_builder() {
        TransmitError::Terminal(err.to_string())
    } else {
        TransmitError::Transient(err.to_string())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub request_timeout: Duration,
    /// zstd level; zero sends bodies uncompressed.
    pub compression_level: i32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: constants::DEFAULT_REQUEST_TIMEOUT,
            compression_level: constants::DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestClient {
    client: reqwest::Client,
    destination: Destination,
    compression_level: i32,
}

impl IngestClient {
    /// # Errors
    ///
    /// [`TransmitError::Terminal`] if the HTTP client cannot be built.
    pub fn new(destination: Destination, config: TransportConfig) -> Result<Self, TransmitError> {
        let client = build_client(&ClientSettings::streaming(config.request_timeout))
            .map_err(|err| TransmitError::Terminal(format!("building HTTP client: {err}")))?;
        Ok(Self {
            client,
            destination,
            compression_level: config.compression_level,
        })
    }

    #[must_use]
    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    /// Establishes (or re-establishes) the connection.
    ///
    /// Any answer other than an overloaded or failing receiver counts as
    /// reachable.
    ///
    /// # Errors
    ///
    /// [`TransmitError::Transient`] while the destination cannot be reached.
    pub async fn probe(&self) -> Result<(), TransmitError> {
        let response = self
            .client
            .get(self.destination.endpoint(constants::HEALTH_ENDPOINT_PATH))
            .send()
            .await
            .map_err(|err| classify_reqwest_error(&err))?;
        match classify_status(response.status(), "health probe") {
            Some(err @ TransmitError::Transient(_)) => Err(err),
            _ => Ok(()),
        }
    }

    /// Sends one batch. `Ok` means the receiver acknowledged it.
    ///
    /// # Errors
    ///
    /// The classified failure; see [`classify_status`].
    pub async fn send(
        &self,
        batch: &Batch,
        credential: &IngestionCredential,
    ) -> Result<(), TransmitError> {
        let (body, headers) = encode_batch(batch, self.compression_level)?;
        let response = self
            .client
            .post(self.destination.endpoint(constants::INGEST_ENDPOINT_PATH))
            .headers(headers)
            .bearer_auth(credential.token())
            .body(body)
            .send()
            .await
            .map_err(|err| classify_reqwest_error(&err))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let detail = response.text().await.unwrap_or_default();
        match classify_status(status, &detail) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Largest body [`encode_batch`] produces for a batch whose serialized size
/// is at most `max_batch_bytes`, counting zstd's worst case on
/// incompressible input.
#[must_use]
pub fn max_body_len(max_batch_bytes: usize, compression_level: i32) -> usize {
    if compression_level <= 0 {
        return max_batch_bytes;
    }
    max_batch_bytes
        .saturating_add(max_batch_bytes >> 8)
        .saturating_add(ZSTD_BOUND_MARGIN)
}

/// Upper bound of zstd's fixed per-frame overhead on small inputs.
const ZSTD_BOUND_MARGIN: usize = 64;

/// Serializes `batch` and, when `compression_level > 0`, zstd-compresses it.
///
/// # Errors
///
/// [`TransmitError::Terminal`] if the batch cannot be serialized.
pub fn encode_batch(batch: &Batch, compression_level: i32) -> Result<(Vec<u8>, HeaderMap), TransmitError> {
    let json = serde_json::to_vec(batch)
        .map_err(|err| TransmitError::Terminal(format!("serializing batch: {err}")))?;

    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    headers.insert(SEQUENCE_HEADER, HeaderValue::from(batch.sequence()));

    if compression_level <= 0 {
        return Ok((json, headers));
    }
    match compress(&json, compression_level) {
        Ok(compressed) => {
            headers.insert(CONTENT_ENCODING, HeaderValue::from_static(ZSTD_ENCODING));
            Ok((compressed, headers))
        }
        Err(err) => {
            debug!("TRANSPORT | Failed to compress batch, sending it uncompressed: {err}");
            Ok((json, headers))
        }
    }
}

fn compress(data: &[u8], level: i32) -> std::io::Result<Vec<u8>> {
    let mut encoder = Encoder::new(Vec::new(), level)?;
    encoder.write_all(data)?;
    encoder.finish()
}

/// Inverse of [`encode_batch`], used by the owner's ingest endpoint.
///
/// `max_decoded` bounds the decompressed size.
///
/// # Errors
///
/// A human readable reason when the body cannot be decoded.
pub fn decode_batch(
    body: &[u8],
    content_encoding: Option<&str>,
    max_decoded: usize,
) -> Result<Batch, String> {
    let json = match content_encoding.map(str::trim) {
        None | Some("" | "identity") => body.to_vec(),
        Some(encoding) if encoding.eq_ignore_ascii_case(ZSTD_ENCODING) => {
            let decoder = Decoder::new(body).map_err(|err| format!("invalid zstd body: {err}"))?;
            let mut json = Vec::new();
            decoder
                .take(max_decoded as u64 + 1)
                .read_to_end(&mut json)
                .map_err(|err| format!("invalid zstd body: {err}"))?;
            if json.len() > max_decoded {
                return Err(format!("decompressed body exceeds {max_decoded} bytes"));
            }
            json
        }
        Some(other) => return Err(format!("unsupported content encoding {other}")),
    };
    serde_json::from_slice(&json).map_err(|err| format!("invalid batch: {err}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{LogEvent, Resource, Scope, SourceTag};

    fn batch() -> Batch {
        Batch::new(
            9,
            SourceTag::Local,
            Resource::default(),
            Scope::default(),
            vec![LogEvent::new("hello"), LogEvent::new(vec![0u8, 1, 2])],
        )
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(StatusCode::OK, ""), None);
        assert_eq!(classify_status(StatusCode::ACCEPTED, ""), None);
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, ""),
            Some(TransmitError::Unauthenticated(_))
        ));
        for transient in [
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::SERVICE_UNAVAILABLE,
        ] {
            assert!(matches!(
                classify_status(transient, ""),
                Some(TransmitError::Transient(_))
            ));
        }
        for terminal in [
            StatusCode::BAD_REQUEST,
            StatusCode::FORBIDDEN,
            StatusCode::NOT_FOUND,
            StatusCode::PAYLOAD_TOO_LARGE,
        ] {
            assert!(matches!(
                classify_status(terminal, ""),
                Some(TransmitError::Terminal(_))
            ));
        }
    }

    #[test]
    fn test_compressed_body_decodes() {
        let (body, headers) = encode_batch(&batch(), 3).unwrap();
        assert_eq!(headers.get(CONTENT_ENCODING).unwrap(), ZSTD_ENCODING);
        assert_eq!(headers.get(SEQUENCE_HEADER).unwrap(), "9");

        let decoded = decode_batch(&body, Some("zstd"), 1024).unwrap();
        assert_eq!(decoded, batch());
    }

    #[test]
    fn test_max_body_len_covers_incompressible_batches() {
        let noise: Vec<u8> = (0..20_000u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let batch = Batch::new(
            1,
            SourceTag::Local,
            Resource::default(),
            Scope::default(),
            vec![LogEvent::new(noise)],
        );
        let serialized = serde_json::to_vec(&batch).unwrap().len();

        let (compressed, _) = encode_batch(&batch, 19).unwrap();
        assert!(compressed.len() <= max_body_len(serialized, 19));
        assert_eq!(max_body_len(serialized, 0), serialized);
        assert_eq!(max_body_len(usize::MAX, 3), usize::MAX);
    }

    #[test]
    fn test_compression_disabled() {
        let (body, headers) = encode_batch(&batch(), 0).unwrap();
        assert!(headers.get(CONTENT_ENCODING).is_none());
        assert_eq!(decode_batch(&body, None, 1024).unwrap(), batch());
    }

    #[test]
    fn test_decode_rejects_bombs_and_garbage() {
        let (body, _) = encode_batch(&batch(), 3).unwrap();
        assert!(decode_batch(&body, Some("zstd"), 16).is_err());
        assert!(decode_batch(b"not json", None, 1024).is_err());
        assert!(decode_batch(b"{}", Some("br"), 1024).is_err());
    }

    #[test]
    fn test_destination_parsing() {
        assert_eq!(
            Destination::new("https://logs.example.com/").unwrap().endpoint("/v1/ingest"),
            "https://logs.example.com/v1/ingest"
        );
        assert!(Destination::new("ftp://example.com").is_err());
        assert!(Destination::new("not a url").is_err());
        assert_eq!(
            Destination::from_socket_addr("127.0.0.1:7645".parse().unwrap()).as_str(),
            "http://127.0.0.1:7645"
        );
    }
}
