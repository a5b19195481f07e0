// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log events and the batches they travel in.
//!
//! A [`LogEvent`] is immutable once created. A [`Batch`] is formed by the
//! batcher and never split afterwards; it is the unit the sink transmits and
//! the receiver acknowledges.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// JSON framing around one event in a serialized batch: field names, the
/// capture timestamp at its widest and the separating comma.
const EVENT_FRAMING_BYTES: usize = 80;

/// One log record as read by the producer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEvent {
    #[serde(with = "raw_base64")]
    raw: Bytes,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    structured: Option<serde_json::Value>,
    captured_at_unix_nano: u64,
}

impl LogEvent {
    /// Captures `raw` now, without a structured view.
    #[must_use]
    pub fn new(raw: impl Into<Bytes>) -> Self {
        Self::captured_at(raw, SystemTime::now())
    }

    #[must_use]
    pub fn captured_at(raw: impl Into<Bytes>, at: SystemTime) -> Self {
        Self {
            raw: raw.into(),
            structured: None,
            captured_at_unix_nano: unix_nanos(at),
        }
    }

    /// Captures `raw` now and attaches the structured view if the bytes are a
    /// JSON object.
    #[must_use]
    pub fn decode(raw: impl Into<Bytes>) -> Self {
        let raw = raw.into();
        let structured = match raw.iter().find(|b| !b.is_ascii_whitespace()) {
            Some(b'{') => serde_json::from_slice::<serde_json::Value>(&raw)
                .ok()
                .filter(serde_json::Value::is_object),
            _ => None,
        };
        Self {
            raw,
            structured,
            captured_at_unix_nano: unix_nanos(SystemTime::now()),
        }
    }

    #[must_use]
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// Lossy UTF-8 view of the raw bytes.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }

    #[must_use]
    pub fn structured(&self) -> Option<&serde_json::Value> {
        self.structured.as_ref()
    }

    #[must_use]
    pub fn captured_at_unix_nano(&self) -> u64 {
        self.captured_at_unix_nano
    }

    #[must_use]
    pub fn captured_at_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(self.captured_at_unix_nano)
    }

    /// Length of the raw bytes.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.raw.len()
    }

    /// Upper bound on the bytes this event adds to a serialized batch. This
    /// is what counts against a batch's byte budget.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let structured = self
            .structured
            .as_ref()
            .and_then(|value| serde_json::to_vec(value).ok())
            .map_or(0, |json| json.len());
        self.raw.len().div_ceil(3) * 4 + structured + EVENT_FRAMING_BYTES
    }
}

/// Where the events of a batch entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTag {
    /// Read on this host by an agent process.
    #[default]
    Local,
    /// Submitted to the owner's ingest endpoint by a non-agent client.
    Api,
}

impl std::fmt::Display for SourceTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Local => write!(f, "local"),
            Self::Api => write!(f, "api"),
        }
    }
}

/// The entity producing the logs.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resource {
    pub service_name: String,
    pub host_name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: BTreeMap<String, String>,
}

/// The instrumentation that captured the logs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    pub name: String,
    pub version: String,
}

impl Default for Scope {
    fn default() -> Self {
        Self {
            name: "logrelay".to_string(),
            version: crate::AGENT_VERSION.to_string(),
        }
    }
}

/// Ordered, bounded group of events shipped as one unit.
///
/// `(stream, sequence)` identifies a batch across resends. Batches submitted
/// by clients that are not agents may leave the stream empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Batch {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    stream: String,
    sequence: u64,
    source: SourceTag,
    resource: Resource,
    scope: Scope,
    events: Vec<LogEvent>,
}

impl Batch {
    #[must_use]
    pub fn new(
        sequence: u64,
        source: SourceTag,
        resource: Resource,
        scope: Scope,
        events: Vec<LogEvent>,
    ) -> Self {
        Self {
            stream: String::new(),
            sequence,
            source,
            resource,
            scope,
            events,
        }
    }

    #[must_use]
    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    /// The batcher this batch was sealed by.
    #[must_use]
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Monotonically increasing within a stream. Receivers use it to spot the
    /// duplicates at-least-once delivery can produce.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    #[must_use]
    pub fn source(&self) -> SourceTag {
        self.source
    }

    #[must_use]
    pub fn resource(&self) -> &Resource {
        &self.resource
    }

    #[must_use]
    pub fn scope(&self) -> &Scope {
        &self.scope
    }

    #[must_use]
    pub fn events(&self) -> &[LogEvent] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<LogEvent> {
        self.events
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.events.iter().map(LogEvent::size_bytes).sum()
    }

    /// Serialized size of everything but the events, with the sequence at
    /// its widest.
    #[must_use]
    pub fn envelope_len(&self) -> usize {
        let envelope = Self {
            stream: self.stream.clone(),
            sequence: u64::MAX,
            source: self.source,
            resource: self.resource.clone(),
            scope: self.scope.clone(),
            events: Vec::new(),
        };
        serde_json::to_vec(&envelope).map_or(0, |json| json.len())
    }

    /// Upper bound on the serialized size of this batch.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        self.envelope_len() + self.events.iter().map(LogEvent::encoded_len).sum::<usize>()
    }
}

fn unix_nanos(at: SystemTime) -> u64 {
    at.duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

mod raw_base64 {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(raw: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(raw))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded)
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
