//! Hash-chained execution log -- the kernel's tamper-evident record.
//!
//! Every pipeline stage appends one [`ExecutionEvent`]; each event's hash
//! covers its content plus the hash of the previous event in the global
//! chain, so any edit or reordering breaks verification downstream of the
//! change. The log is a bounded in-memory ring: when capacity is exceeded
//! the oldest events are evicted FIFO and an eviction counter lets
//! verification distinguish "truncated" from "corrupt".

use std::collections::VecDeque;
use std::io::Write;
use std::sync::Mutex;

use chrono::Utc;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::types::{EventType, ExecutionEvent};

/// Default ring capacity.
const DEFAULT_CAPACITY: usize = 10_000;

/// Placeholder previous-hash for the first event ever appended.
const GENESIS_HASH: &str = "genesis";

/// Outcome of verifying an event slice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerdict {
    /// Whether every event's content hash and linkage held.
    pub valid: bool,
    /// First event whose hash or linkage failed.
    pub first_invalid_sequence_id: Option<u64>,
    /// Explanation when invalid, or "truncated" when the slice is valid
    /// but its prefix was evicted from the ring.
    pub reason: Option<String>,
}

impl ChainVerdict {
    fn ok() -> Self {
        Self {
            valid: true,
            first_invalid_sequence_id: None,
            reason: None,
        }
    }
}

/// Serialize a JSON value into RFC 8785 canonical form.
///
/// `serde_json::Value` cannot hold NaN or infinities, so canonicalization
/// of a well-formed value cannot fail; the fallback keeps `append`
/// infallible regardless.
pub fn canonical_json(value: &serde_json::Value) -> String {
    serde_jcs::to_string(value).unwrap_or_else(|_| value.to_string())
}

/// SHA-256 hex digest of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute an event's content hash from its hashed fields.
///
/// Covers request id, type, payload, timestamp, correlation id, and the
/// previous hash -- key order is irrelevant because the JSON is
/// canonicalized before hashing.
pub fn compute_event_hash(event: &ExecutionEvent) -> String {
    let content = json!({
        "requestId": event.request_id,
        "type": event.event_type.as_str(),
        "payload": event.payload,
        "timestamp": event.timestamp.to_rfc3339(),
        "correlationId": event.correlation_id,
        "prevHash": event.prev_hash,
    });
    sha256_hex(canonical_json(&content).as_bytes())
}

struct StoreInner {
    ring: VecDeque<ExecutionEvent>,
    next_sequence_id: u64,
    evicted: u64,
    tail_hash: String,
}

/// Append-only, bounded, hash-chained event log.
pub struct EventStore {
    capacity: usize,
    inner: Mutex<StoreInner>,
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("EventStore")
            .field("capacity", &self.capacity)
            .field("len", &inner.ring.len())
            .field("evicted", &inner.evicted)
            .finish()
    }
}

impl Default for EventStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventStore {
    /// Create a store holding at most `capacity` events (minimum 1).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(StoreInner {
                ring: VecDeque::new(),
                next_sequence_id: 0,
                evicted: 0,
                tail_hash: GENESIS_HASH.to_owned(),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Append one event and return its sequence id.
    ///
    /// Never fails for a well-formed event: the previous hash is read from
    /// the global tail under the same lock that writes the new event, so
    /// chain continuity holds under concurrent appenders.
    pub fn append(
        &self,
        request_id: &str,
        event_type: EventType,
        payload: serde_json::Value,
        correlation_id: &str,
    ) -> u64 {
        let mut inner = self.lock();
        let sequence_id = inner.next_sequence_id;
        inner.next_sequence_id = inner.next_sequence_id.saturating_add(1);

        let mut event = ExecutionEvent {
            sequence_id,
            request_id: request_id.to_owned(),
            correlation_id: correlation_id.to_owned(),
            event_type,
            payload,
            timestamp: Utc::now(),
            prev_hash: inner.tail_hash.clone(),
            event_hash: String::new(),
        };
        event.event_hash = compute_event_hash(&event);
        inner.tail_hash = event.event_hash.clone();

        if inner.ring.len() >= self.capacity {
            inner.ring.pop_front();
            inner.evicted = inner.evicted.saturating_add(1);
        }
        trace!(
            sequence_id,
            request_id,
            correlation_id,
            event = %event_type,
            "event appended"
        );
        inner.ring.push_back(event);
        sequence_id
    }

    /// All retained events for a request, in sequence order.
    pub fn get_by_request_id(&self, request_id: &str) -> Vec<ExecutionEvent> {
        self.lock()
            .ring
            .iter()
            .filter(|e| e.request_id == request_id)
            .cloned()
            .collect()
    }

    /// All retained events for a pipeline run, in sequence order.
    pub fn get_by_correlation_id(&self, correlation_id: &str) -> Vec<ExecutionEvent> {
        self.lock()
            .ring
            .iter()
            .filter(|e| e.correlation_id == correlation_id)
            .cloned()
            .collect()
    }

    /// Number of events currently retained.
    pub fn len(&self) -> usize {
        self.lock().ring.len()
    }

    /// Whether the ring is empty.
    pub fn is_empty(&self) -> bool {
        self.lock().ring.is_empty()
    }

    /// How many events have been evicted since startup.
    pub fn evicted_count(&self) -> u64 {
        self.lock().evicted
    }

    /// Verify an event slice: content hashes plus chain continuity.
    ///
    /// Slice-aware: the first event's `prev_hash` is not checked, so a
    /// per-request or per-correlation slice (whose predecessor belongs to
    /// another request) and a truncated ring both verify cleanly.
    pub fn verify_chain(events: &[ExecutionEvent]) -> ChainVerdict {
        let mut prev_hash: Option<&str> = None;
        for event in events {
            let recomputed = compute_event_hash(event);
            if recomputed != event.event_hash {
                return ChainVerdict {
                    valid: false,
                    first_invalid_sequence_id: Some(event.sequence_id),
                    reason: Some("content hash mismatch".to_owned()),
                };
            }
            if let Some(expected) = prev_hash {
                if event.prev_hash != expected {
                    return ChainVerdict {
                        valid: false,
                        first_invalid_sequence_id: Some(event.sequence_id),
                        reason: Some("chain discontinuity".to_owned()),
                    };
                }
            }
            prev_hash = Some(&event.event_hash);
        }
        ChainVerdict::ok()
    }

    /// Verify the full retained log, reporting eviction as truncation.
    pub fn verify_retained(&self) -> ChainVerdict {
        let (events, evicted) = {
            let inner = self.lock();
            (
                inner.ring.iter().cloned().collect::<Vec<_>>(),
                inner.evicted,
            )
        };
        let mut verdict = Self::verify_chain(&events);
        if verdict.valid && evicted > 0 {
            verdict.reason = Some(format!("truncated: {evicted} events evicted"));
        }
        verdict
    }

    /// Write the retained log as JSON lines for operator inspection.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the underlying writer fails.
    pub fn export_jsonl(&self, writer: &mut dyn Write) -> anyhow::Result<()> {
        let events: Vec<ExecutionEvent> = self.lock().ring.iter().cloned().collect();
        for event in events {
            let line = serde_json::to_string(&event)?;
            writeln!(writer, "{line}")?;
        }
        Ok(())
    }
}
