//! Ring buffer for WS event replay on reconnect.
//!
//! Stores recent broadcast events with monotonic sequence numbers so that
//! reconnecting WS clients can request events they missed via `?since_seq=N`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;

/// Default maximum number of events retained in the replay buffer.
pub const DEFAULT_REPLAY_CAPACITY: usize = 1000;

/// A single buffered event with its sequence number and JSON payload.
#[derive(Debug, Clone)]
pub struct ReplayEntry {
    pub seq: u64,
    pub event: Value,
}

/// Thread-safe ring buffer that stores recent broadcast events.
#[derive(Clone)]
pub struct ReplayBuffer {
    inner: Arc<RwLock<ReplayBufferInner>>,
    seq_counter: Arc<AtomicU64>,
}

struct ReplayBufferInner {
    entries: VecDeque<ReplayEntry>,
    capacity: usize,
}

impl ReplayBuffer {
    /// Create a new replay buffer with the given capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ReplayBufferInner {
                entries: VecDeque::with_capacity(capacity),
                capacity,
            })),
            seq_counter: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Push a new event into the buffer. Returns `(seq, event_with_seq)`.
    /// The event JSON is annotated with a `"seq"` field before storage.
    pub async fn push(&self, mut event: Value) -> anyhow::Result<(u64, Value)> {
        let mut inner = self.inner.write().await;
        let seq = self.seq_counter.fetch_add(1, Ordering::Relaxed) + 1;
        event
            .as_object_mut()
            .ok_or_else(|| anyhow::anyhow!("broadcast event must be a JSON object"))?
            .insert("seq".to_string(), serde_json::json!(seq));

        let entry = ReplayEntry {
            seq,
            event: event.clone(),
        };

        if inner.entries.len() >= inner.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(entry);

        Ok((seq, event))
    }

    /// Retrieve all events with seq > since_seq.
    /// Returns `(events, had_gap)` where `had_gap` is true if the requested
    /// seq is older than the oldest event in the buffer.
    pub async fn replay_since(&self, since_seq: u64) -> (Vec<ReplayEntry>, Option<u64>) {
        let inner = self.inner.read().await;
        let oldest_seq = inner.entries.front().map(|e| e.seq);

        let gap = match oldest_seq {
            Some(oldest) if since_seq < oldest => Some(oldest),
            _ => None,
        };

        let events: Vec<ReplayEntry> = inner
            .entries
            .iter()
            .filter(|e| e.seq > since_seq)
            .cloned()
            .collect();

        (events, gap)
    }

    /// Current sequence counter value (the last assigned seq).
    pub fn current_seq(&self) -> u64 {
        self.seq_counter.load(Ordering::Relaxed)
    }
}
