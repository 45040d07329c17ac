//! Correlation table for request/response round-trips over a channel.
//!
//! Tool confirmations and frontend plugin invocations both send a request
//! carrying a random id, then wait for the matching response. Every entry
//! leaves the table exactly once: on response, on timeout, on channel
//! disconnect, or when the waiter is dropped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::sync::lock;

struct PendingEntry<T> {
    channel_id: String,
    tx: oneshot::Sender<T>,
}

pub struct PendingRequests<T> {
    entries: Arc<Mutex<HashMap<String, PendingEntry<T>>>>,
}

impl<T> Clone for PendingRequests<T> {
    fn clone(&self) -> Self {
        Self {
            entries: Arc::clone(&self.entries),
        }
    }
}

impl<T> Default for PendingRequests<T> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Send + 'static> PendingRequests<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open an entry for `channel_id` under a fresh correlation id.
    pub fn register(&self, channel_id: &str) -> PendingTicket<T> {
        let id = uuid::Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.entries).insert(
            id.clone(),
            PendingEntry {
                channel_id: channel_id.to_string(),
                tx,
            },
        );
        PendingTicket {
            id,
            rx,
            entries: Arc::clone(&self.entries),
        }
    }

    /// Deliver a response arriving on `channel_id`. Returns false for
    /// unknown or already settled ids, and for ids owned by another channel;
    /// those leave the entry in place.
    pub fn resolve(&self, channel_id: &str, id: &str, value: T) -> bool {
        let entry = {
            let mut entries = lock(&self.entries);
            match entries.get(id) {
                Some(entry) if entry.channel_id == channel_id => entries.remove(id),
                _ => None,
            }
        };
        match entry {
            Some(entry) => entry.tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Settle every entry of a channel immediately with `make()`.
    pub fn cancel_channel(&self, channel_id: &str, make: impl Fn() -> T) -> usize {
        let drained: Vec<PendingEntry<T>> = {
            let mut entries = lock(&self.entries);
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.channel_id == channel_id)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| entries.remove(id)).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.tx.send(make());
        }
        count
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ─── Ticket ─────────────────────────────────────────────────────────────────

/// The waiting side of one entry. Dropping it clears the entry.
pub struct PendingTicket<T> {
    id: String,
    rx: oneshot::Receiver<T>,
    entries: Arc<Mutex<HashMap<String, PendingEntry<T>>>>,
}

impl<T> PendingTicket<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the response, or return `default` after `timeout`.
    pub async fn wait(mut self, timeout: Duration, default: T) -> T {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(value)) => value,
            Ok(Err(_)) => default,
            Err(_) => {
                tracing::debug!(request_id = %self.id, timeout_ms = timeout.as_millis() as u64, "pending request timed out");
                default
            }
        }
    }
}

impl<T> Drop for PendingTicket<T> {
    fn drop(&mut self) {
        lock(&self.entries).remove(&self.id);
    }
}
