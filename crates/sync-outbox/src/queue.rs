//! Persistent per-channel FIFO of queued operations.
//!
//! Entries are persisted synchronously at enqueue time, before any delivery
//! attempt, so an operation accepted while offline survives a crash. Replay
//! order is FIFO within a channel; channels are independent, so a failing
//! head only blocks its own channel. Entries that exhaust their attempts
//! are kept, marked failed, until the user retries or the store is cleared.

use crate::entry::{retry_delay, OutboxEntry, OutboxStatus};
use crate::error::{OutboxError, OutboxResult};
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use sync_core::{ChannelId, LocalId, OperationKind, StateStore};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Replay and retry tuning.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    /// Delivery attempts before an entry is marked failed.
    pub max_attempts: u32,
    /// Delay after the first failed attempt; doubles per failure.
    pub retry_base: Duration,
    /// Ceiling on the retry delay.
    pub retry_max: Duration,
    /// How often the replayer sweeps for due entries while connected.
    pub sweep_interval: Duration,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base: Duration::from_secs(2),
            retry_max: Duration::from_secs(60),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

/// Outcome of recording a failed delivery attempt.
#[derive(Debug)]
pub enum FailureOutcome {
    /// The entry stays queued and becomes due again later.
    Retry { next_attempt_at: Instant },
    /// Attempts exhausted; the entry is retained marked failed.
    Failed(OutboxEntry),
}

struct Inner {
    entries: HashMap<LocalId, OutboxEntry>,
    queues: HashMap<ChannelId, VecDeque<LocalId>>,
}

impl Inner {
    fn push(&mut self, entry: OutboxEntry) {
        if entry.status != OutboxStatus::Failed {
            self.queues
                .entry(entry.channel.clone())
                .or_default()
                .push_back(entry.local_id);
        }
        self.entries.insert(entry.local_id, entry);
    }

    fn unqueue(&mut self, local_id: LocalId, channel: &ChannelId) {
        if let Some(queue) = self.queues.get_mut(channel) {
            queue.retain(|id| *id != local_id);
            if queue.is_empty() {
                self.queues.remove(channel);
            }
        }
    }

    fn remove(&mut self, local_id: LocalId) -> Option<OutboxEntry> {
        let entry = self.entries.remove(&local_id)?;
        self.unqueue(local_id, &entry.channel);
        Some(entry)
    }
}

/// The offline outbox queue.
pub struct OutboxQueue {
    store: Arc<dyn StateStore>,
    config: OutboxConfig,
    inner: Mutex<Inner>,
}

impl OutboxQueue {
    /// Loads persisted entries back into memory (crash recovery). Entries
    /// that fail to decode are logged and deleted rather than wedging the
    /// queue forever; entries caught in flight by a crash go back to
    /// pending.
    pub fn recover(store: Arc<dyn StateStore>, config: OutboxConfig) -> OutboxResult<Self> {
        let mut recovered: Vec<OutboxEntry> = Vec::new();
        for (local_id, json) in store.load_outbox_entries()? {
            match serde_json::from_str::<OutboxEntry>(&json) {
                Ok(mut entry) => {
                    match entry.status {
                        OutboxStatus::InFlight => entry.status = OutboxStatus::Pending,
                        // The delete must have raced the crash; finish it.
                        OutboxStatus::Acknowledged => {
                            store.delete_outbox_entry(&local_id)?;
                            continue;
                        }
                        OutboxStatus::Pending | OutboxStatus::Failed => {}
                    }
                    recovered.push(entry);
                }
                Err(e) => {
                    warn!(local_id = %local_id, error = %e, "Dropping corrupt outbox entry");
                    store.delete_outbox_entry(&local_id)?;
                }
            }
        }
        // FIFO order within a channel follows enqueue time.
        recovered.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.local_id.0.cmp(&b.local_id.0))
        });

        let mut inner = Inner {
            entries: HashMap::new(),
            queues: HashMap::new(),
        };
        let count = recovered.len();
        for entry in recovered {
            inner.push(entry);
        }
        if count > 0 {
            info!(count, "Recovered queued operations");
        }

        Ok(Self {
            store,
            config,
            inner: Mutex::new(inner),
        })
    }

    /// Queues an operation. Synchronous: the entry is persisted and
    /// enqueued before this returns, regardless of connection state.
    pub fn enqueue(
        &self,
        kind: OperationKind,
        channel: ChannelId,
        payload: serde_json::Value,
    ) -> OutboxResult<OutboxEntry> {
        let entry = OutboxEntry::new(kind, channel, payload, Utc::now());
        self.persist(&entry)?;
        self.inner.lock().expect("lock poisoned").push(entry.clone());
        debug!(local_id = %entry.local_id, channel = %entry.channel, "Queued operation");
        Ok(entry)
    }

    /// Snapshot of the due pending head of every channel queue. Only heads
    /// are eligible so per-channel ordering is preserved across retries.
    pub fn due_heads(&self, now: Instant) -> Vec<OutboxEntry> {
        let inner = self.inner.lock().expect("lock poisoned");
        let mut heads: Vec<OutboxEntry> = inner
            .queues
            .values()
            .filter_map(|queue| queue.front())
            .filter_map(|id| inner.entries.get(id))
            .filter(|entry| entry.status == OutboxStatus::Pending && entry.is_due(now))
            .cloned()
            .collect();
        heads.sort_by_key(|entry| entry.created_at);
        heads
    }

    /// Marks an entry as handed to the transport and stamps the attempt.
    pub fn mark_in_flight(&self, local_id: LocalId) -> OutboxResult<()> {
        let updated = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let Some(entry) = inner.entries.get_mut(&local_id) else {
                return Err(OutboxError::NotFound(local_id.to_string()));
            };
            entry.status = OutboxStatus::InFlight;
            entry.last_attempt_at = Some(Utc::now());
            entry.clone()
        };
        self.persist(&updated)
    }

    /// Puts an in-flight entry back to pending without charging an attempt.
    /// Used when the connection dies under the entry rather than the server
    /// rejecting it.
    pub fn release(&self, local_id: LocalId) -> OutboxResult<()> {
        let updated = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let Some(entry) = inner.entries.get_mut(&local_id) else {
                return Err(OutboxError::NotFound(local_id.to_string()));
            };
            if entry.status != OutboxStatus::InFlight {
                return Ok(());
            }
            entry.status = OutboxStatus::Pending;
            entry.clone()
        };
        self.persist(&updated)
    }

    /// Removes a delivered entry, in memory and from the store.
    pub fn acknowledge(&self, local_id: LocalId) -> OutboxResult<Option<OutboxEntry>> {
        let removed = self.inner.lock().expect("lock poisoned").remove(local_id);
        if let Some(mut entry) = removed {
            self.store.delete_outbox_entry(&local_id.to_string())?;
            entry.status = OutboxStatus::Acknowledged;
            return Ok(Some(entry));
        }
        Ok(None)
    }

    /// Records a failed attempt. Either defers the entry with exponential
    /// spacing or, once attempts are exhausted, retains it marked failed
    /// and out of the replay queue.
    pub fn record_failure(
        &self,
        local_id: LocalId,
        error: &str,
        now: Instant,
    ) -> OutboxResult<FailureOutcome> {
        let (updated, outcome) = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let Some(entry) = inner.entries.get_mut(&local_id) else {
                return Err(OutboxError::NotFound(local_id.to_string()));
            };
            entry.attempts += 1;
            entry.last_error = Some(error.to_string());
            if entry.attempts >= self.config.max_attempts {
                entry.status = OutboxStatus::Failed;
                entry.next_attempt_at = None;
                let entry = entry.clone();
                inner.unqueue(local_id, &entry.channel);
                warn!(
                    local_id = %local_id,
                    attempts = entry.attempts,
                    error,
                    "Operation failed after exhausting attempts, awaiting user retry"
                );
                (entry.clone(), FailureOutcome::Failed(entry))
            } else {
                entry.status = OutboxStatus::Pending;
                let delay =
                    retry_delay(entry.attempts, self.config.retry_base, self.config.retry_max);
                let next_attempt_at = now + delay;
                entry.next_attempt_at = Some(next_attempt_at);
                debug!(
                    local_id = %local_id,
                    attempts = entry.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    "Deferred failed operation"
                );
                (entry.clone(), FailureOutcome::Retry { next_attempt_at })
            }
        };
        self.persist(&updated)?;
        Ok(outcome)
    }

    /// Requeues a failed entry with a fresh attempt budget. A no-op for
    /// entries that are not failed.
    pub fn retry(&self, local_id: LocalId) -> OutboxResult<OutboxEntry> {
        let updated = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let Some(entry) = inner.entries.get_mut(&local_id) else {
                return Err(OutboxError::NotFound(local_id.to_string()));
            };
            if entry.status != OutboxStatus::Failed {
                return Ok(entry.clone());
            }
            entry.status = OutboxStatus::Pending;
            entry.attempts = 0;
            entry.last_error = None;
            entry.next_attempt_at = None;
            let entry = entry.clone();
            inner
                .queues
                .entry(entry.channel.clone())
                .or_default()
                .push_back(local_id);
            entry
        };
        self.persist(&updated)?;
        info!(local_id = %local_id, channel = %updated.channel, "Requeued failed operation");
        Ok(updated)
    }

    /// Entries that exhausted their attempts, oldest first.
    pub fn failed_entries(&self) -> Vec<OutboxEntry> {
        let inner = self.inner.lock().expect("lock poisoned");
        let mut failed: Vec<OutboxEntry> = inner
            .entries
            .values()
            .filter(|entry| entry.status == OutboxStatus::Failed)
            .cloned()
            .collect();
        failed.sort_by_key(|entry| entry.created_at);
        failed
    }

    /// Total retained entries, failed ones included.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("lock poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued entries for one channel, in replay order.
    pub fn channel_entries(&self, channel: &ChannelId) -> Vec<OutboxEntry> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner
            .queues
            .get(channel)
            .map(|queue| {
                queue
                    .iter()
                    .filter_map(|id| inner.entries.get(id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn persist(&self, entry: &OutboxEntry) -> OutboxResult<()> {
        let json = serde_json::to_string(entry)?;
        self.store
            .put_outbox_entry(&entry.local_id.to_string(), &json)?;
        Ok(())
    }

    pub fn config(&self) -> &OutboxConfig {
        &self.config
    }
}
