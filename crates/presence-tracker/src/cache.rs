//! Presence cache with read-time decay, TTL expiry and hit-count eviction.

use crate::reliability::{decayed_reliability, is_trustworthy, origin_reliability, RELIABILITY_HALF_LIFE};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use sync_core::{PresenceOrigin, PresenceRecord, PresenceStatus, UserId};

struct Slot {
    record: PresenceRecord,
    hits: u64,
}

/// The cache half of the tracker. Not a shared type; the worker owns it and
/// the handle reads through snapshots.
pub struct PresenceCache {
    slots: HashMap<UserId, Slot>,
    ttl: Duration,
    max_entries: usize,
}

impl PresenceCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            slots: HashMap::new(),
            ttl,
            max_entries,
        }
    }

    /// Stores a fresh value, replacing any cached one. Hit counts carry
    /// over so a refresh does not reset a record's eviction priority.
    pub fn insert(
        &mut self,
        user_id: UserId,
        status: PresenceStatus,
        last_seen: Option<DateTime<Utc>>,
        origin: PresenceOrigin,
        now: DateTime<Utc>,
    ) -> PresenceRecord {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::seconds(600));
        let record = PresenceRecord {
            user_id,
            status,
            last_seen,
            last_activity: last_seen,
            origin,
            reliability: origin_reliability(origin),
            cached_at: now,
            expires_at: now + ttl,
        };
        let hits = self.slots.get(&user_id).map(|slot| slot.hits).unwrap_or(0);
        self.slots.insert(
            user_id,
            Slot {
                record: record.clone(),
                hits,
            },
        );
        record
    }

    /// Reads a record. While the session is down (`apply_decay`) the
    /// stored reliability decays with age; expired or decayed-out values
    /// are misses and the caller substitutes the offline default. While
    /// connected, push updates keep records fresh, so the stored
    /// reliability is returned as is.
    pub fn get(
        &mut self,
        user_id: UserId,
        now: DateTime<Utc>,
        apply_decay: bool,
    ) -> Option<PresenceRecord> {
        let slot = self.slots.get_mut(&user_id)?;
        if now >= slot.record.expires_at {
            return None;
        }
        let reliability = if apply_decay {
            let age = (now - slot.record.cached_at).to_std().unwrap_or(Duration::ZERO);
            decayed_reliability(slot.record.reliability, age, RELIABILITY_HALF_LIFE)
        } else {
            slot.record.reliability
        };
        if !is_trustworthy(reliability) {
            return None;
        }
        slot.hits += 1;
        let mut record = slot.record.clone();
        record.reliability = reliability;
        Some(record)
    }

    /// Drops expired records, then evicts lowest-hit records down to the
    /// ceiling. Returns how many records were removed.
    pub fn sweep(&mut self, now: DateTime<Utc>) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| now < slot.record.expires_at);

        if self.slots.len() > self.max_entries {
            let excess = self.slots.len() - self.max_entries;
            let mut by_hits: Vec<(UserId, u64)> = self
                .slots
                .iter()
                .map(|(id, slot)| (*id, slot.hits))
                .collect();
            by_hits.sort_by_key(|(_, hits)| *hits);
            for (user_id, _) in by_hits.into_iter().take(excess) {
                self.slots.remove(&user_id);
            }
        }
        before - self.slots.len()
    }

    pub fn remove(&mut self, user_id: UserId) {
        self.slots.remove(&user_id);
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
