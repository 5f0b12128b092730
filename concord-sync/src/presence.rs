//! Ephemeral per-actor presence ("who is looking at what").
//!
//! ## Architecture
//!
//! ```text
//! PresenceClient::set()                       presence:fwd
//!       │                                           │
//!       ▼                                           ▼
//! PresenceStore::set_local()          PresenceStore::apply_remote()
//!       │  (optimistic)                             │  (room + self-echo filter)
//!       ├──────────────► PresenceTimers ◄───────────┤
//!       ▼                (per key/actor deadline)   ▼
//! PresenceOutbox (coalesced, 40ms)          subscribers
//! ```
//!
//! The store never reads the clock itself: every call takes `now` as Unix
//! milliseconds, and the room feeds it wall-clock time.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde_json::Value;

use crate::checkpoint::{decode_stored, unescape, PresenceCheckpoint};

// ───────────────────────────────────────────────────────────────────
// Configuration
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    /// TTL used by `set` when none is given.
    pub default_ttl: Duration,
    /// Entries expiring further out than this get no timer; they are still
    /// filtered out on read once stale.
    pub expiry_horizon: Duration,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            default_ttl: Duration::from_secs(60),
            expiry_horizon: Duration::from_secs(12 * 60 * 60),
        }
    }
}

// ───────────────────────────────────────────────────────────────────
// Entries and wire updates
// ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct PresenceEntry {
    pub actor: String,
    pub value: Value,
    /// Unix milliseconds.
    pub expires_at: u64,
}

impl PresenceEntry {
    pub fn is_live(&self, now: u64) -> bool {
        now < self.expires_at
    }
}

/// Outbound presence write, ready for a `presence:cmd` envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct PresenceUpdate {
    pub key: String,
    pub value: Value,
    /// Unix seconds.
    pub exp_at: u64,
}

/// Inbound presence write from another actor.
#[derive(Debug, Clone, PartialEq)]
pub struct RemotePresence {
    pub from: String,
    pub room: String,
    pub key: String,
    /// JSON text as sent on the wire.
    pub value: String,
    /// Unix seconds.
    pub exp_at: u64,
}

// ───────────────────────────────────────────────────────────────────
// Timers
// ───────────────────────────────────────────────────────────────────

/// Expiry deadlines, one per `(key, actor)`.
///
/// Rescheduling replaces the previous deadline, so a refreshed entry is
/// never evicted by its stale timer.
#[derive(Debug, Default)]
pub struct PresenceTimers {
    deadlines: HashMap<(String, String), u64>,
}

impl PresenceTimers {
    pub fn schedule(&mut self, key: &str, actor: &str, at: u64) {
        self.deadlines
            .insert((key.to_string(), actor.to_string()), at);
    }

    pub fn cancel(&mut self, key: &str, actor: &str) {
        self.deadlines.remove(&(key.to_string(), actor.to_string()));
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<u64> {
        self.deadlines.values().copied().min()
    }

    /// Remove and return every timer due at `now`.
    pub fn take_due(&mut self, now: u64) -> Vec<(String, String)> {
        let due: Vec<(String, String)> = self
            .deadlines
            .iter()
            .filter(|(_, at)| **at <= now)
            .map(|(slot, _)| slot.clone())
            .collect();
        for slot in &due {
            self.deadlines.remove(slot);
        }
        due
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }
}

// ───────────────────────────────────────────────────────────────────
// Store
// ───────────────────────────────────────────────────────────────────

/// Presence state for one room.
#[derive(Debug)]
pub struct PresenceStore {
    room_id: String,
    actor: String,
    config: PresenceConfig,
    /// key → actor → entry
    keys: HashMap<String, HashMap<String, PresenceEntry>>,
    timers: PresenceTimers,
}

impl PresenceStore {
    pub fn new(room_id: impl Into<String>, actor: impl Into<String>, config: PresenceConfig) -> Self {
        Self {
            room_id: room_id.into(),
            actor: actor.into(),
            config,
            keys: HashMap::new(),
            timers: PresenceTimers::default(),
        }
    }

    pub fn actor(&self) -> &str {
        &self.actor
    }

    pub fn config(&self) -> &PresenceConfig {
        &self.config
    }

    fn insert(&mut self, key: &str, entry: PresenceEntry, now: u64) {
        let horizon = now.saturating_add(self.config.expiry_horizon.as_millis() as u64);
        if entry.expires_at <= horizon {
            self.timers.schedule(key, &entry.actor, entry.expires_at);
        } else {
            self.timers.cancel(key, &entry.actor);
        }
        self.keys
            .entry(key.to_string())
            .or_default()
            .insert(entry.actor.clone(), entry);
    }

    /// Optimistically set the local actor's value.
    ///
    /// Returns the update to send. Wire expiry is rounded to whole seconds;
    /// the local entry keeps millisecond precision.
    pub fn set_local(&mut self, key: &str, value: Value, ttl: Duration, now: u64) -> PresenceUpdate {
        let entry = PresenceEntry {
            actor: self.actor.clone(),
            value: value.clone(),
            expires_at: now.saturating_add(ttl.as_millis() as u64),
        };
        self.insert(key, entry, now);
        PresenceUpdate {
            key: key.to_string(),
            value,
            exp_at: (now + 500) / 1000 + ttl.as_secs(),
        }
    }

    /// Apply a forwarded write.
    ///
    /// Returns `false` for another room's traffic, for our own echo and for
    /// values that are already expired.
    pub fn apply_remote(&mut self, update: &RemotePresence, now: u64) -> bool {
        if update.room != self.room_id {
            log::debug!("Dropping presence for room '{}'", update.room);
            return false;
        }
        if update.from == self.actor {
            return false;
        }
        let expires_at = update.exp_at.saturating_mul(1000);
        if expires_at <= now {
            log::debug!("Dropping expired presence '{}' from '{}'", update.key, update.from);
            return false;
        }
        let entry = PresenceEntry {
            actor: update.from.clone(),
            value: unescape(&update.value),
            expires_at,
        };
        self.insert(&update.key, entry, now);
        true
    }

    /// Seed from a bootstrap snapshot. Entries already held locally win.
    ///
    /// Returns the keys that gained entries.
    pub fn merge_snapshot(&mut self, snapshot: &PresenceCheckpoint, now: u64) -> Vec<String> {
        let mut changed = Vec::new();
        for (key, actors) in snapshot {
            let mut touched = false;
            for (actor, record) in actors {
                let known = self
                    .keys
                    .get(key)
                    .is_some_and(|entries| entries.contains_key(actor));
                if known {
                    continue;
                }
                let entry = PresenceEntry {
                    actor: actor.clone(),
                    value: decode_stored(&record.value),
                    expires_at: record.exp_at.saturating_mul(1000),
                };
                self.insert(key, entry, now);
                touched = true;
            }
            if touched {
                changed.push(key.clone());
            }
        }
        changed.sort();
        changed
    }

    /// Drop `actor` from every key. Returns the keys it was present in.
    pub fn remove_actor(&mut self, actor: &str) -> Vec<String> {
        let mut changed = Vec::new();
        for (key, entries) in self.keys.iter_mut() {
            if entries.remove(actor).is_some() {
                self.timers.cancel(key, actor);
                changed.push(key.clone());
            }
        }
        changed.sort();
        changed
    }

    /// Evict entries whose timers fired. Returns `(key, actor)` per eviction.
    pub fn expire_due(&mut self, now: u64) -> Vec<(String, String)> {
        let mut evicted = Vec::new();
        for (key, actor) in self.timers.take_due(now) {
            let Some(entries) = self.keys.get_mut(&key) else {
                continue;
            };
            let expired = entries.get(&actor).is_some_and(|e| !e.is_live(now));
            if expired {
                entries.remove(&actor);
                log::debug!("Presence '{key}' for '{actor}' expired");
                evicted.push((key, actor));
            }
        }
        evicted.sort();
        evicted
    }

    pub fn next_deadline(&self) -> Option<u64> {
        self.timers.next_deadline()
    }

    /// Take over a new actor id, carrying our own entries along.
    pub fn set_actor(&mut self, actor: &str) {
        if actor == self.actor {
            return;
        }
        let old = std::mem::replace(&mut self.actor, actor.to_string());
        let mut moved = Vec::new();
        for (key, entries) in self.keys.iter_mut() {
            if let Some(mut entry) = entries.remove(&old) {
                entry.actor = actor.to_string();
                moved.push((key.clone(), entry));
            }
        }
        for (key, entry) in moved {
            self.timers.cancel(&key, &old);
            self.timers.schedule(&key, actor, entry.expires_at);
            self.keys
                .entry(key)
                .or_default()
                .insert(actor.to_string(), entry);
        }
    }

    /// Every live value for `key`, self included.
    pub fn get_all(&self, key: &str, now: u64) -> BTreeMap<String, Value> {
        self.keys
            .get(key)
            .map(|entries| {
                entries
                    .values()
                    .filter(|e| e.is_live(now))
                    .map(|e| (e.actor.clone(), e.value.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every live value for `key` except our own.
    pub fn get_others(&self, key: &str, now: u64) -> BTreeMap<String, Value> {
        let mut all = self.get_all(key, now);
        all.remove(&self.actor);
        all
    }

    pub fn get_mine(&self, key: &str, now: u64) -> Option<Value> {
        self.keys
            .get(key)
            .and_then(|entries| entries.get(&self.actor))
            .filter(|e| e.is_live(now))
            .map(|e| e.value.clone())
    }

    /// Subscriber view of `key`.
    pub fn view(&self, key: &str, now: u64) -> Value {
        Value::Object(self.get_all(key, now).into_iter().collect())
    }
}
