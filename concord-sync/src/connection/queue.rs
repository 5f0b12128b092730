//! Outbound buffering.
//!
//! Document commands go through a bounded FIFO that survives disconnects and
//! is drained in order once a link is up. Presence writes are lossy: only the
//! newest value per key is kept and the whole batch is sent at most once per
//! flush interval.

use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

/// The outbound queue refused a command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Outbound queue is full: {queued} of {capacity} slots used, {requested} requested")]
pub struct CapacityError {
    pub capacity: usize,
    pub queued: usize,
    pub requested: usize,
}

/// Bounded FIFO of document commands, in wire-tuple form.
///
/// Entries are only removed once the transport accepted them, so a send that
/// fails halfway leaves the rest queued for the next connection.
#[derive(Debug)]
pub struct OutboundQueue {
    queue: VecDeque<Vec<String>>,
    max_size: usize,
}

impl OutboundQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            queue: VecDeque::with_capacity(max_size.min(1024)),
            max_size,
        }
    }

    /// Check that `n` more commands fit.
    pub fn ensure_capacity(&self, n: usize) -> Result<(), CapacityError> {
        if self.queue.len().saturating_add(n) > self.max_size {
            return Err(CapacityError {
                capacity: self.max_size,
                queued: self.queue.len(),
                requested: n,
            });
        }
        Ok(())
    }

    pub fn enqueue(&mut self, args: Vec<String>) -> Result<(), CapacityError> {
        self.ensure_capacity(1)?;
        self.queue.push_back(args);
        Ok(())
    }

    pub fn front(&self) -> Option<&Vec<String>> {
        self.queue.front()
    }

    pub fn pop_front(&mut self) -> Option<Vec<String>> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

/// A presence write waiting to be sent.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingPresence {
    /// JSON text.
    pub value: String,
    /// Unix seconds.
    pub exp_at: u64,
}

/// Coalescing, rate-limited presence buffer.
#[derive(Debug)]
pub struct PresenceOutbox {
    interval: Duration,
    pending: BTreeMap<String, PendingPresence>,
    last_flush: Option<Instant>,
}

impl PresenceOutbox {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            pending: BTreeMap::new(),
            last_flush: None,
        }
    }

    /// Queue `update` for `key`, replacing anything not yet sent.
    pub fn push(&mut self, key: impl Into<String>, update: PendingPresence) {
        self.pending.insert(key.into(), update);
    }

    /// When the pending batch may go out, if there is one.
    pub fn next_flush_at(&self) -> Option<Instant> {
        if self.pending.is_empty() {
            return None;
        }
        Some(match self.last_flush {
            Some(at) => at + self.interval,
            None => Instant::now(),
        })
    }

    /// Take the batch if the rate limit allows it at `now`.
    pub fn take_due(&mut self, now: Instant) -> Vec<(String, PendingPresence)> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        if let Some(at) = self.last_flush {
            if now < at + self.interval {
                return Vec::new();
            }
        }
        self.last_flush = Some(now);
        std::mem::take(&mut self.pending).into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cmd(n: usize) -> Vec<String> {
        vec!["mput".into(), "d".into(), "m".into(), format!("k{n}"), n.to_string()]
    }

    #[test]
    fn test_fifo_order() {
        let mut q = OutboundQueue::new(10);
        for n in 0..3 {
            q.enqueue(cmd(n)).unwrap();
        }
        assert_eq!(q.pop_front(), Some(cmd(0)));
        assert_eq!(q.front(), Some(&cmd(1)));
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn test_capacity() {
        let mut q = OutboundQueue::new(3);
        for n in 0..3 {
            q.enqueue(cmd(n)).unwrap();
        }
        let err = q.enqueue(cmd(3)).unwrap_err();
        assert_eq!(
            err,
            CapacityError {
                capacity: 3,
                queued: 3,
                requested: 1
            }
        );
        assert_eq!(q.len(), 3);
    }

    #[test]
    fn test_ensure_capacity_for_batches() {
        let mut q = OutboundQueue::new(3);
        q.enqueue(cmd(0)).unwrap();
        assert!(q.ensure_capacity(2).is_ok());
        assert!(q.ensure_capacity(3).is_err());
    }

    fn pending(v: &str) -> PendingPresence {
        PendingPresence {
            value: v.into(),
            exp_at: 100,
        }
    }

    #[test]
    fn test_presence_coalesces_per_key() {
        let mut outbox = PresenceOutbox::new(Duration::from_millis(40));
        outbox.push("cursor", pending("1"));
        outbox.push("cursor", pending("2"));
        outbox.push("status", pending("\"busy\""));

        let batch = outbox.take_due(Instant::now());
        assert_eq!(
            batch,
            vec![
                ("cursor".to_string(), pending("2")),
                ("status".to_string(), pending("\"busy\"")),
            ]
        );
        assert_eq!(outbox.next_flush_at(), None);
    }

    #[test]
    fn test_presence_rate_limit() {
        let mut outbox = PresenceOutbox::new(Duration::from_millis(40));
        let start = Instant::now();

        outbox.push("cursor", pending("1"));
        assert_eq!(outbox.take_due(start).len(), 1);

        outbox.push("cursor", pending("2"));
        assert!(outbox.take_due(start + Duration::from_millis(10)).is_empty());
        assert_eq!(outbox.next_flush_at(), Some(start + Duration::from_millis(40)));
        assert_eq!(outbox.take_due(start + Duration::from_millis(40)).len(), 1);
    }

    #[test]
    fn test_presence_empty_has_no_deadline() {
        let outbox = PresenceOutbox::new(Duration::from_millis(40));
        assert_eq!(outbox.next_flush_at(), None);
    }
}
