//! Time- and priority-ordered work queue with leases.
//!
//! Items release in ascending `(urgency_band, not_before)` order, FIFO on
//! `enqueued_at` for fairness. A dequeued item is leased to its worker for a
//! visibility timeout; unacknowledged leases expire and the item becomes
//! eligible again, which is how crashed workers are recovered. At most one
//! item per execution may be leased at a time, so steps of one execution
//! never run concurrently.
//!
//! Reschedules (anchor-date moves) replace the authoritative entry and bump
//! a sequence number; heap entries carrying a stale sequence are dropped
//! lazily when popped.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

/// A unit of schedulable work: one node of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueItem {
    pub execution_id: Uuid,
    pub node_id: Uuid,
    pub attempt_id: Uuid,
    pub urgency_band: u8,
    pub not_before: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

/// An active lease on a queue item.
#[derive(Debug, Clone)]
pub struct LeaseInfo {
    pub item: QueueItem,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct HeapEntry {
    urgency_band: u8,
    not_before: DateTime<Utc>,
    enqueued_at: DateTime<Utc>,
    seq: u64,
    execution_id: Uuid,
    node_id: Uuid,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.urgency_band, self.not_before, self.enqueued_at, self.seq).cmp(&(
            other.urgency_band,
            other.not_before,
            other.enqueued_at,
            other.seq,
        ))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

struct PendingEntry {
    item: QueueItem,
    seq: u64,
}

/// The central coordination point between trigger evaluation and workers.
pub struct WorkQueue {
    heap: Mutex<BinaryHeap<Reverse<HeapEntry>>>,
    pending: DashMap<(Uuid, Uuid), PendingEntry>,
    leases: DashMap<Uuid, LeaseInfo>,
    seq: AtomicU64,
    lease_ttl: Duration,
}

impl WorkQueue {
    pub fn new(lease_ttl: Duration) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            pending: DashMap::new(),
            leases: DashMap::new(),
            seq: AtomicU64::new(0),
            lease_ttl,
        }
    }

    /// Add (or replace) a work item. Replacement is what re-anchoring uses:
    /// the stale heap entry is invalidated by the bumped sequence.
    pub fn enqueue(&self, item: QueueItem) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let entry = HeapEntry {
            urgency_band: item.urgency_band,
            not_before: item.not_before,
            enqueued_at: item.enqueued_at,
            seq,
            execution_id: item.execution_id,
            node_id: item.node_id,
        };
        debug!(
            execution_id = %item.execution_id,
            node_id = %item.node_id,
            band = item.urgency_band,
            not_before = %item.not_before,
            "Enqueued work item"
        );
        self.pending
            .insert((item.execution_id, item.node_id), PendingEntry { item, seq });
        self.heap.lock().push(Reverse(entry));
        metrics::counter!("scheduler.enqueued").increment(1);
    }

    /// Lease up to `n` ready items to `worker_id`.
    ///
    /// Skips items whose `not_before` has not elapsed, stale heap entries,
    /// and executions that already hold an active lease; skipped live items
    /// go back on the heap.
    pub fn dequeue(&self, n: usize, worker_id: &str, now: DateTime<Utc>) -> Vec<QueueItem> {
        let mut leased = Vec::new();
        let mut put_back = Vec::new();
        let mut heap = self.heap.lock();

        while leased.len() < n {
            let Reverse(entry) = match heap.pop() {
                Some(entry) => entry,
                None => break,
            };
            let key = (entry.execution_id, entry.node_id);

            let current = match self.pending.get(&key) {
                Some(pending) if pending.seq == entry.seq => pending.item.clone(),
                // Stale (rescheduled or already taken): drop silently.
                _ => continue,
            };

            if current.not_before > now || self.leases.contains_key(&entry.execution_id) {
                put_back.push(Reverse(entry));
                continue;
            }

            self.pending.remove(&key);
            self.leases.insert(
                current.execution_id,
                LeaseInfo {
                    item: current.clone(),
                    worker_id: worker_id.to_string(),
                    expires_at: now + self.lease_ttl,
                },
            );
            leased.push(current);
        }

        for entry in put_back {
            heap.push(entry);
        }

        if !leased.is_empty() {
            metrics::counter!("scheduler.dequeued").increment(leased.len() as u64);
        }
        leased
    }

    /// Acknowledge a completed item, releasing its lease permanently.
    pub fn ack(&self, item: &QueueItem) {
        self.release_lease(item);
        metrics::counter!("scheduler.acked").increment(1);
    }

    /// Negative-acknowledge a failed item. Releases the lease; the retry
    /// manager decides whether the item comes back.
    pub fn nack(&self, item: &QueueItem, reason: &str) {
        debug!(
            execution_id = %item.execution_id,
            node_id = %item.node_id,
            reason,
            "Work item nacked"
        );
        self.release_lease(item);
        metrics::counter!("scheduler.nacked").increment(1);
    }

    /// Drop a leased item without executing it (cancelled execution).
    pub fn discard(&self, item: &QueueItem) {
        self.release_lease(item);
        metrics::counter!("scheduler.discarded").increment(1);
    }

    /// Update `not_before` and band of a still-queued item. Returns false if
    /// the item is no longer queued (already leased or gone).
    pub fn reschedule(
        &self,
        execution_id: Uuid,
        node_id: Uuid,
        not_before: DateTime<Utc>,
        urgency_band: u8,
    ) -> bool {
        let key = (execution_id, node_id);
        let item = match self.pending.get(&key) {
            Some(pending) => QueueItem {
                not_before,
                urgency_band,
                ..pending.item.clone()
            },
            None => return false,
        };
        self.enqueue(item);
        true
    }

    /// Expire overdue leases and requeue their items. Returns how many were
    /// recovered. Called periodically; this is what rescues work from a
    /// crashed worker.
    pub fn tick(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<LeaseInfo> = self
            .leases
            .iter()
            .filter(|lease| lease.expires_at <= now)
            .map(|lease| lease.value().clone())
            .collect();

        for lease in &expired {
            warn!(
                execution_id = %lease.item.execution_id,
                node_id = %lease.item.node_id,
                worker_id = %lease.worker_id,
                "Lease expired, requeueing item"
            );
            self.leases.remove(&lease.item.execution_id);
            self.enqueue(lease.item.clone());
        }

        if !expired.is_empty() {
            metrics::counter!("scheduler.leases_expired").increment(expired.len() as u64);
        }
        expired.len()
    }

    /// Number of queued (unleased) items.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn leased_len(&self) -> usize {
        self.leases.len()
    }

    pub fn lease_for(&self, execution_id: Uuid) -> Option<LeaseInfo> {
        self.leases.get(&execution_id).map(|l| l.clone())
    }

    pub fn is_queued(&self, execution_id: Uuid, node_id: Uuid) -> bool {
        self.pending.contains_key(&(execution_id, node_id))
    }

    fn release_lease(&self, item: &QueueItem) {
        let held = self
            .leases
            .remove_if(&item.execution_id, |_, lease| {
                lease.item.node_id == item.node_id
            })
            .is_some();
        if !held {
            // Lease already expired and was requeued; the late worker's ack
            // is a no-op and the optimistic record version arbitrates.
            debug!(
                execution_id = %item.execution_id,
                node_id = %item.node_id,
                "Release for a lease no longer held"
            );
        }
    }
}
