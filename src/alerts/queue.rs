//! Alert ingestion queue: dedup + bounded FIFO pending queue.
//!
//! Identity is the alert event id. The dedup cache is a bounded set that is
//! cleared wholesale once it exceeds capacity (not LRU-trimmed); a periodic
//! sweep owned by the presenter also clears it. The pending queue keeps the
//! most recently arrived entries, dropping from the front on overflow.

use std::collections::{HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::protocol::AlertEvent;

/// Default cap on the pending queue.
pub const DEFAULT_MAX_PENDING: usize = 10;

/// Default cap on the dedup cache.
pub const DEFAULT_DEDUP_CAP: usize = 100;

/// A pending alert plus ingestion metadata.
#[derive(Debug, Clone)]
pub struct QueuedAlert {
    pub event: AlertEvent,
    pub first_seen: DateTime<Utc>,
}

/// Result of an enqueue call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Accepted; `dropped_oldest` holds the id of an entry evicted to make
    /// room, if the queue overflowed.
    Queued { dropped_oldest: Option<String> },
    /// Already seen this dedup epoch; ignored.
    Duplicate,
}

pub struct AlertQueue {
    seen: HashSet<String>,
    pending: VecDeque<QueuedAlert>,
    max_pending: usize,
    dedup_cap: usize,
}

impl AlertQueue {
    pub fn new(max_pending: usize, dedup_cap: usize) -> Self {
        Self {
            seen: HashSet::new(),
            pending: VecDeque::new(),
            max_pending: max_pending.max(1),
            dedup_cap: dedup_cap.max(1),
        }
    }

    /// Add a new alert unless its id was already seen this epoch.
    pub fn enqueue(&mut self, event: AlertEvent) -> EnqueueOutcome {
        if self.seen.contains(&event.id) {
            debug!(target: "alerts", alert_id = %event.id, "duplicate alert ignored");
            return EnqueueOutcome::Duplicate;
        }

        // Wholesale clear once over capacity; this starts a new dedup epoch.
        if self.seen.len() >= self.dedup_cap {
            debug!(
                target: "alerts",
                entries = self.seen.len(),
                "dedup cache at capacity, clearing"
            );
            self.seen.clear();
        }
        self.seen.insert(event.id.clone());

        self.pending.push_back(QueuedAlert {
            event,
            first_seen: Utc::now(),
        });

        let mut dropped_oldest = None;
        while self.pending.len() > self.max_pending {
            if let Some(evicted) = self.pending.pop_front() {
                debug!(
                    target: "alerts",
                    alert_id = %evicted.event.id,
                    "pending queue full, dropping oldest"
                );
                dropped_oldest = Some(evicted.event.id);
            }
        }

        EnqueueOutcome::Queued { dropped_oldest }
    }

    /// Remove and return the oldest pending alert (strict FIFO display
    /// order). The presenter only calls this while Idle.
    pub fn promote(&mut self) -> Option<QueuedAlert> {
        self.pending.pop_front()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Pending ids in display order, for diagnostics.
    pub fn pending_ids(&self) -> Vec<String> {
        self.pending.iter().map(|q| q.event.id.clone()).collect()
    }

    pub fn seen_len(&self) -> usize {
        self.seen.len()
    }

    /// Sweep backstop: clear the dedup cache wholesale.
    pub fn clear_seen(&mut self) {
        self.seen.clear();
    }
}
