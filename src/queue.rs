use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;
use ulid::Ulid;

use crate::engine::EngineError;
use crate::journal::JournalHandle;
use crate::model::*;

#[derive(Default)]
struct Lane {
    items: VecDeque<WorkItem>,
    /// Listed in `Lanes::ready`.
    queued: bool,
    /// Head item handed to a worker and not yet finished.
    busy: bool,
    /// Head item is waiting out a retry backoff.
    not_before: Option<Ms>,
}

impl Lane {
    fn runnable(&self) -> bool {
        !self.busy && !self.queued && self.not_before.is_none() && !self.items.is_empty()
    }
}

#[derive(Default)]
struct Lanes {
    lanes: HashMap<Ulid, Lane>,
    ready: VecDeque<Ulid>,
    deferred: BTreeSet<(Ms, Ulid)>,
    seq_owner: HashMap<u64, Ulid>,
}

impl Lanes {
    fn mark_ready(&mut self, booking_id: Ulid) -> bool {
        match self.lanes.get_mut(&booking_id) {
            Some(lane) if lane.runnable() => {
                lane.queued = true;
                self.ready.push_back(booking_id);
                true
            }
            _ => false,
        }
    }

    fn depth(&self) -> usize {
        self.seq_owner.len()
    }
}

/// Durable outbox of follow-up work, one FIFO lane per booking.
///
/// Items enter through journaled transitions (the record that commits a
/// transition carries its work), so nothing is lost across a crash. A lane
/// hands out only its head item and only to one worker at a time: work for a
/// booking runs in emission order, work for different bookings in parallel.
pub struct WorkQueue {
    lanes: Mutex<Lanes>,
    next_seq: AtomicU64,
    wakeup: Notify,
    journal: JournalHandle,
}

impl WorkQueue {
    pub fn new(journal: JournalHandle) -> Self {
        Self {
            lanes: Mutex::new(Lanes::default()),
            next_seq: AtomicU64::new(1),
            wakeup: Notify::new(),
            journal,
        }
    }

    fn lanes(&self) -> MutexGuard<'_, Lanes> {
        self.lanes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Build a work item with the next sequence number. Not enqueued until
    /// the record carrying it is committed and applied.
    pub fn item(&self, booking_id: Ulid, kind: WorkKind) -> WorkItem {
        WorkItem {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            booking_id,
            kind,
        }
    }

    /// Enqueue a committed item (live apply or replay).
    pub fn push(&self, item: WorkItem) {
        self.next_seq.fetch_max(item.seq + 1, Ordering::SeqCst);
        let depth = {
            let mut guard = self.lanes();
            let l = &mut *guard;
            if l.seq_owner.insert(item.seq, item.booking_id).is_some() {
                return;
            }
            let booking_id = item.booking_id;
            l.lanes.entry(booking_id).or_default().items.push_back(item);
            l.mark_ready(booking_id);
            l.depth()
        };
        metrics::gauge!(crate::observability::WORK_QUEUE_DEPTH).set(depth as f64);
        self.wakeup.notify_one();
    }

    /// Take the head item of the next runnable lane. The lane stays busy until
    /// `complete`, `defer` or `release`.
    pub fn next(&self, now: Ms) -> Option<WorkItem> {
        let mut guard = self.lanes();
        let l = &mut *guard;

        while let Some(&(at, booking_id)) = l.deferred.first() {
            if at > now {
                break;
            }
            l.deferred.pop_first();
            if let Some(lane) = l.lanes.get_mut(&booking_id)
                && lane.not_before == Some(at)
            {
                lane.not_before = None;
                l.mark_ready(booking_id);
            }
        }

        while let Some(booking_id) = l.ready.pop_front() {
            let Some(lane) = l.lanes.get_mut(&booking_id) else {
                continue;
            };
            lane.queued = false;
            if lane.busy || lane.not_before.is_some() {
                continue;
            }
            if let Some(head) = lane.items.front() {
                lane.busy = true;
                return Some(head.clone());
            }
        }
        None
    }

    /// Durably mark the item done and advance its lane.
    pub async fn complete(&self, item: &WorkItem) -> Result<(), EngineError> {
        {
            let _commit = self.journal.commit_guard().await;
            self.journal
                .append(&Event::WorkCompleted { seq: item.seq })
                .await?;
            self.forget(item.seq);
        }
        self.wakeup.notify_one();
        Ok(())
    }

    /// Drop a finished item without journaling (replay of `WorkCompleted`).
    pub fn forget(&self, seq: u64) {
        let depth = {
            let mut guard = self.lanes();
            let l = &mut *guard;
            let Some(booking_id) = l.seq_owner.remove(&seq) else {
                return;
            };
            if let Some(lane) = l.lanes.get_mut(&booking_id) {
                if let Some(pos) = lane.items.iter().position(|i| i.seq == seq) {
                    lane.items.remove(pos);
                    if pos == 0 {
                        lane.busy = false;
                    }
                }
                if lane.items.is_empty() {
                    l.lanes.remove(&booking_id);
                } else {
                    l.mark_ready(booking_id);
                }
            }
            l.depth()
        };
        metrics::gauge!(crate::observability::WORK_QUEUE_DEPTH).set(depth as f64);
    }

    /// Park the lane's head item until `until`.
    pub fn defer(&self, booking_id: Ulid, until: Ms) {
        let mut guard = self.lanes();
        let l = &mut *guard;
        if let Some(lane) = l.lanes.get_mut(&booking_id) {
            lane.busy = false;
            lane.not_before = Some(until);
            l.deferred.insert((until, booking_id));
        }
    }

    /// Return the head item unfinished so another worker can pick it up.
    pub fn release(&self, booking_id: Ulid) {
        let woke = {
            let mut guard = self.lanes();
            let l = &mut *guard;
            if let Some(lane) = l.lanes.get_mut(&booking_id) {
                lane.busy = false;
            }
            l.mark_ready(booking_id)
        };
        if woke {
            self.wakeup.notify_one();
        }
    }

    /// Resolves when new work may be available.
    pub async fn wait(&self) {
        self.wakeup.notified().await;
    }

    pub fn len(&self) -> usize {
        self.lanes().depth()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Unfinished items in sequence order.
    pub fn pending(&self) -> Vec<WorkItem> {
        let guard = self.lanes();
        let mut items: Vec<WorkItem> = guard
            .lanes
            .values()
            .flat_map(|lane| lane.items.iter().cloned())
            .collect();
        items.sort_by_key(|i| i.seq);
        items
    }

    pub fn pending_for(&self, booking_id: &Ulid) -> Vec<WorkItem> {
        self.lanes()
            .lanes
            .get(booking_id)
            .map(|lane| lane.items.iter().cloned().collect())
            .unwrap_or_default()
    }
}
