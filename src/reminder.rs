use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, info};
use ulid::Ulid;

use crate::engine::EngineError;
use crate::journal::JournalHandle;
use crate::model::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled,
    /// A scheduled task for the same key existed and was superseded.
    Replaced,
    /// Same key, same fire time, still scheduled. Nothing written.
    Unchanged,
    /// The reminder was already handed off; it never fires twice.
    AlreadyFired,
}

#[derive(Default)]
struct Tasks {
    by_key: HashMap<String, ReminderTask>,
    by_booking: HashMap<Ulid, Vec<String>>,
    /// Scheduled tasks ordered by fire time.
    due: BTreeSet<(Ms, String)>,
}

impl Tasks {
    fn put(&mut self, task: ReminderTask) {
        if let Some(old) = self.by_key.get(&task.key) {
            self.due.remove(&(old.fire_at, old.key.clone()));
        } else {
            self.by_booking
                .entry(task.booking_id)
                .or_default()
                .push(task.key.clone());
        }
        if task.status == ReminderStatus::Scheduled {
            self.due.insert((task.fire_at, task.key.clone()));
        }
        self.by_key.insert(task.key.clone(), task);
    }

    fn mark(&mut self, keys: &[String], status: ReminderStatus) {
        for key in keys {
            if let Some(task) = self.by_key.get_mut(key) {
                self.due.remove(&(task.fire_at, key.clone()));
                task.status = status;
            }
        }
    }

    fn scheduled_for(&self, booking_id: &Ulid) -> Vec<String> {
        self.by_booking
            .get(booking_id)
            .into_iter()
            .flatten()
            .filter(|k| {
                self.by_key
                    .get(*k)
                    .is_some_and(|t| t.status == ReminderStatus::Scheduled)
            })
            .cloned()
            .collect()
    }
}

/// Owns every `ReminderTask`.
///
/// Mutations are serialized by `mutate` and journaled before they are applied.
/// `drain` journals the fired marks before returning, so a task is handed to
/// exactly one drain call even if the caller dies right after.
pub struct ReminderScheduler {
    tasks: Mutex<Tasks>,
    mutate: tokio::sync::Mutex<()>,
    journal: JournalHandle,
}

impl ReminderScheduler {
    pub fn new(journal: JournalHandle) -> Self {
        Self {
            tasks: Mutex::new(Tasks::default()),
            mutate: tokio::sync::Mutex::new(()),
            journal,
        }
    }

    fn tasks(&self) -> MutexGuard<'_, Tasks> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Schedule the upcoming-consultation reminder for a booking.
    pub async fn schedule(
        &self,
        booking_id: Ulid,
        fire_at: Ms,
        at: Ms,
    ) -> Result<ScheduleOutcome, EngineError> {
        self.schedule_kind(booking_id, ReminderKind::Upcoming, fire_at, at)
            .await
    }

    pub async fn schedule_kind(
        &self,
        booking_id: Ulid,
        kind: ReminderKind,
        fire_at: Ms,
        at: Ms,
    ) -> Result<ScheduleOutcome, EngineError> {
        let _commit = self.journal.commit_guard().await;
        let _mutate = self.mutate.lock().await;

        let key = reminder_key(booking_id, kind);
        let outcome = match self.tasks().by_key.get(&key) {
            Some(t) if t.status == ReminderStatus::Fired => return Ok(ScheduleOutcome::AlreadyFired),
            Some(t) if t.status == ReminderStatus::Scheduled && t.fire_at == fire_at => {
                return Ok(ScheduleOutcome::Unchanged);
            }
            Some(t) if t.status == ReminderStatus::Scheduled => ScheduleOutcome::Replaced,
            _ => ScheduleOutcome::Scheduled,
        };

        let task = ReminderTask {
            booking_id,
            kind,
            fire_at,
            key,
            status: ReminderStatus::Scheduled,
            scheduled_at: at,
        };
        self.journal
            .append(&Event::ReminderScheduled { task: task.clone() })
            .await?;
        self.tasks().put(task);
        debug!("reminder for booking {booking_id} at {fire_at}: {outcome:?}");
        Ok(outcome)
    }

    /// Cancel every still-scheduled reminder of the booking. Returns how many.
    pub async fn cancel(&self, booking_id: Ulid) -> Result<usize, EngineError> {
        let _commit = self.journal.commit_guard().await;
        let _mutate = self.mutate.lock().await;

        let keys = self.tasks().scheduled_for(&booking_id);
        if keys.is_empty() {
            return Ok(0);
        }
        self.journal
            .append(&Event::RemindersCancelled { keys: keys.clone() })
            .await?;
        self.tasks().mark(&keys, ReminderStatus::Cancelled);
        debug!("cancelled {} reminder(s) for booking {booking_id}", keys.len());
        Ok(keys.len())
    }

    /// Hand off every scheduled task due by `now`, marking it fired.
    pub async fn drain(&self, now: Ms) -> Result<Vec<ReminderTask>, EngineError> {
        let _commit = self.journal.commit_guard().await;
        let _mutate = self.mutate.lock().await;

        let keys: Vec<String> = self
            .tasks()
            .due
            .iter()
            .take_while(|(fire_at, _)| *fire_at <= now)
            .map(|(_, key)| key.clone())
            .collect();
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.journal
            .append(&Event::RemindersFired {
                keys: keys.clone(),
                at: now,
            })
            .await?;

        let mut tasks = self.tasks();
        tasks.mark(&keys, ReminderStatus::Fired);
        let fired: Vec<ReminderTask> = keys
            .iter()
            .filter_map(|k| tasks.by_key.get(k).cloned())
            .collect();
        info!("drained {} reminder(s) at {now}", fired.len());
        Ok(fired)
    }

    /// Apply a journal record during startup.
    pub fn restore(&self, event: &Event) {
        match event {
            Event::ReminderScheduled { task } => self.tasks().put(task.clone()),
            Event::RemindersCancelled { keys } => {
                self.tasks().mark(keys, ReminderStatus::Cancelled)
            }
            Event::RemindersFired { keys, .. } => self.tasks().mark(keys, ReminderStatus::Fired),
            _ => {}
        }
    }

    /// Every task as a `ReminderScheduled` record. Caller holds the journal's
    /// exclusive guard.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut tasks: Vec<ReminderTask> = self.tasks().by_key.values().cloned().collect();
        tasks.sort_by(|a, b| (a.scheduled_at, &a.key).cmp(&(b.scheduled_at, &b.key)));
        tasks
            .into_iter()
            .map(|task| Event::ReminderScheduled { task })
            .collect()
    }

    pub fn task(&self, key: &str) -> Option<ReminderTask> {
        self.tasks().by_key.get(key).cloned()
    }

    pub fn tasks_for(&self, booking_id: &Ulid) -> Vec<ReminderTask> {
        let tasks = self.tasks();
        tasks
            .by_booking
            .get(booking_id)
            .into_iter()
            .flatten()
            .filter_map(|k| tasks.by_key.get(k).cloned())
            .collect()
    }

    pub fn scheduled_len(&self) -> usize {
        self.tasks().due.len()
    }

    /// Fire time of the earliest scheduled task.
    pub fn next_due(&self) -> Option<Ms> {
        self.tasks().due.first().map(|(at, _)| *at)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::journal::Journal;

    fn scheduler(name: &str) -> (ReminderScheduler, std::path::PathBuf) {
        let dir = std::env::temp_dir().join("slotbook_test_reminder");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        let journal = JournalHandle::spawn(Journal::open(&path).unwrap());
        (ReminderScheduler::new(journal), path)
    }

    #[tokio::test]
    async fn schedule_twice_leaves_one_task() {
        let (s, _) = scheduler("twice.journal");
        let b = Ulid::new();
        assert_eq!(s.schedule(b, 1_000, 0).await.unwrap(), ScheduleOutcome::Scheduled);
        assert_eq!(s.schedule(b, 1_000, 0).await.unwrap(), ScheduleOutcome::Unchanged);
        assert_eq!(s.schedule(b, 2_000, 0).await.unwrap(), ScheduleOutcome::Replaced);

        let tasks = s.tasks_for(&b);
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].fire_at, 2_000);
        assert_eq!(s.scheduled_len(), 1);
        assert_eq!(s.next_due(), Some(2_000));
    }

    #[tokio::test]
    async fn drain_hands_off_once() {
        let (s, _) = scheduler("drain_once.journal");
        let b = Ulid::new();
        s.schedule(b, 1_000, 0).await.unwrap();

        assert!(s.drain(999).await.unwrap().is_empty());
        let fired = s.drain(1_000).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].status, ReminderStatus::Fired);
        assert!(s.drain(5_000).await.unwrap().is_empty());

        // A fired reminder is never rescheduled.
        assert_eq!(
            s.schedule(b, 9_000, 0).await.unwrap(),
            ScheduleOutcome::AlreadyFired
        );
    }

    #[tokio::test]
    async fn concurrent_drains_never_share_a_task() {
        let (s, _) = scheduler("drain_race.journal");
        let s = Arc::new(s);
        for i in 0..50 {
            s.schedule(Ulid::new(), i, 0).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = s.clone();
            handles.push(tokio::spawn(async move { s.drain(100).await.unwrap() }));
        }
        let mut keys = Vec::new();
        for h in handles {
            keys.extend(h.await.unwrap().into_iter().map(|t| t.key));
        }
        let total = keys.len();
        keys.sort();
        keys.dedup();
        assert_eq!(total, 50);
        assert_eq!(keys.len(), 50);
    }

    #[tokio::test]
    async fn cancel_is_noop_after_fire() {
        let (s, _) = scheduler("cancel.journal");
        let (a, b) = (Ulid::new(), Ulid::new());
        s.schedule(a, 1_000, 0).await.unwrap();
        s.schedule(b, 1_000, 0).await.unwrap();

        assert_eq!(s.cancel(a).await.unwrap(), 1);
        assert_eq!(s.cancel(a).await.unwrap(), 0);
        assert_eq!(s.cancel(Ulid::new()).await.unwrap(), 0);

        let fired = s.drain(1_000).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].booking_id, b);
        assert_eq!(s.cancel(b).await.unwrap(), 0);
        assert_eq!(s.tasks_for(&a)[0].status, ReminderStatus::Cancelled);
    }

    #[tokio::test]
    async fn replay_restores_fired_marks() {
        let (s, path) = scheduler("replay.journal");
        let (a, b) = (Ulid::new(), Ulid::new());
        s.schedule(a, 1_000, 0).await.unwrap();
        s.schedule(b, 2_000, 0).await.unwrap();
        s.drain(1_500).await.unwrap();

        let replay = Journal::replay(&path).unwrap();
        let (fresh, _) = scheduler("replay_fresh.journal");
        for event in &replay.events {
            fresh.restore(event);
        }
        assert_eq!(fresh.tasks_for(&a)[0].status, ReminderStatus::Fired);
        assert_eq!(fresh.scheduled_len(), 1);
        let fired = fresh.drain(2_000).await.unwrap();
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].booking_id, b);
    }
}
