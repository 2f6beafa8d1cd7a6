use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use ulid::Ulid;

use crate::calendar::CalendarReconciler;
use crate::clock::Clock;
use crate::collab::{CalendarClient, Notifier};
use crate::config::ServiceConfig;
use crate::engine::{Engine, EngineError};
use crate::journal::{Journal, JournalHandle};
use crate::model::*;
use crate::notify::NotifyHub;
use crate::queue::WorkQueue;
use crate::reminder::ReminderScheduler;
use crate::worker::{self, SyncWorker};

pub const JOURNAL_FILE: &str = "slotbook.journal";

/// Everything known about one booking, across components.
#[derive(Debug, Clone, Serialize)]
pub struct BookingRecord {
    pub view: BookingView,
    pub reminders: Vec<ReminderTask>,
    pub calendar: Option<CalendarSyncState>,
    pub pending_work: Vec<WorkItem>,
}

/// One journal, the engine, the scheduling components and their background
/// tasks, wired together.
pub struct Service {
    engine: Arc<Engine>,
    queue: Arc<WorkQueue>,
    reminders: Arc<ReminderScheduler>,
    calendar: Arc<CalendarReconciler>,
    worker: Arc<SyncWorker>,
    journal: JournalHandle,
    config: ServiceConfig,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Service {
    /// Open (or create) the journal under `config.data_dir` and replay it
    /// into every component. Must be called inside a tokio runtime.
    pub fn open(
        config: ServiceConfig,
        clock: Arc<dyn Clock>,
        calendar_client: Arc<dyn CalendarClient>,
        notifier: Arc<dyn Notifier>,
    ) -> io::Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;
        let path = config.data_dir.join(JOURNAL_FILE);
        let replay = Journal::replay(&path)?;
        let mut journal = Journal::open(&path)?;
        if replay.discarded_bytes > 0 {
            warn!(
                "journal {}: dropping {} bytes after the last valid record",
                path.display(),
                replay.discarded_bytes
            );
            journal.rewrite(&replay.events)?;
        }
        let journal = JournalHandle::spawn(journal);

        let queue = Arc::new(WorkQueue::new(journal.clone()));
        let engine = Arc::new(Engine::new(
            journal.clone(),
            queue.clone(),
            Arc::new(NotifyHub::new()),
            clock.clone(),
            config.engine.clone(),
        ));
        let reminders = Arc::new(ReminderScheduler::new(journal.clone()));
        let calendar = Arc::new(CalendarReconciler::new(
            engine.clone(),
            calendar_client,
            journal.clone(),
            clock.clone(),
            config.sync.clone(),
        ));
        let worker = Arc::new(SyncWorker::new(
            engine.clone(),
            queue.clone(),
            reminders.clone(),
            calendar.clone(),
            notifier,
            clock,
            config.sync.clone(),
        ));

        let service = Self {
            engine,
            queue,
            reminders,
            calendar,
            worker,
            journal,
            config,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        };
        for event in &replay.events {
            service.restore(event);
        }
        info!(
            "replayed {} records from {}: {} slots, {} bookings, {} pending work items",
            replay.events.len(),
            path.display(),
            service.engine.slots.len(),
            service.engine.bookings.len(),
            service.queue.len()
        );
        Ok(service)
    }

    fn restore(&self, event: &Event) {
        match event {
            Event::ReminderScheduled { .. }
            | Event::RemindersCancelled { .. }
            | Event::RemindersFired { .. } => self.reminders.restore(event),
            Event::CalendarSynced { .. } => self.calendar.restore(event),
            _ => self.engine.restore(event),
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Spawn the worker pool, reminder dispatch, elapse sweeper and compactor.
    pub fn start(self: &Arc<Self>) {
        let cfg = &self.config;
        let mut tasks = worker::spawn_pool(
            self.worker.clone(),
            cfg.workers,
            cfg.worker_poll_interval,
            self.shutdown.clone(),
        );
        tasks.push(tokio::spawn(worker::run_reminder_dispatch(
            self.worker.clone(),
            cfg.drain_interval,
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(worker::run_sweeper(
            self.engine.clone(),
            cfg.sweep_interval,
            self.shutdown.clone(),
        )));
        tasks.push(tokio::spawn(worker::run_compactor(
            self.clone(),
            cfg.compact_interval,
            self.shutdown.clone(),
        )));
        info!("started {} sync workers", cfg.workers.max(1));
        self.tasks().extend(tasks);
    }

    /// Stop background tasks and wait for them. Committed state is already
    /// durable; unfinished work resumes on the next `open`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = self.tasks().drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("background task ended abnormally: {e}");
            }
        }
        info!("service stopped");
    }

    /// Rewrite the journal as the minimal records that recreate the current
    /// state of every component.
    pub async fn compact(&self) -> Result<(), EngineError> {
        let _exclusive = self.journal.exclusive().await;
        let mut events = self.engine.snapshot_events().await;
        events.extend(self.reminders.snapshot_events());
        events.extend(self.calendar.snapshot_events());
        let n = events.len();
        self.journal.rewrite(events).await?;
        info!("journal compacted to {n} records");
        Ok(())
    }

    /// Compact once `compact_threshold` records have been appended since the last time.
    pub async fn compact_if_needed(&self) -> Result<bool, EngineError> {
        if self.journal.appends_since_compact().await < self.config.compact_threshold {
            return Ok(false);
        }
        self.compact().await?;
        Ok(true)
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    pub fn reminders(&self) -> &Arc<ReminderScheduler> {
        &self.reminders
    }

    pub fn calendar(&self) -> &Arc<CalendarReconciler> {
        &self.calendar
    }

    pub fn worker(&self) -> &Arc<SyncWorker> {
        &self.worker
    }

    pub fn queue(&self) -> &Arc<WorkQueue> {
        &self.queue
    }

    pub fn journal_path(&self) -> PathBuf {
        self.config.data_dir.join(JOURNAL_FILE)
    }

    pub async fn booking_record(&self, booking_id: &Ulid) -> Option<BookingRecord> {
        let view = self.engine.booking_view(booking_id).await?;
        Some(BookingRecord {
            view,
            reminders: self.reminders.tasks_for(booking_id),
            calendar: self.calendar.state(booking_id),
            pending_work: self.queue.pending_for(booking_id),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::clock::ManualClock;
    use crate::collab::mock::{MockCalendar, MockNotifier};

    const HOUR: Ms = 3_600_000;
    const NOW: Ms = 1_800_000_000_000;

    fn test_data_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("slotbook_test_service").join(name);
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn open(dir: &PathBuf, clock: Arc<ManualClock>, calendar: Arc<MockCalendar>) -> Service {
        let config = ServiceConfig {
            data_dir: dir.clone(),
            compact_threshold: 5,
            ..ServiceConfig::default()
        };
        Service::open(config, clock, calendar, Arc::new(MockNotifier::default())).unwrap()
    }

    async fn drain(service: &Service) {
        while service.worker().process_next().await.unwrap() {}
    }

    #[tokio::test]
    async fn replay_restores_every_component() {
        let dir = test_data_dir("replay");
        let clock = Arc::new(ManualClock::new(NOW));
        let calendar = Arc::new(MockCalendar::default());
        let owner = Ulid::new();
        let (slot_id, booking_id) = {
            let s = open(&dir, clock.clone(), calendar.clone());
            let slot_id = Ulid::new();
            s.engine()
                .publish_slot(slot_id, owner, Span::new(NOW + 48 * HOUR, NOW + 49 * HOUR), NOW)
                .await
                .unwrap();
            let b = s.engine().claim(slot_id, Ulid::new(), NOW).await.unwrap();
            s.engine()
                .transition(b.id, Action::Confirm, Actor::Professor(owner), NOW)
                .await
                .unwrap();
            // Process only the requested notice and the reminder; the calendar
            // create stays queued across the restart.
            assert!(s.worker().process_next().await.unwrap());
            assert!(s.worker().process_next().await.unwrap());
            (slot_id, b.id)
        };

        let s = open(&dir, clock.clone(), calendar.clone());
        let slot = s.engine().slot(&slot_id).await.unwrap();
        assert_eq!(slot.status, SlotStatus::Booked);
        let record = s.booking_record(&booking_id).await.unwrap();
        assert_eq!(record.view.booking.status, BookingStatus::Confirmed);
        assert_eq!(record.reminders.len(), 1);
        assert_eq!(record.pending_work.len(), 2);
        assert!(record.calendar.is_none());

        drain(&s).await;
        assert!(s.queue().is_empty());
        assert!(s.calendar().state(&booking_id).unwrap().external_event_id.is_some());
        assert!(s.engine().audit().await.is_empty());
    }

    #[tokio::test]
    async fn compaction_preserves_state() {
        let dir = test_data_dir("compact");
        let clock = Arc::new(ManualClock::new(NOW));
        let calendar = Arc::new(MockCalendar::default());
        let owner = Ulid::new();
        let s = open(&dir, clock.clone(), calendar.clone());

        let mut bookings = Vec::new();
        for i in 0..4 {
            let slot_id = Ulid::new();
            let start = NOW + (48 + i) * HOUR;
            s.engine()
                .publish_slot(slot_id, owner, Span::new(start, start + HOUR), NOW)
                .await
                .unwrap();
            let b = s.engine().claim(slot_id, Ulid::new(), NOW).await.unwrap();
            s.engine()
                .transition(b.id, Action::Confirm, Actor::Professor(owner), NOW)
                .await
                .unwrap();
            bookings.push(b);
        }
        let cancelled = &bookings[0];
        s.engine()
            .transition(
                cancelled.id,
                Action::Cancel {
                    reason: Some("conflict".into()),
                },
                Actor::Student(cancelled.student_id),
                NOW,
            )
            .await
            .unwrap();
        drain(&s).await;

        let before = fs::metadata(s.journal_path()).unwrap().len();
        assert!(s.compact_if_needed().await.unwrap());
        let after = fs::metadata(s.journal_path()).unwrap().len();
        assert!(after < before, "compacted journal should be smaller: {after} < {before}");
        drop(s);

        let s = open(&dir, clock, calendar.clone());
        for b in &bookings[1..] {
            let record = s.booking_record(&b.id).await.unwrap();
            assert_eq!(record.view.booking.status, BookingStatus::Confirmed);
            assert_eq!(record.reminders[0].status, ReminderStatus::Scheduled);
            assert!(record.calendar.unwrap().external_event_id.is_some());
        }
        let c = s.engine().booking(&cancelled.id).unwrap();
        assert_eq!(c.status, BookingStatus::Cancelled);
        assert_eq!(c.cancellation_reason.as_deref(), Some("conflict"));
        assert_eq!(
            s.engine().slot(&cancelled.slot_id).await.unwrap().status,
            SlotStatus::Available
        );
        assert!(s.queue().is_empty());
        assert!(s.engine().audit().await.is_empty());

        // Slot versions survive, so a fresh claim on the reopened slot works.
        s.engine()
            .claim(cancelled.slot_id, Ulid::new(), NOW + HOUR)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn torn_tail_is_dropped_on_open() {
        let dir = test_data_dir("torn");
        let clock = Arc::new(ManualClock::new(NOW));
        let calendar = Arc::new(MockCalendar::default());
        let slot_id = Ulid::new();
        {
            let s = open(&dir, clock.clone(), calendar.clone());
            s.engine()
                .publish_slot(slot_id, Ulid::new(), Span::new(NOW + HOUR, NOW + 2 * HOUR), NOW)
                .await
                .unwrap();
        }
        {
            use std::io::Write;
            let mut f = fs::OpenOptions::new()
                .append(true)
                .open(dir.join(JOURNAL_FILE))
                .unwrap();
            f.write_all(&[42, 0, 0, 0, 1, 2]).unwrap();
        }

        let s = open(&dir, clock.clone(), calendar.clone());
        let b = s.engine().claim(slot_id, Ulid::new(), NOW).await.unwrap();
        drop(s);

        // The claim written after the torn tail must survive the next restart.
        let s = open(&dir, clock, calendar);
        assert_eq!(s.engine().booking(&b.id).unwrap().status, BookingStatus::Pending);
    }

    #[tokio::test]
    async fn start_and_shutdown() {
        let dir = test_data_dir("lifecycle");
        let clock = Arc::new(ManualClock::new(NOW));
        let s = Arc::new(open(&dir, clock, Arc::new(MockCalendar::default())));
        s.start();
        s.shutdown().await;
        assert!(s.tasks().is_empty());
    }
}
