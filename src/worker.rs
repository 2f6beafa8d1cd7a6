use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::calendar::{CalendarReconciler, ReconcileOutcome};
use crate::clock::Clock;
use crate::collab::{Notifier, SyncError};
use crate::config::SyncConfig;
use crate::engine::{Engine, EngineError};
use crate::model::*;
use crate::observability::{NOTIFICATIONS_TOTAL, REMINDERS_FIRED_TOTAL, WORK_ITEMS_TOTAL};
use crate::queue::WorkQueue;
use crate::reminder::ReminderScheduler;
use crate::service::Service;

enum Step {
    Done,
    RetryAt(Ms),
}

/// Consumes the work queue and drives the scheduling components and the
/// external collaborators. Many tasks share one `SyncWorker`; the queue
/// keeps each booking's items in order and on one task at a time.
pub struct SyncWorker {
    engine: Arc<Engine>,
    queue: Arc<WorkQueue>,
    reminders: Arc<ReminderScheduler>,
    calendar: Arc<CalendarReconciler>,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl SyncWorker {
    pub fn new(
        engine: Arc<Engine>,
        queue: Arc<WorkQueue>,
        reminders: Arc<ReminderScheduler>,
        calendar: Arc<CalendarReconciler>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            engine,
            queue,
            reminders,
            calendar,
            notifier,
            clock,
            config,
        }
    }

    /// Process one runnable item. Returns false if none was ready.
    pub async fn process_next(&self) -> Result<bool, EngineError> {
        let now = self.clock.now();
        let Some(item) = self.queue.next(now) else {
            return Ok(false);
        };
        let label = item.kind.label();

        let outcome = match self.process(&item, now).await {
            Ok(Step::Done) => match self.queue.complete(&item).await {
                Ok(()) => "done",
                Err(e) => {
                    self.queue.release(item.booking_id);
                    metrics::counter!(WORK_ITEMS_TOTAL, "kind" => label, "outcome" => "error")
                        .increment(1);
                    return Err(e);
                }
            },
            Ok(Step::RetryAt(at)) => {
                self.queue.defer(item.booking_id, at);
                "deferred"
            }
            Err(e) => {
                error!("work item {} ({label}) for booking {}: {e}", item.seq, item.booking_id);
                self.queue
                    .defer(item.booking_id, now + self.config.base_backoff_ms);
                "error"
            }
        };
        metrics::counter!(WORK_ITEMS_TOTAL, "kind" => label, "outcome" => outcome).increment(1);
        Ok(true)
    }

    async fn process(&self, item: &WorkItem, now: Ms) -> Result<Step, EngineError> {
        match &item.kind {
            WorkKind::ScheduleReminder { kind, fire_at } => {
                self.reminders
                    .schedule_kind(item.booking_id, *kind, *fire_at, now)
                    .await?;
                Ok(Step::Done)
            }
            WorkKind::CancelReminders => {
                self.reminders.cancel(item.booking_id).await?;
                Ok(Step::Done)
            }
            WorkKind::Calendar(action) => {
                match self.calendar.reconcile(item.booking_id, *action).await? {
                    ReconcileOutcome::RetryAt(at) => Ok(Step::RetryAt(at)),
                    ReconcileOutcome::Applied
                    | ReconcileOutcome::NoOp
                    | ReconcileOutcome::Failed => Ok(Step::Done),
                }
            }
            WorkKind::Notice(kind) => {
                self.send_notice(item, *kind).await;
                Ok(Step::Done)
            }
        }
    }

    /// Single attempt. A failed notice is logged and counted, never retried.
    async fn send_notice(&self, item: &WorkItem, kind: NoticeKind) {
        let Some(view) = self.engine.booking_view(&item.booking_id).await else {
            warn!("notice {} for unknown booking {}", kind.as_str(), item.booking_id);
            return;
        };
        let key = format!("notice:{}:{}:{}", item.booking_id, kind.as_str(), item.seq);
        let payload = NotificationPayload::for_view(&view, NotificationTopic::Notice(kind), key);
        let outcome = match self.send(&payload).await {
            Ok(()) => "ok",
            Err(e) => {
                warn!(
                    "notice {} for booking {} not delivered: {e}",
                    kind.as_str(),
                    item.booking_id
                );
                "error"
            }
        };
        metrics::counter!(NOTIFICATIONS_TOTAL, "kind" => kind.as_str(), "outcome" => outcome)
            .increment(1);
    }

    async fn send(&self, payload: &NotificationPayload) -> Result<(), SyncError> {
        tokio::time::timeout(self.config.call_timeout, self.notifier.send(payload))
            .await
            .unwrap_or(Err(SyncError::Timeout))
    }

    /// Drain due reminders and hand each to the notifier once. Returns how
    /// many were delivered.
    pub async fn dispatch_due_reminders(&self, now: Ms) -> Result<usize, EngineError> {
        let tasks = self.reminders.drain(now).await?;
        let mut delivered = 0;
        for task in tasks {
            let outcome = self.deliver_reminder(&task).await;
            if outcome == "ok" {
                delivered += 1;
            }
            metrics::counter!(REMINDERS_FIRED_TOTAL, "outcome" => outcome).increment(1);
        }
        Ok(delivered)
    }

    async fn deliver_reminder(&self, task: &ReminderTask) -> &'static str {
        let Some(view) = self.engine.booking_view(&task.booking_id).await else {
            warn!("reminder {} for unknown booking", task.key);
            return "skipped";
        };
        if view.booking.status != BookingStatus::Confirmed {
            debug!("reminder {} skipped: booking is {}", task.key, view.booking.status);
            return "skipped";
        }
        let payload = NotificationPayload::for_view(
            &view,
            NotificationTopic::Reminder(task.kind),
            task.key.clone(),
        );
        match self.send(&payload).await {
            Ok(()) => {
                info!("reminder {} handed off", task.key);
                "ok"
            }
            Err(e) => {
                warn!("reminder {} not delivered: {e}", task.key);
                "error"
            }
        }
    }
}

/// Spawn `n` worker tasks sharing one `SyncWorker`.
pub fn spawn_pool(
    worker: Arc<SyncWorker>,
    n: usize,
    poll: Duration,
    shutdown: CancellationToken,
) -> Vec<JoinHandle<()>> {
    (0..n.max(1))
        .map(|id| tokio::spawn(run_worker(worker.clone(), id, poll, shutdown.clone())))
        .collect()
}

async fn run_worker(worker: Arc<SyncWorker>, id: usize, poll: Duration, shutdown: CancellationToken) {
    info!("sync worker {id} started");
    while !shutdown.is_cancelled() {
        match worker.process_next().await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => error!("sync worker {id}: {e}"),
        }
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = worker.queue.wait() => {}
            _ = tokio::time::sleep(poll) => {}
        }
    }
    info!("sync worker {id} stopped");
}

/// Background task that hands due reminders to the notifier.
pub async fn run_reminder_dispatch(
    worker: Arc<SyncWorker>,
    every: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let now = worker.clock.now();
        match worker.dispatch_due_reminders(now).await {
            Ok(0) => {}
            Ok(n) => debug!("dispatched {n} reminder(s)"),
            Err(e) => error!("reminder dispatch failed: {e}"),
        }
    }
}

/// Elapse every confirmed booking whose slot has ended. Returns how many
/// were resolved.
pub async fn sweep_elapsed(engine: &Engine, now: Ms) -> usize {
    let mut resolved = 0;
    for booking_id in engine.elapsed_confirmed(now).await {
        match engine
            .transition(booking_id, Action::Elapse, Actor::System, now)
            .await
        {
            Ok(b) => {
                info!("elapsed booking {booking_id}: {}", b.status);
                resolved += 1;
            }
            // May have been cancelled or elapsed concurrently.
            Err(e) => debug!("elapse skip {booking_id}: {e}"),
        }
    }
    resolved
}

/// Background task that periodically elapses finished bookings.
pub async fn run_sweeper(engine: Arc<Engine>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        sweep_elapsed(&engine, engine.now()).await;
    }
}

/// Background task that compacts the journal once enough records pile up.
pub async fn run_compactor(service: Arc<Service>, every: Duration, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(every);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        if let Err(e) = service.compact_if_needed().await {
            error!("journal compaction failed: {e}");
        }
    }
}
