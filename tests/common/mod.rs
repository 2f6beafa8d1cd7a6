#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ulid::Ulid;

use slotbook::clock::ManualClock;
use slotbook::collab::{CalendarClient, Notifier, SyncError};
use slotbook::config::{EngineConfig, ReminderPolicy, ServiceConfig};
use slotbook::model::*;
use slotbook::service::Service;

pub const M: Ms = 60_000;
pub const H: Ms = 3_600_000;
pub const DAY: Ms = 24 * H;
/// 2027-01-15T08:00:00Z.
pub const NOW: Ms = 1_800_000_000_000;

/// Midnight UTC `days` after the day containing `NOW`.
pub fn midnight(days: i64) -> Ms {
    (NOW.div_euclid(DAY) + days) * DAY
}

// ── Collaborators ────────────────────────────────────────────

/// Calendar that counts calls and can be switched into an outage.
#[derive(Default)]
pub struct CountingCalendar {
    pub creates: AtomicUsize,
    pub deletes: AtomicUsize,
    pub down: AtomicBool,
}

impl CountingCalendar {
    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), SyncError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(SyncError::Unavailable("calendar outage".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CalendarClient for CountingCalendar {
    async fn create_event(&self, view: &BookingView) -> Result<String, SyncError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(format!("cal-{}", view.booking.id))
    }

    async fn delete_event(&self, _external_event_id: &str) -> Result<(), SyncError> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.check()
    }
}

/// Notifier that keeps every payload it accepted.
#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<NotificationPayload>>,
}

impl RecordingNotifier {
    pub fn reminders(&self) -> Vec<NotificationPayload> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|p| matches!(p.topic, NotificationTopic::Reminder(_)))
            .cloned()
            .collect()
    }

    pub fn notices(&self, booking_id: Ulid) -> Vec<NoticeKind> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.booking_id == booking_id)
            .filter_map(|p| match p.topic {
                NotificationTopic::Notice(kind) => Some(kind),
                NotificationTopic::Reminder(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), SyncError> {
        self.sent.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

// ── Harness ──────────────────────────────────────────────────

pub struct Harness {
    pub dir: PathBuf,
    pub config: ServiceConfig,
    pub clock: Arc<ManualClock>,
    pub calendar: Arc<CountingCalendar>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    /// One-hour notice and an 08:00-the-day-before reminder.
    pub fn new() -> Self {
        let dir = std::env::temp_dir().join(format!("slotbook_int_test_{}", Ulid::new()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = ServiceConfig {
            data_dir: dir.clone(),
            engine: EngineConfig {
                cancellation_notice_ms: H,
                reminder_policy: ReminderPolicy::DayBeforeAt(8 * H),
                ..EngineConfig::default()
            },
            ..ServiceConfig::default()
        };
        Self {
            dir,
            config,
            clock: Arc::new(ManualClock::new(NOW)),
            calendar: Arc::new(CountingCalendar::default()),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    /// Open a service over the harness directory. Reopening after a drop
    /// simulates a restart.
    pub fn open(&self) -> Arc<Service> {
        Arc::new(
            Service::open(
                self.config.clone(),
                self.clock.clone(),
                self.calendar.clone(),
                self.notifier.clone(),
            )
            .unwrap(),
        )
    }
}

/// Run the worker until no item is runnable at the current clock.
pub async fn drain_work(service: &Service) {
    while service.worker().process_next().await.unwrap() {}
}

/// Publish a slot for `owner` over `[start, end)` at `NOW`.
pub async fn publish(service: &Service, owner: Ulid, start: Ms, end: Ms) -> Ulid {
    let id = Ulid::new();
    service
        .engine()
        .publish_slot(id, owner, Span::new(start, end), NOW)
        .await
        .unwrap();
    id
}
