use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unix milliseconds. Every timestamp in the engine uses this type.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn contains_instant(&self, t: Ms) -> bool {
        self.start <= t && t < self.end
    }
}

// ── Slots ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    Available,
    Booked,
    Completed,
    Cancelled,
}

/// One bookable interval owned by a professor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub id: Ulid,
    pub owner_id: Ulid,
    pub span: Span,
    pub status: SlotStatus,
    /// Bumped on every committed mutation of the slot. Claims and transitions
    /// compare it at commit time to detect a concurrent writer.
    pub version: u64,
    pub created_at: Ms,
    /// The owner's cancellation notice for this slot. `None` falls back to
    /// the engine-wide default.
    pub cancellation_notice_ms: Option<Ms>,
}

impl Slot {
    /// Last instant before which a confirmed booking on this slot can be
    /// cancelled or rescheduled.
    pub fn cancellation_cutoff(&self, default_notice_ms: Ms) -> Ms {
        let notice = self.cancellation_notice_ms.unwrap_or(default_notice_ms);
        self.span.start.saturating_sub(notice)
    }
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
    NoShow,
}

impl BookingStatus {
    /// Pending and confirmed bookings hold their slot.
    pub fn is_active(self) -> bool {
        matches!(self, BookingStatus::Pending | BookingStatus::Confirmed)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Completed => "completed",
            BookingStatus::NoShow => "no_show",
        }
    }
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who is asking for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Actor {
    Professor(Ulid),
    Student(Ulid),
    /// Background sweeps (elapse).
    System,
}

/// A student's claim on a slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    /// Immutable after creation.
    pub slot_id: Ulid,
    pub student_id: Ulid,
    pub status: BookingStatus,
    pub created_at: Ms,
    /// Time of the last status transition.
    pub updated_at: Ms,
    /// Set by the slot owner once the consultation has started.
    pub attended: bool,
    pub cancelled_by: Option<Actor>,
    pub cancellation_reason: Option<String>,
    /// Replacement booking created by a reschedule.
    pub rescheduled_to: Option<Ulid>,
    /// Idempotency key of the reminder scheduled on confirmation.
    pub reminder_key: Option<String>,
}

impl Booking {
    pub fn pending(id: Ulid, slot_id: Ulid, student_id: Ulid, at: Ms) -> Self {
        Self {
            id,
            slot_id,
            student_id,
            status: BookingStatus::Pending,
            created_at: at,
            updated_at: at,
            attended: false,
            cancelled_by: None,
            cancellation_reason: None,
            rescheduled_to: None,
            reminder_key: None,
        }
    }
}

/// Lifecycle actions accepted by the booking state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Action {
    Confirm,
    Cancel { reason: Option<String> },
    Reschedule { new_slot_id: Ulid },
    /// The slot's end has passed; resolves to completed or no_show.
    Elapse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Confirm,
    Cancel,
    Reschedule,
    Elapse,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Confirm => "confirm",
            ActionKind::Cancel => "cancel",
            ActionKind::Reschedule => "reschedule",
            ActionKind::Elapse => "elapse",
        }
    }
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Confirm => ActionKind::Confirm,
            Action::Cancel { .. } => ActionKind::Cancel,
            Action::Reschedule { .. } => ActionKind::Reschedule,
            Action::Elapse => ActionKind::Elapse,
        }
    }
}

/// Read-only snapshot of a booking joined with its slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BookingView {
    pub booking: Booking,
    pub professor_id: Ulid,
    pub span: Span,
    pub slot_status: SlotStatus,
}

// ── Reminders ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReminderKind {
    /// Ahead-of-time reminder for an upcoming consultation.
    Upcoming,
}

impl ReminderKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ReminderKind::Upcoming => "upcoming",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReminderStatus {
    Scheduled,
    Fired,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReminderTask {
    pub booking_id: Ulid,
    pub kind: ReminderKind,
    pub fire_at: Ms,
    pub key: String,
    pub status: ReminderStatus,
    pub scheduled_at: Ms,
}

/// Deterministic idempotency key for a (booking, reminder kind) pair.
pub fn reminder_key(booking_id: Ulid, kind: ReminderKind) -> String {
    format!("reminder:{booking_id}:{}", kind.as_str())
}

// ── Calendar sync ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncAction {
    Create,
    Cancel,
}

impl SyncAction {
    pub fn as_str(self) -> &'static str {
        match self {
            SyncAction::Create => "create",
            SyncAction::Cancel => "cancel",
        }
    }
}

/// Per-booking record of the external calendar event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarSyncState {
    pub booking_id: Ulid,
    /// Set iff the collaborator acknowledged a create and no delete has since succeeded.
    pub external_event_id: Option<String>,
    pub last_action: Option<SyncAction>,
    pub retry_count: u32,
    pub next_retry_at: Option<Ms>,
    pub permanently_failed: bool,
    pub last_error: Option<String>,
    pub updated_at: Ms,
}

impl CalendarSyncState {
    pub fn new(booking_id: Ulid, at: Ms) -> Self {
        Self {
            booking_id,
            external_event_id: None,
            last_action: None,
            retry_count: 0,
            next_retry_at: None,
            permanently_failed: false,
            last_error: None,
            updated_at: at,
        }
    }
}

// ── Work queue ───────────────────────────────────────────────────

/// Lifecycle notices sent alongside transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NoticeKind {
    Requested,
    Confirmed,
    Cancelled,
    Rescheduled,
}

impl NoticeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NoticeKind::Requested => "requested",
            NoticeKind::Confirmed => "confirmed",
            NoticeKind::Cancelled => "cancelled",
            NoticeKind::Rescheduled => "rescheduled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkKind {
    ScheduleReminder { kind: ReminderKind, fire_at: Ms },
    CancelReminders,
    Calendar(SyncAction),
    Notice(NoticeKind),
}

impl WorkKind {
    pub fn label(&self) -> &'static str {
        match self {
            WorkKind::ScheduleReminder { .. } => "schedule_reminder",
            WorkKind::CancelReminders => "cancel_reminders",
            WorkKind::Calendar(SyncAction::Create) => "calendar_create",
            WorkKind::Calendar(SyncAction::Cancel) => "calendar_cancel",
            WorkKind::Notice(_) => "notice",
        }
    }
}

/// A follow-up effect emitted by a committed transition.
/// `seq` is global and monotonic; per booking it gives processing order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub seq: u64,
    pub booking_id: Ulid,
    pub kind: WorkKind,
}

// ── Journal records ──────────────────────────────────────────────

/// The journal record format. Each committed mutation is exactly one record,
/// including the work it emits, so a torn write loses all of it or none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// Also used by compaction to restore a slot as-is.
    SlotPublished {
        slot: Slot,
    },
    SlotWithdrawn {
        id: Ulid,
        version: u64,
    },
    BookingClaimed {
        booking: Booking,
        slot_version: u64,
        work: Vec<WorkItem>,
    },
    BookingTransitioned {
        id: Ulid,
        status: BookingStatus,
        at: Ms,
        cancelled_by: Option<Actor>,
        reason: Option<String>,
        reminder_key: Option<String>,
        slot_status: SlotStatus,
        slot_version: u64,
        work: Vec<WorkItem>,
    },
    BookingRescheduled {
        old_id: Ulid,
        at: Ms,
        cancelled_by: Actor,
        old_slot_version: u64,
        new_booking: Booking,
        new_slot_version: u64,
        work: Vec<WorkItem>,
    },
    AttendanceMarked {
        id: Ulid,
        slot_version: u64,
    },
    /// Compaction only: a booking with its current fields.
    BookingRestored {
        booking: Booking,
    },
    /// Compaction only: an unfinished work item.
    WorkRestored {
        item: WorkItem,
    },
    WorkCompleted {
        seq: u64,
    },
    /// Also used by compaction to restore reminder history.
    ReminderScheduled {
        task: ReminderTask,
    },
    RemindersCancelled {
        keys: Vec<String>,
    },
    RemindersFired {
        keys: Vec<String>,
        at: Ms,
    },
    CalendarSynced {
        state: CalendarSyncState,
    },
}

/// Notification handed to the notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationPayload {
    /// Collaborators may use this to drop duplicates.
    pub idempotency_key: String,
    pub topic: NotificationTopic,
    pub booking_id: Ulid,
    pub slot_id: Ulid,
    pub professor_id: Ulid,
    pub student_id: Ulid,
    pub span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NotificationTopic {
    Reminder(ReminderKind),
    Notice(NoticeKind),
}

impl NotificationPayload {
    pub fn for_view(view: &BookingView, topic: NotificationTopic, idempotency_key: String) -> Self {
        Self {
            idempotency_key,
            topic,
            booking_id: view.booking.id,
            slot_id: view.booking.slot_id,
            professor_id: view.professor_id,
            student_id: view.booking.student_id,
            span: view.span,
        }
    }
}
