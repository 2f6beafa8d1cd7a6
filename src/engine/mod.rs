mod arbiter;
mod error;
mod machine;
mod queries;
mod store;

pub use error::EngineError;
pub use machine::{plan_transition, Plan};
pub use store::{BookingStore, SharedSlot, SlotStore};

use std::sync::Arc;

use ulid::Ulid;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::journal::JournalHandle;
use crate::model::*;
use crate::notify::{NotifyHub, SlotChange};
use crate::queue::WorkQueue;

/// The slot/booking engine: owns every write to slots and bookings.
///
/// A mutation is: take the journal's shared commit guard, take the slot
/// lock(s), validate against the current version, append one record,
/// apply it, publish the change. The record carries the work the mutation
/// emits, so the follow-up work is durable exactly when the mutation is.
pub struct Engine {
    pub(crate) slots: SlotStore,
    pub(crate) bookings: BookingStore,
    pub(crate) work: Arc<WorkQueue>,
    pub(crate) journal: JournalHandle,
    pub notify: Arc<NotifyHub>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) config: EngineConfig,
}

impl Engine {
    pub fn new(
        journal: JournalHandle,
        work: Arc<WorkQueue>,
        notify: Arc<NotifyHub>,
        clock: Arc<dyn Clock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            slots: SlotStore::new(),
            bookings: BookingStore::new(),
            work,
            journal,
            notify,
            clock,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> Ms {
        self.clock.now()
    }

    /// Durable append; caller holds the commit guard and the slot lock(s).
    pub(super) async fn commit(&self, event: &Event) -> Result<(), EngineError> {
        self.journal.append(event).await.map_err(EngineError::from)
    }

    fn publish(&self, slot: &Slot, booking: Option<&Booking>) {
        self.notify.send(SlotChange {
            slot_id: slot.id,
            slot_status: slot.status,
            version: slot.version,
            booking_id: booking.map(|b| b.id),
            booking_status: booking.map(|b| b.status),
        });
    }

    fn enqueue(&self, work: &[WorkItem]) {
        for item in work {
            self.work.push(item.clone());
        }
    }

    // ── Apply (shared by live commits and replay) ───────────

    pub(super) fn apply_claim(
        &self,
        slot: &mut Slot,
        booking: &Booking,
        slot_version: u64,
        work: &[WorkItem],
    ) {
        slot.status = SlotStatus::Booked;
        slot.version = slot_version;
        self.bookings.put(booking.clone());
        self.enqueue(work);
        self.publish(slot, Some(booking));
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn apply_transition(
        &self,
        slot: &mut Slot,
        id: Ulid,
        status: BookingStatus,
        at: Ms,
        cancelled_by: Option<Actor>,
        reason: Option<&String>,
        reminder_key: Option<&String>,
        slot_status: SlotStatus,
        slot_version: u64,
        work: &[WorkItem],
    ) {
        self.bookings.update(&id, |b| {
            b.status = status;
            b.updated_at = at;
            if cancelled_by.is_some() {
                b.cancelled_by = cancelled_by;
            }
            if let Some(r) = reason {
                b.cancellation_reason = Some(r.clone());
            }
            if let Some(k) = reminder_key {
                b.reminder_key = Some(k.clone());
            }
        });
        slot.status = slot_status;
        slot.version = slot_version;
        self.enqueue(work);
        self.publish(slot, self.bookings.get(&id).as_ref());
    }

    #[allow(clippy::too_many_arguments)]
    pub(super) fn apply_reschedule(
        &self,
        old_slot: &mut Slot,
        new_slot: &mut Slot,
        old_id: Ulid,
        at: Ms,
        cancelled_by: Actor,
        old_slot_version: u64,
        new_booking: &Booking,
        new_slot_version: u64,
        work: &[WorkItem],
    ) {
        self.bookings.update(&old_id, |b| {
            b.status = BookingStatus::Cancelled;
            b.updated_at = at;
            b.cancelled_by = Some(cancelled_by);
            b.cancellation_reason = Some("rescheduled".into());
            b.rescheduled_to = Some(new_booking.id);
        });
        old_slot.status = SlotStatus::Available;
        old_slot.version = old_slot_version;
        new_slot.status = SlotStatus::Booked;
        new_slot.version = new_slot_version;
        self.bookings.put(new_booking.clone());
        self.enqueue(work);
        self.publish(old_slot, self.bookings.get(&old_id).as_ref());
        self.publish(new_slot, Some(new_booking));
    }

    pub(super) fn apply_attendance(&self, slot: &mut Slot, id: Ulid, slot_version: u64) {
        self.bookings.update(&id, |b| b.attended = true);
        slot.version = slot_version;
    }

    pub(super) fn apply_withdraw(&self, slot: &mut Slot, version: u64) {
        slot.status = SlotStatus::Cancelled;
        slot.version = version;
        self.publish(slot, None);
    }

    // ── Replay ──────────────────────────────────────────────

    /// Apply a journal record during startup. Nothing else is running, so
    /// every lock is uncontended.
    pub fn restore(&self, event: &Event) {
        match event {
            Event::SlotPublished { slot } => self.slots.put(slot.clone()),
            Event::SlotWithdrawn { id, version } => {
                self.with_slot(id, |slot| self.apply_withdraw(slot, *version));
            }
            Event::BookingClaimed {
                booking,
                slot_version,
                work,
            } => {
                self.with_slot(&booking.slot_id, |slot| {
                    self.apply_claim(slot, booking, *slot_version, work)
                });
            }
            Event::BookingTransitioned {
                id,
                status,
                at,
                cancelled_by,
                reason,
                reminder_key,
                slot_status,
                slot_version,
                work,
            } => {
                let Some(slot_id) = self.bookings.get(id).map(|b| b.slot_id) else {
                    tracing::warn!("replay: transition for unknown booking {id}");
                    return;
                };
                self.with_slot(&slot_id, |slot| {
                    self.apply_transition(
                        slot,
                        *id,
                        *status,
                        *at,
                        *cancelled_by,
                        reason.as_ref(),
                        reminder_key.as_ref(),
                        *slot_status,
                        *slot_version,
                        work,
                    )
                });
            }
            Event::BookingRescheduled {
                old_id,
                at,
                cancelled_by,
                old_slot_version,
                new_booking,
                new_slot_version,
                work,
            } => {
                let Some(old_slot_id) = self.bookings.get(old_id).map(|b| b.slot_id) else {
                    tracing::warn!("replay: reschedule of unknown booking {old_id}");
                    return;
                };
                let (Some(old_shared), Some(new_shared)) = (
                    self.slots.get(&old_slot_id),
                    self.slots.get(&new_booking.slot_id),
                ) else {
                    tracing::warn!("replay: reschedule references unknown slot");
                    return;
                };
                let (Ok(mut old_slot), Ok(mut new_slot)) =
                    (old_shared.try_write(), new_shared.try_write())
                else {
                    tracing::warn!("replay: reschedule slot lock contended");
                    return;
                };
                self.apply_reschedule(
                    &mut old_slot,
                    &mut new_slot,
                    *old_id,
                    *at,
                    *cancelled_by,
                    *old_slot_version,
                    new_booking,
                    *new_slot_version,
                    work,
                );
            }
            Event::AttendanceMarked { id, slot_version } => {
                if let Some(slot_id) = self.bookings.get(id).map(|b| b.slot_id) {
                    self.with_slot(&slot_id, |slot| {
                        self.apply_attendance(slot, *id, *slot_version)
                    });
                }
            }
            Event::BookingRestored { booking } => self.bookings.put(booking.clone()),
            Event::WorkRestored { item } => self.work.push(item.clone()),
            Event::WorkCompleted { seq } => self.work.forget(*seq),
            Event::ReminderScheduled { .. }
            | Event::RemindersCancelled { .. }
            | Event::RemindersFired { .. }
            | Event::CalendarSynced { .. } => {}
        }
    }

    fn with_slot(&self, slot_id: &Ulid, f: impl FnOnce(&mut Slot)) {
        let Some(shared) = self.slots.get(slot_id) else {
            tracing::warn!("replay: unknown slot {slot_id}");
            return;
        };
        match shared.try_write() {
            Ok(mut guard) => f(&mut guard),
            Err(_) => tracing::warn!("replay: slot {slot_id} lock contended"),
        };
    }

    /// Minimal records that recreate the slots, bookings and pending work.
    /// Caller holds the journal's exclusive guard.
    pub async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::with_capacity(self.slots.len() + self.bookings.len());
        for id in self.slots.ids() {
            if let Some(slot) = self.slots.snapshot(&id).await {
                events.push(Event::SlotPublished { slot });
            }
        }
        let mut bookings = self.bookings.all();
        bookings.sort_by_key(|b| (b.created_at, b.id));
        events.extend(
            bookings
                .into_iter()
                .map(|booking| Event::BookingRestored { booking }),
        );
        events.extend(
            self.work
                .pending()
                .into_iter()
                .map(|item| Event::WorkRestored { item }),
        );
        events
    }
}
