use ulid::Ulid;

use crate::limits::*;
use crate::model::*;

use super::arbiter::validate_instant;
use super::{Engine, EngineError};

impl Engine {
    pub async fn slot(&self, id: &Ulid) -> Option<Slot> {
        self.slots.snapshot(id).await
    }

    pub fn booking(&self, id: &Ulid) -> Option<Booking> {
        self.bookings.get(id)
    }

    /// A booking joined with its slot, read under the slot lock so the two
    /// halves come from the same commit.
    pub async fn booking_view(&self, id: &Ulid) -> Option<BookingView> {
        let slot_id = self.bookings.get(id)?.slot_id;
        let shared = self.slots.get(&slot_id)?;
        let slot = shared.read().await;
        let booking = self.bookings.get(id)?;
        Some(BookingView {
            booking,
            professor_id: slot.owner_id,
            span: slot.span,
            slot_status: slot.status,
        })
    }

    pub fn bookings_for_slot(&self, slot_id: &Ulid) -> Vec<Booking> {
        self.bookings.for_slot(slot_id)
    }

    pub fn bookings_for_student(&self, student_id: &Ulid) -> Vec<Booking> {
        self.bookings.for_student(student_id)
    }

    /// The pending or confirmed booking holding the slot, if any.
    pub async fn active_booking(&self, slot_id: &Ulid) -> Option<Booking> {
        let shared = self.slots.get(slot_id)?;
        let _slot = shared.read().await;
        self.bookings.active_for_slot(slot_id).into_iter().next()
    }

    /// All of a professor's slots, earliest first.
    pub async fn slots_for_owner(&self, owner_id: &Ulid) -> Vec<Slot> {
        let mut out = Vec::new();
        for id in self.slots.ids_for_owner(owner_id) {
            if let Some(slot) = self.slots.snapshot(&id).await {
                out.push(slot);
            }
        }
        out.sort_by_key(|s| (s.span.start, s.id));
        out
    }

    /// Claimable slots of a professor overlapping `[from, to)`, earliest first.
    pub async fn open_slots(
        &self,
        owner_id: &Ulid,
        from: Ms,
        to: Ms,
        at: Ms,
    ) -> Result<Vec<Slot>, EngineError> {
        validate_instant(from)?;
        validate_instant(to)?;
        validate_instant(at)?;
        if to <= from {
            return Err(EngineError::Validation("query window is empty".into()));
        }
        if to - from > MAX_QUERY_WINDOW_MS {
            return Err(EngineError::LimitExceeded("query window too wide"));
        }
        let window = Span::new(from, to);
        let mut open: Vec<Slot> = self
            .slots_for_owner(owner_id)
            .await
            .into_iter()
            .filter(|s| {
                s.status == SlotStatus::Available && s.span.start > at && s.span.overlaps(&window)
            })
            .collect();
        open.sort_by_key(|s| (s.span.start, s.id));
        Ok(open)
    }

    /// Last instant a confirmed booking can still be cancelled or
    /// rescheduled. `None` when no cutoff applies: pending bookings can be
    /// cancelled up to the start, terminal ones not at all.
    pub async fn cancellation_deadline(&self, booking_id: &Ulid) -> Result<Option<Ms>, EngineError> {
        let slot_id = self
            .bookings
            .get(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?
            .slot_id;
        let shared = self.slots.get(&slot_id).ok_or(EngineError::NotFound(slot_id))?;
        let slot = shared.read().await;
        let booking = self
            .bookings
            .get(booking_id)
            .ok_or(EngineError::NotFound(*booking_id))?;
        Ok((booking.status == BookingStatus::Confirmed)
            .then(|| slot.cancellation_cutoff(self.config.cancellation_notice_ms)))
    }

    /// Confirmed bookings whose slot has ended by `now`.
    pub async fn elapsed_confirmed(&self, now: Ms) -> Vec<Ulid> {
        let mut due = Vec::new();
        for booking in self.bookings.all() {
            if booking.status != BookingStatus::Confirmed {
                continue;
            }
            if let Some(slot) = self.slots.snapshot(&booking.slot_id).await
                && slot.span.end <= now
            {
                due.push(booking.id);
            }
        }
        due.sort();
        due
    }

    /// Check the slot/booking invariants across the whole store. Returns a
    /// description of each violation; empty means consistent.
    pub async fn audit(&self) -> Vec<String> {
        let mut violations = Vec::new();
        for id in self.slots.ids() {
            let Some(shared) = self.slots.get(&id) else {
                continue;
            };
            let slot = shared.read().await;
            let active = self.bookings.active_for_slot(&id);
            if active.len() > 1 {
                violations.push(format!("slot {id} has {} active bookings", active.len()));
            }
            match (slot.status, active.len()) {
                (SlotStatus::Booked, 1) | (SlotStatus::Available, 0) => {}
                (SlotStatus::Completed | SlotStatus::Cancelled, 0) => {}
                (status, n) => {
                    violations.push(format!("slot {id} is {status:?} with {n} active bookings"))
                }
            }
        }
        violations
    }
}
