use tracing::{debug, info};
use ulid::Ulid;

use crate::config::EngineConfig;
use crate::limits::MAX_REASON_LEN;
use crate::model::*;
use crate::observability::TRANSITIONS_TOTAL;

use super::arbiter::{check_claimable, validate_instant};
use super::{Engine, EngineError};

/// The outcome of a legal transition, computed before anything is locked
/// for writing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub status: BookingStatus,
    pub slot_status: SlotStatus,
    pub cancelled_by: Option<Actor>,
    pub reason: Option<String>,
    pub reminder_key: Option<String>,
    pub work: Vec<WorkKind>,
}

fn is_owner(actor: Actor, slot: &Slot) -> bool {
    actor == Actor::Professor(slot.owner_id)
}

fn is_party(actor: Actor, booking: &Booking, slot: &Slot) -> bool {
    is_owner(actor, slot) || actor == Actor::Student(booking.student_id)
}

/// Decide what `action` does to `booking`, or why it can't.
///
/// Pure: same inputs, same answer. For `Reschedule` this is the plan for
/// the old booking only; the replacement is built by the caller.
pub fn plan_transition(
    booking: &Booking,
    slot: &Slot,
    action: &Action,
    actor: Actor,
    at: Ms,
    config: &EngineConfig,
) -> Result<Plan, EngineError> {
    let illegal = || EngineError::StateTransition {
        from: booking.status,
        action: action.kind(),
    };
    let cutoff = slot.cancellation_cutoff(config.cancellation_notice_ms);

    match action {
        Action::Confirm => {
            if booking.status != BookingStatus::Pending {
                return Err(illegal());
            }
            if !is_owner(actor, slot) {
                return Err(EngineError::Validation(
                    "only the slot owner can confirm a booking".into(),
                ));
            }
            let mut work = Vec::with_capacity(3);
            let mut key = None;
            if at < slot.span.start {
                let kind = ReminderKind::Upcoming;
                let fire_at = config.reminder_policy.fire_at(slot.span.start).max(at);
                work.push(WorkKind::ScheduleReminder { kind, fire_at });
                key = Some(reminder_key(booking.id, kind));
            }
            work.push(WorkKind::Calendar(SyncAction::Create));
            work.push(WorkKind::Notice(NoticeKind::Confirmed));
            Ok(Plan {
                status: BookingStatus::Confirmed,
                slot_status: SlotStatus::Booked,
                cancelled_by: None,
                reason: None,
                reminder_key: key,
                work,
            })
        }
        Action::Cancel { reason } => {
            let work = match booking.status {
                BookingStatus::Pending => vec![WorkKind::Notice(NoticeKind::Cancelled)],
                BookingStatus::Confirmed if at < cutoff => vec![
                    WorkKind::CancelReminders,
                    WorkKind::Calendar(SyncAction::Cancel),
                    WorkKind::Notice(NoticeKind::Cancelled),
                ],
                _ => return Err(illegal()),
            };
            if !is_party(actor, booking, slot) {
                return Err(EngineError::Validation(
                    "only the student or the slot owner can cancel a booking".into(),
                ));
            }
            let reason = reason
                .as_deref()
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_owned);
            if reason.as_ref().is_some_and(|r| r.len() > MAX_REASON_LEN) {
                return Err(EngineError::LimitExceeded("cancellation reason too long"));
            }
            Ok(Plan {
                status: BookingStatus::Cancelled,
                slot_status: SlotStatus::Available,
                cancelled_by: Some(actor),
                reason,
                reminder_key: None,
                work,
            })
        }
        Action::Reschedule { .. } => {
            if booking.status != BookingStatus::Confirmed || at >= cutoff {
                return Err(illegal());
            }
            if !is_party(actor, booking, slot) {
                return Err(EngineError::Validation(
                    "only the student or the slot owner can reschedule a booking".into(),
                ));
            }
            Ok(Plan {
                status: BookingStatus::Cancelled,
                slot_status: SlotStatus::Available,
                cancelled_by: Some(actor),
                reason: Some("rescheduled".into()),
                reminder_key: None,
                work: vec![
                    WorkKind::CancelReminders,
                    WorkKind::Calendar(SyncAction::Cancel),
                ],
            })
        }
        Action::Elapse => {
            if booking.status != BookingStatus::Confirmed || at < slot.span.end {
                return Err(illegal());
            }
            let status = if booking.attended {
                BookingStatus::Completed
            } else {
                BookingStatus::NoShow
            };
            Ok(Plan {
                status,
                slot_status: SlotStatus::Completed,
                cancelled_by: None,
                reason: None,
                reminder_key: None,
                work: Vec::new(),
            })
        }
    }
}

impl Engine {
    /// Apply a lifecycle action to a booking.
    ///
    /// Returns the booking after the transition. For `Reschedule` that is the
    /// new pending booking on the target slot; the old one is cancelled in
    /// the same record.
    pub async fn transition(
        &self,
        booking_id: Ulid,
        action: Action,
        actor: Actor,
        at: Ms,
    ) -> Result<Booking, EngineError> {
        let kind = action.kind();
        let result = {
            let _commit = self.journal.commit_guard().await;
            match action {
                Action::Reschedule { new_slot_id } => {
                    self.reschedule(booking_id, new_slot_id, actor, at).await
                }
                action => self.transition_locked(booking_id, &action, actor, at).await,
            }
        };
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        metrics::counter!(TRANSITIONS_TOTAL, "action" => kind.as_str(), "outcome" => outcome)
            .increment(1);
        match &result {
            Ok(b) => info!(
                "booking {booking_id}: {} -> {} ({})",
                kind.as_str(),
                b.status,
                b.id
            ),
            Err(e) => debug!("booking {booking_id}: {} rejected: {e}", kind.as_str()),
        }
        result
    }

    async fn transition_locked(
        &self,
        booking_id: Ulid,
        action: &Action,
        actor: Actor,
        at: Ms,
    ) -> Result<Booking, EngineError> {
        validate_instant(at)?;
        let slot_id = self
            .bookings
            .get(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?
            .slot_id;
        let shared = self
            .slots
            .get(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;

        for _ in 0..self.config.cas_retries() {
            let (seen, booking) = {
                let guard = shared.read().await;
                let booking = self
                    .bookings
                    .get(&booking_id)
                    .ok_or(EngineError::NotFound(booking_id))?;
                (guard.clone(), booking)
            };
            let plan = plan_transition(&booking, &seen, action, actor, at, &self.config)?;

            let mut slot = shared.write().await;
            if slot.version != seen.version {
                drop(slot);
                self.cas_retry(slot_id).await;
                continue;
            }

            let work = self.items(booking_id, plan.work);
            let slot_version = slot.version + 1;
            let event = Event::BookingTransitioned {
                id: booking_id,
                status: plan.status,
                at,
                cancelled_by: plan.cancelled_by,
                reason: plan.reason.clone(),
                reminder_key: plan.reminder_key.clone(),
                slot_status: plan.slot_status,
                slot_version,
                work: work.clone(),
            };
            self.commit(&event).await?;
            self.apply_transition(
                &mut slot,
                booking_id,
                plan.status,
                at,
                plan.cancelled_by,
                plan.reason.as_ref(),
                plan.reminder_key.as_ref(),
                plan.slot_status,
                slot_version,
                &work,
            );
            return self
                .bookings
                .get(&booking_id)
                .ok_or(EngineError::NotFound(booking_id));
        }
        Err(EngineError::Conflict(slot_id))
    }

    /// Cancel the old booking and claim the new slot as one record.
    /// Both slot locks are taken in id order.
    async fn reschedule(
        &self,
        booking_id: Ulid,
        new_slot_id: Ulid,
        actor: Actor,
        at: Ms,
    ) -> Result<Booking, EngineError> {
        validate_instant(at)?;
        let old_slot_id = self
            .bookings
            .get(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?
            .slot_id;
        let old_shared = self
            .slots
            .get(&old_slot_id)
            .ok_or(EngineError::NotFound(old_slot_id))?;
        let action = Action::Reschedule { new_slot_id };
        {
            let guard = old_shared.read().await;
            let booking = self
                .bookings
                .get(&booking_id)
                .ok_or(EngineError::NotFound(booking_id))?;
            plan_transition(&booking, &guard, &action, actor, at, &self.config)?;
        }
        if old_slot_id == new_slot_id {
            return Err(EngineError::Validation(
                "cannot reschedule onto the same slot".into(),
            ));
        }
        let new_shared = self.slots.get(&new_slot_id).ok_or_else(|| {
            EngineError::Validation(format!("slot {new_slot_id} does not exist"))
        })?;

        for _ in 0..self.config.cas_retries() {
            let (seen_old, booking) = {
                let guard = old_shared.read().await;
                let booking = self
                    .bookings
                    .get(&booking_id)
                    .ok_or(EngineError::NotFound(booking_id))?;
                (guard.clone(), booking)
            };
            let seen_new = new_shared.read().await.clone();
            let plan = plan_transition(&booking, &seen_old, &action, actor, at, &self.config)?;
            if seen_new.owner_id != seen_old.owner_id {
                return Err(EngineError::Validation(
                    "cannot reschedule onto another professor's slot".into(),
                ));
            }
            check_claimable(&seen_new, at)?;

            let (mut old_slot, mut new_slot) = if old_slot_id < new_slot_id {
                let old = old_shared.clone().write_owned().await;
                let new = new_shared.clone().write_owned().await;
                (old, new)
            } else {
                let new = new_shared.clone().write_owned().await;
                let old = old_shared.clone().write_owned().await;
                (old, new)
            };
            if old_slot.version != seen_old.version || new_slot.version != seen_new.version {
                drop((old_slot, new_slot));
                self.cas_retry(new_slot_id).await;
                continue;
            }

            let new_booking = Booking::pending(Ulid::new(), new_slot_id, booking.student_id, at);
            let mut work = self.items(booking_id, plan.work);
            work.push(
                self.work
                    .item(new_booking.id, WorkKind::Notice(NoticeKind::Rescheduled)),
            );
            let old_slot_version = old_slot.version + 1;
            let new_slot_version = new_slot.version + 1;
            let event = Event::BookingRescheduled {
                old_id: booking_id,
                at,
                cancelled_by: actor,
                old_slot_version,
                new_booking: new_booking.clone(),
                new_slot_version,
                work: work.clone(),
            };
            self.commit(&event).await?;
            self.apply_reschedule(
                &mut old_slot,
                &mut new_slot,
                booking_id,
                at,
                actor,
                old_slot_version,
                &new_booking,
                new_slot_version,
                &work,
            );
            return Ok(new_booking);
        }
        Err(EngineError::Conflict(new_slot_id))
    }

    /// Record that a confirmed consultation took place. Only the slot owner
    /// may do this, and only once the slot has started. Idempotent.
    pub async fn mark_attended(
        &self,
        booking_id: Ulid,
        actor: Actor,
        at: Ms,
    ) -> Result<Booking, EngineError> {
        validate_instant(at)?;
        let _commit = self.journal.commit_guard().await;
        let slot_id = self
            .bookings
            .get(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?
            .slot_id;
        let shared = self
            .slots
            .get(&slot_id)
            .ok_or(EngineError::NotFound(slot_id))?;

        let mut slot = shared.write().await;
        let booking = self
            .bookings
            .get(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))?;
        if booking.status != BookingStatus::Confirmed {
            return Err(EngineError::Validation(format!(
                "attendance can only be marked on a confirmed booking, not {}",
                booking.status
            )));
        }
        if !is_owner(actor, &slot) {
            return Err(EngineError::Validation(
                "only the slot owner can mark attendance".into(),
            ));
        }
        if at < slot.span.start {
            return Err(EngineError::Validation(
                "attendance can't be marked before the slot starts".into(),
            ));
        }
        if booking.attended {
            return Ok(booking);
        }
        let slot_version = slot.version + 1;
        self.commit(&Event::AttendanceMarked {
            id: booking_id,
            slot_version,
        })
        .await?;
        self.apply_attendance(&mut slot, booking_id, slot_version);
        info!("booking {booking_id}: attendance marked");
        self.bookings
            .get(&booking_id)
            .ok_or(EngineError::NotFound(booking_id))
    }

    fn items(&self, booking_id: Ulid, kinds: Vec<WorkKind>) -> Vec<WorkItem> {
        kinds
            .into_iter()
            .map(|kind| self.work.item(booking_id, kind))
            .collect()
    }
}
