use tracing::{debug, info};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::observability::{CAS_RETRIES_TOTAL, CLAIMS_TOTAL};

use super::{Engine, EngineError};

pub(crate) fn validate_instant(t: Ms) -> Result<(), EngineError> {
    if !(MIN_VALID_TIMESTAMP_MS..=MAX_VALID_TIMESTAMP_MS).contains(&t) {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    Ok(())
}

pub(crate) fn validate_span(span: &Span) -> Result<(), EngineError> {
    if span.end <= span.start {
        return Err(EngineError::Validation("slot end must be after its start".into()));
    }
    if span.start < MIN_VALID_TIMESTAMP_MS || span.end > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if span.duration_ms() > MAX_SLOT_DURATION_MS {
        return Err(EngineError::LimitExceeded("slot too long"));
    }
    Ok(())
}

/// Can `slot` be claimed at `at`? A started slot is a validation failure,
/// anything not `available` is a lost race.
pub(crate) fn check_claimable(slot: &Slot, at: Ms) -> Result<(), EngineError> {
    if at >= slot.span.start {
        return Err(EngineError::Validation(format!(
            "slot {} has already started",
            slot.id
        )));
    }
    if slot.status != SlotStatus::Available {
        return Err(EngineError::Conflict(slot.id));
    }
    Ok(())
}

impl Engine {
    /// Claim a slot for a student.
    ///
    /// Exactly one of any number of concurrent claims on the same slot
    /// returns a booking; the rest get `Conflict`. The slot flip and the new
    /// pending booking are one journal record, so neither is ever visible
    /// without the other.
    pub async fn claim(
        &self,
        slot_id: Ulid,
        student_id: Ulid,
        requested_at: Ms,
    ) -> Result<Booking, EngineError> {
        let result = {
            let _commit = self.journal.commit_guard().await;
            self.claim_locked(slot_id, student_id, requested_at).await
        };
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.label(),
        };
        metrics::counter!(CLAIMS_TOTAL, "outcome" => outcome).increment(1);
        match &result {
            Ok(b) => debug!("claimed slot {slot_id} for student {student_id}: booking {}", b.id),
            Err(e) => debug!("claim of slot {slot_id} by student {student_id} rejected: {e}"),
        }
        result
    }

    async fn claim_locked(
        &self,
        slot_id: Ulid,
        student_id: Ulid,
        requested_at: Ms,
    ) -> Result<Booking, EngineError> {
        validate_instant(requested_at)?;
        let shared = self
            .slots
            .get(&slot_id)
            .ok_or_else(|| EngineError::Validation(format!("slot {slot_id} does not exist")))?;

        for _ in 0..self.config.cas_retries() {
            let seen = shared.read().await.clone();
            check_claimable(&seen, requested_at)?;

            let mut slot = shared.write().await;
            if slot.version != seen.version {
                drop(slot);
                self.cas_retry(slot_id).await;
                continue;
            }

            let booking = Booking::pending(Ulid::new(), slot_id, student_id, requested_at);
            let work = vec![self.work.item(booking.id, WorkKind::Notice(NoticeKind::Requested))];
            let slot_version = slot.version + 1;
            let event = Event::BookingClaimed {
                booking: booking.clone(),
                slot_version,
                work: work.clone(),
            };
            self.commit(&event).await?;
            self.apply_claim(&mut slot, &booking, slot_version, &work);
            return Ok(booking);
        }
        Err(EngineError::Conflict(slot_id))
    }

    pub(super) async fn cas_retry(&self, slot_id: Ulid) {
        metrics::counter!(CAS_RETRIES_TOTAL).increment(1);
        debug!("slot {slot_id} changed under us, retrying");
        tokio::task::yield_now().await;
    }

    /// Publish a new `available` slot (professor-facing surface).
    pub async fn publish_slot(
        &self,
        id: Ulid,
        owner_id: Ulid,
        span: Span,
        at: Ms,
    ) -> Result<Slot, EngineError> {
        self.publish_slot_with_notice(id, owner_id, span, None, at).await
    }

    /// Like [`Engine::publish_slot`], with the owner's own cancellation
    /// notice for bookings on this slot.
    pub async fn publish_slot_with_notice(
        &self,
        id: Ulid,
        owner_id: Ulid,
        span: Span,
        cancellation_notice_ms: Option<Ms>,
        at: Ms,
    ) -> Result<Slot, EngineError> {
        validate_instant(at)?;
        validate_span(&span)?;
        if let Some(notice) = cancellation_notice_ms {
            if !(0..=MAX_CANCELLATION_NOTICE_MS).contains(&notice) {
                return Err(EngineError::LimitExceeded("cancellation notice out of range"));
            }
        }
        if span.start <= at {
            return Err(EngineError::Validation(
                "slot start must not be in the past".into(),
            ));
        }
        let _commit = self.journal.commit_guard().await;
        if self.slots.len() >= MAX_SLOTS {
            return Err(EngineError::LimitExceeded("too many slots"));
        }
        if self.slots.contains(&id) {
            return Err(EngineError::Validation(format!("slot {id} already exists")));
        }
        let slot = Slot {
            id,
            owner_id,
            span,
            status: SlotStatus::Available,
            version: 0,
            created_at: at,
            cancellation_notice_ms,
        };
        self.commit(&Event::SlotPublished { slot: slot.clone() })
            .await?;
        self.slots.put(slot.clone());
        info!("published slot {id} for professor {owner_id}");
        Ok(slot)
    }

    /// Take an unbooked slot off the market. Its history stays.
    pub async fn withdraw_slot(&self, id: Ulid, actor: Actor, at: Ms) -> Result<Slot, EngineError> {
        validate_instant(at)?;
        let _commit = self.journal.commit_guard().await;
        let shared = self.slots.get(&id).ok_or(EngineError::NotFound(id))?;
        let mut slot = shared.write().await;
        if actor != Actor::Professor(slot.owner_id) {
            return Err(EngineError::Validation(
                "only the slot owner can withdraw a slot".into(),
            ));
        }
        if slot.status != SlotStatus::Available {
            return Err(EngineError::Conflict(id));
        }
        let version = slot.version + 1;
        self.commit(&Event::SlotWithdrawn { id, version }).await?;
        self.apply_withdraw(&mut slot, version);
        info!("withdrew slot {id} at {at}");
        Ok(slot.clone())
    }
}
