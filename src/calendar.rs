use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

use crate::clock::Clock;
use crate::collab::{CalendarClient, SyncError};
use crate::config::SyncConfig;
use crate::engine::{Engine, EngineError};
use crate::journal::JournalHandle;
use crate::model::*;
use crate::observability::{CALENDAR_PERMANENT_FAILURES_TOTAL, CALENDAR_SYNC_FAILURES_TOTAL};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The collaborator call succeeded and the state was recorded.
    Applied,
    /// Nothing to do: already in the desired state, or nothing to undo.
    NoOp,
    /// The call failed; try again at this instant.
    RetryAt(Ms),
    /// Attempts are exhausted. The booking itself is unaffected.
    Failed,
}

/// Aligns the external calendar with confirmed bookings.
///
/// Owns every `CalendarSyncState`. Calls for one booking are serialized;
/// different bookings reconcile in parallel. No engine lock or journal guard
/// is held across a collaborator call.
pub struct CalendarReconciler {
    states: DashMap<Ulid, CalendarSyncState>,
    in_flight: DashMap<Ulid, Arc<Mutex<()>>>,
    engine: Arc<Engine>,
    client: Arc<dyn CalendarClient>,
    journal: JournalHandle,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

impl CalendarReconciler {
    pub fn new(
        engine: Arc<Engine>,
        client: Arc<dyn CalendarClient>,
        journal: JournalHandle,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        Self {
            states: DashMap::new(),
            in_flight: DashMap::new(),
            engine,
            client,
            journal,
            clock,
            config,
        }
    }

    /// Drive the booking's calendar event toward `action`. Safe to repeat.
    pub async fn reconcile(
        &self,
        booking_id: Ulid,
        action: SyncAction,
    ) -> Result<ReconcileOutcome, EngineError> {
        let lock = self.in_flight.entry(booking_id).or_default().clone();
        let result = {
            let _serial = lock.lock().await;
            self.reconcile_locked(booking_id, action).await
        };
        drop(lock);
        self.in_flight.remove_if(&booking_id, |_, m| Arc::strong_count(m) == 1);
        result
    }

    async fn reconcile_locked(
        &self,
        booking_id: Ulid,
        action: SyncAction,
    ) -> Result<ReconcileOutcome, EngineError> {
        let now = self.clock.now();
        let mut state = self
            .state(&booking_id)
            .unwrap_or_else(|| CalendarSyncState::new(booking_id, now));
        if state.last_action != Some(action) {
            state.retry_count = 0;
            state.next_retry_at = None;
            state.permanently_failed = false;
            state.last_error = None;
        }
        if state.permanently_failed {
            return Ok(ReconcileOutcome::Failed);
        }

        match action {
            SyncAction::Create => {
                if state.external_event_id.is_some() {
                    return Ok(ReconcileOutcome::NoOp);
                }
                let view = self
                    .engine
                    .booking_view(&booking_id)
                    .await
                    .ok_or(EngineError::NotFound(booking_id))?;
                if view.booking.status != BookingStatus::Confirmed {
                    debug!(
                        "calendar create for booking {booking_id} skipped: booking is {}",
                        view.booking.status
                    );
                    return Ok(ReconcileOutcome::NoOp);
                }
                let call = tokio::time::timeout(
                    self.config.call_timeout,
                    self.client.create_event(&view),
                )
                .await
                .unwrap_or(Err(SyncError::Timeout));
                match call {
                    Ok(event_id) => {
                        info!("calendar event {event_id} created for booking {booking_id}");
                        state.external_event_id = Some(event_id);
                        self.succeeded(state, action, now).await
                    }
                    Err(e) => self.failed(state, action, e, now).await,
                }
            }
            SyncAction::Cancel => {
                let Some(event_id) = state.external_event_id.clone() else {
                    if state.last_action == Some(SyncAction::Cancel) {
                        return Ok(ReconcileOutcome::NoOp);
                    }
                    state.last_action = Some(SyncAction::Cancel);
                    state.updated_at = now;
                    self.persist(state).await?;
                    return Ok(ReconcileOutcome::NoOp);
                };
                let call = tokio::time::timeout(
                    self.config.call_timeout,
                    self.client.delete_event(&event_id),
                )
                .await
                .unwrap_or(Err(SyncError::Timeout));
                match call {
                    Ok(()) => {
                        info!("calendar event {event_id} deleted for booking {booking_id}");
                        state.external_event_id = None;
                        self.succeeded(state, action, now).await
                    }
                    Err(e) => self.failed(state, action, e, now).await,
                }
            }
        }
    }

    async fn succeeded(
        &self,
        mut state: CalendarSyncState,
        action: SyncAction,
        now: Ms,
    ) -> Result<ReconcileOutcome, EngineError> {
        state.last_action = Some(action);
        state.retry_count = 0;
        state.next_retry_at = None;
        state.last_error = None;
        state.updated_at = now;
        self.persist(state).await?;
        Ok(ReconcileOutcome::Applied)
    }

    async fn failed(
        &self,
        mut state: CalendarSyncState,
        action: SyncAction,
        err: SyncError,
        now: Ms,
    ) -> Result<ReconcileOutcome, EngineError> {
        metrics::counter!(CALENDAR_SYNC_FAILURES_TOTAL, "action" => action.as_str()).increment(1);
        let booking_id = state.booking_id;
        state.last_action = Some(action);
        state.retry_count += 1;
        state.last_error = Some(err.to_string());
        state.updated_at = now;

        let outcome = if state.retry_count >= self.config.max_attempts {
            state.permanently_failed = true;
            state.next_retry_at = None;
            metrics::counter!(CALENDAR_PERMANENT_FAILURES_TOTAL).increment(1);
            error!(
                "calendar {} for booking {booking_id} failed permanently after {} attempts: {err}",
                action.as_str(),
                state.retry_count
            );
            ReconcileOutcome::Failed
        } else {
            let retry_at = now + self.config.backoff(state.retry_count);
            state.next_retry_at = Some(retry_at);
            warn!(
                "calendar {} for booking {booking_id} failed (attempt {}): {err}; retry at {retry_at}",
                action.as_str(),
                state.retry_count
            );
            ReconcileOutcome::RetryAt(retry_at)
        };
        self.persist(state).await?;
        Ok(outcome)
    }

    async fn persist(&self, state: CalendarSyncState) -> Result<(), EngineError> {
        let _commit = self.journal.commit_guard().await;
        self.journal
            .append(&Event::CalendarSynced {
                state: state.clone(),
            })
            .await?;
        self.states.insert(state.booking_id, state);
        Ok(())
    }

    /// Apply a journal record during startup.
    pub fn restore(&self, event: &Event) {
        if let Event::CalendarSynced { state } = event {
            self.states.insert(state.booking_id, state.clone());
        }
    }

    /// Current state of every booking as records. Caller holds the journal's
    /// exclusive guard.
    pub fn snapshot_events(&self) -> Vec<Event> {
        let mut states: Vec<CalendarSyncState> =
            self.states.iter().map(|e| e.value().clone()).collect();
        states.sort_by_key(|s| s.booking_id);
        states
            .into_iter()
            .map(|state| Event::CalendarSynced { state })
            .collect()
    }

    pub fn state(&self, booking_id: &Ulid) -> Option<CalendarSyncState> {
        self.states.get(booking_id).map(|e| e.value().clone())
    }

    /// Syncs that exhausted their attempts, for operators.
    pub fn failed_syncs(&self) -> Vec<CalendarSyncState> {
        let mut failed: Vec<CalendarSyncState> = self
            .states
            .iter()
            .filter(|e| e.value().permanently_failed)
            .map(|e| e.value().clone())
            .collect();
        failed.sort_by_key(|s| (s.updated_at, s.booking_id));
        failed
    }
}
