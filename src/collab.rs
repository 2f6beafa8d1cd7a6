use async_trait::async_trait;
use tracing::info;

use crate::model::{BookingView, NotificationPayload};

/// Failure of an external collaborator call. Never reaches booking callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// The collaborator refused the request.
    Rejected(String),
    /// The collaborator could not be reached.
    Unavailable(String),
    /// The call did not finish within the configured timeout.
    Timeout,
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncError::Rejected(msg) => write!(f, "rejected: {msg}"),
            SyncError::Unavailable(msg) => write!(f, "unavailable: {msg}"),
            SyncError::Timeout => write!(f, "timed out"),
        }
    }
}

impl std::error::Error for SyncError {}

/// External calendar. Only the shape matters; the transport is the
/// implementor's business.
#[async_trait]
pub trait CalendarClient: Send + Sync {
    /// Returns the external event id.
    async fn create_event(&self, view: &BookingView) -> Result<String, SyncError>;

    async fn delete_event(&self, external_event_id: &str) -> Result<(), SyncError>;
}

/// External notification sender (email, push, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), SyncError>;
}

/// Calendar that only logs. Used by the daemon when no real calendar is wired in.
#[derive(Debug, Default)]
pub struct LoggingCalendar;

#[async_trait]
impl CalendarClient for LoggingCalendar {
    async fn create_event(&self, view: &BookingView) -> Result<String, SyncError> {
        let event_id = format!("evt-{}", view.booking.id);
        let json = serde_json::to_string(view).map_err(|e| SyncError::Rejected(e.to_string()))?;
        info!("calendar create {event_id}: {json}");
        Ok(event_id)
    }

    async fn delete_event(&self, external_event_id: &str) -> Result<(), SyncError> {
        info!("calendar delete {external_event_id}");
        Ok(())
    }
}

/// Notifier that only logs.
#[derive(Debug, Default)]
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), SyncError> {
        let json =
            serde_json::to_string(payload).map_err(|e| SyncError::Rejected(e.to_string()))?;
        info!("notify {}: {json}", payload.idempotency_key);
        Ok(())
    }
}
