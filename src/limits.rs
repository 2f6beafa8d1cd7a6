use crate::model::Ms;

/// 2000-01-01T00:00:00Z
pub const MIN_VALID_TIMESTAMP_MS: Ms = 946_684_800_000;
/// 2100-01-01T00:00:00Z
pub const MAX_VALID_TIMESTAMP_MS: Ms = 4_102_444_800_000;

/// A consultation slot never runs longer than a working day.
pub const MAX_SLOT_DURATION_MS: Ms = 12 * 3_600_000;

pub const MAX_QUERY_WINDOW_MS: Ms = 366 * 24 * 3_600_000;

pub const MAX_SLOTS: usize = 1_000_000;

pub const MAX_REASON_LEN: usize = 2_000;

/// Longest cancellation notice a professor may require.
pub const MAX_CANCELLATION_NOTICE_MS: Ms = 30 * 24 * 3_600_000;

/// Upper bound on configured optimistic retries per claim/transition.
pub const MAX_CAS_RETRIES: u32 = 64;

/// Exponent cap for calendar retry backoff (2^16 * base).
pub const MAX_BACKOFF_EXPONENT: u32 = 16;
