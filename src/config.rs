use std::path::PathBuf;
use std::time::Duration;

use crate::limits::{MAX_BACKOFF_EXPONENT, MAX_CAS_RETRIES};
use crate::model::Ms;

const HOUR_MS: Ms = 3_600_000;
const DAY_MS: Ms = 24 * HOUR_MS;

/// When the upcoming-consultation reminder fires relative to the slot start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReminderPolicy {
    /// Fixed lead time before the start.
    Lead(Ms),
    /// At a fixed UTC time of day (ms since midnight) on the day before the start.
    DayBeforeAt(Ms),
}

impl ReminderPolicy {
    pub fn fire_at(&self, slot_start: Ms) -> Ms {
        match *self {
            ReminderPolicy::Lead(lead) => slot_start.saturating_sub(lead),
            ReminderPolicy::DayBeforeAt(time_of_day) => {
                let midnight = slot_start.div_euclid(DAY_MS) * DAY_MS;
                midnight - DAY_MS + time_of_day
            }
        }
    }
}

/// Policy for the booking engine. Passed in at construction, never read from
/// process state.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Confirmed bookings can't be cancelled or rescheduled closer than this to the start.
    pub cancellation_notice_ms: Ms,
    pub reminder_policy: ReminderPolicy,
    /// Optimistic version retries before a claim/transition gives up with a conflict.
    pub max_cas_retries: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cancellation_notice_ms: 4 * HOUR_MS,
            reminder_policy: ReminderPolicy::Lead(DAY_MS),
            max_cas_retries: 8,
        }
    }
}

impl EngineConfig {
    pub fn cas_retries(&self) -> u32 {
        self.max_cas_retries.clamp(1, MAX_CAS_RETRIES)
    }
}

/// Retry policy for calendar collaborator calls.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Attempts (including the first) before a sync is marked permanently failed.
    pub max_attempts: u32,
    pub base_backoff_ms: Ms,
    pub max_backoff_ms: Ms,
    /// Bound on every collaborator call. Expiry counts as a failure.
    pub call_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff_ms: 1_000,
            max_backoff_ms: 300_000,
            call_timeout: Duration::from_secs(10),
        }
    }
}

impl SyncConfig {
    /// Delay before retry number `failures` (1-based): base * 2^(failures-1), capped.
    pub fn backoff(&self, failures: u32) -> Ms {
        let exponent = failures.saturating_sub(1).min(MAX_BACKOFF_EXPONENT);
        self.base_backoff_ms
            .saturating_mul(1 << exponent)
            .min(self.max_backoff_ms)
    }
}

/// Everything the daemon needs to run the engine and its background tasks.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub workers: usize,
    pub sweep_interval: Duration,
    pub drain_interval: Duration,
    /// Idle poll for deferred work when no wakeup arrives.
    pub worker_poll_interval: Duration,
    /// How often the compactor checks the journal against `compact_threshold`.
    pub compact_interval: Duration,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub engine: EngineConfig,
    pub sync: SyncConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            workers: 4,
            sweep_interval: Duration::from_secs(30),
            drain_interval: Duration::from_secs(15),
            worker_poll_interval: Duration::from_millis(500),
            compact_interval: Duration::from_secs(60),
            compact_threshold: 1000,
            metrics_port: None,
            engine: EngineConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// A non-negative minute count as milliseconds. `None` if it doesn't fit.
fn minutes_to_ms(minutes: Ms) -> Option<Ms> {
    minutes.checked_mul(60_000).filter(|ms| *ms >= 0)
}

impl ServiceConfig {
    /// Read `SLOTBOOK_*` variables, falling back to defaults. Only the binary calls this.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(dir) = std::env::var("SLOTBOOK_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        cfg.metrics_port = env_parse("SLOTBOOK_METRICS_PORT");
        if let Some(n) = env_parse::<usize>("SLOTBOOK_WORKERS") {
            cfg.workers = n.max(1);
        }
        if let Some(s) = env_parse("SLOTBOOK_SWEEP_SECS") {
            cfg.sweep_interval = Duration::from_secs(s);
        }
        if let Some(s) = env_parse("SLOTBOOK_DRAIN_SECS") {
            cfg.drain_interval = Duration::from_secs(s);
        }
        if let Some(s) = env_parse("SLOTBOOK_COMPACT_SECS") {
            cfg.compact_interval = Duration::from_secs(s);
        }
        if let Some(n) = env_parse("SLOTBOOK_COMPACT_THRESHOLD") {
            cfg.compact_threshold = n;
        }
        if let Some(ms) = env_parse("SLOTBOOK_CANCEL_NOTICE_MINUTES").and_then(minutes_to_ms) {
            cfg.engine.cancellation_notice_ms = ms;
        }
        if let Some(ms) = env_parse("SLOTBOOK_REMINDER_LEAD_MINUTES").and_then(minutes_to_ms) {
            cfg.engine.reminder_policy = ReminderPolicy::Lead(ms);
        }
        if let Some(n) = env_parse("SLOTBOOK_SYNC_MAX_ATTEMPTS") {
            cfg.sync.max_attempts = n;
        }
        if let Some(ms) = env_parse("SLOTBOOK_SYNC_BASE_BACKOFF_MS") {
            cfg.sync.base_backoff_ms = ms;
        }
        if let Some(ms) = env_parse("SLOTBOOK_SYNC_MAX_BACKOFF_MS") {
            cfg.sync.max_backoff_ms = ms;
        }
        if let Some(ms) = env_parse("SLOTBOOK_CALL_TIMEOUT_MS") {
            cfg.sync.call_timeout = Duration::from_millis(ms);
        }
        cfg
    }
}
