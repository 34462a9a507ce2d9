//! Resilience layer configuration.
//!
//! All knobs come from the environment with production defaults, matching
//! the rest of the backend. No config-file parsing.

use std::path::PathBuf;

fn env_u32(var: &str, default: u32) -> u32 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_u64(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default)
}

fn env_f64(var: &str, default: f64) -> f64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(default)
}

/// Tunables for breakers, mode dwell, the event bus, the DB buffer and the
/// reconciler schedules.
#[derive(Debug, Clone)]
pub struct ResilienceConfig {
    /// Consecutive failures before an UNSTABLE breaker trips.
    pub fail_threshold_count: u32,
    /// Sustained failure window (seconds) before an UNSTABLE breaker trips.
    pub fail_threshold_seconds: f64,
    /// Minimum dwell (seconds) in SAFE_MODE / HALT before a lower-severity
    /// transition is allowed.
    pub min_safe_mode_seconds: f64,
    /// Stable period (seconds) required in the READY recovery stage.
    pub recovery_stable_seconds: f64,
    /// Stage-check failures tolerated before recovery aborts.
    pub recovery_stage_max_retries: u32,
    /// Event bus publish capacity.
    pub event_bus_queue_size: usize,
    /// Position cache staleness threshold (milliseconds).
    pub position_cache_stale_ms: u64,
    /// Market data cache staleness threshold (milliseconds).
    pub market_data_cache_stale_ms: u64,
    /// DB buffer entry cap.
    pub db_buffer_max_entries: usize,
    /// DB buffer serialized-payload byte cap.
    pub db_buffer_max_bytes: usize,
    /// Outbox worker: attempts before an event is marked DEAD.
    pub outbox_max_attempts: u32,
    /// Outbox worker poll interval (seconds) when the queue is empty.
    pub outbox_poll_seconds: f64,
    /// DONE/DEAD outbox retention (days) for the daily cleanup.
    pub outbox_retention_days: u32,
    /// Fallback log for dropped bus events (JSONL).
    pub fallback_log_path: Option<PathBuf>,
    /// DB buffer WAL file (JSONL).
    pub wal_path: Option<PathBuf>,
    /// SQLite database for orders / close requests / positions / outbox.
    pub database_path: String,
}

impl ResilienceConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./sentinel.db".to_string());
        let fallback_log_path = std::env::var("FALLBACK_LOG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./sentinel_fallback.jsonl"));
        let wal_path = std::env::var("DB_BUFFER_WAL_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./sentinel_buffer.wal"));

        Self {
            fail_threshold_count: env_u32("FAIL_THRESHOLD_COUNT", 3),
            fail_threshold_seconds: env_f64("FAIL_THRESHOLD_SECONDS", 10.0),
            min_safe_mode_seconds: env_f64("MIN_SAFE_MODE_SECONDS", 60.0),
            recovery_stable_seconds: env_f64("RECOVERY_STABLE_SECONDS", 30.0),
            recovery_stage_max_retries: env_u32("RECOVERY_STAGE_MAX_RETRIES", 3),
            event_bus_queue_size: env_u64("EVENT_BUS_QUEUE_SIZE", 10_000) as usize,
            position_cache_stale_ms: env_u64("POSITION_CACHE_STALE_MS", 30_000),
            market_data_cache_stale_ms: env_u64("MARKET_DATA_CACHE_STALE_MS", 10_000),
            db_buffer_max_entries: env_u64("DB_BUFFER_MAX_ENTRIES", 10_000) as usize,
            db_buffer_max_bytes: env_u64("DB_BUFFER_MAX_BYTES", 50 * 1024 * 1024) as usize,
            outbox_max_attempts: env_u32("OUTBOX_MAX_ATTEMPTS", 5),
            outbox_poll_seconds: env_f64("OUTBOX_POLL_SECONDS", 1.0),
            outbox_retention_days: env_u32("OUTBOX_RETENTION_DAYS", 7),
            fallback_log_path: Some(fallback_log_path),
            wal_path: Some(wal_path),
            database_path,
        }
    }
}

impl Default for ResilienceConfig {
    /// Production defaults with file side effects disabled; tests and
    /// embedders opt into paths explicitly.
    fn default() -> Self {
        Self {
            fail_threshold_count: 3,
            fail_threshold_seconds: 10.0,
            min_safe_mode_seconds: 60.0,
            recovery_stable_seconds: 30.0,
            recovery_stage_max_retries: 3,
            event_bus_queue_size: 10_000,
            position_cache_stale_ms: 30_000,
            market_data_cache_stale_ms: 10_000,
            db_buffer_max_entries: 10_000,
            db_buffer_max_bytes: 50 * 1024 * 1024,
            outbox_max_attempts: 5,
            outbox_poll_seconds: 1.0,
            outbox_retention_days: 7,
            fallback_log_path: None,
            wal_path: None,
            database_path: ":memory:".to_string(),
        }
    }
}

/// Reconciler schedule constants. These are contract values, not tunables.
pub const ZOMBIE_THRESHOLD_MINUTES: i64 = 2;
pub const STUCK_THRESHOLD_MINUTES: i64 = 10;
pub const MAX_NOT_FOUND_RETRIES: u32 = 3;

/// Reconciler job periods (seconds).
pub const ZOMBIE_JOB_PERIOD_SECS: u64 = 60;
pub const STUCK_JOB_PERIOD_SECS: u64 = 300;
pub const PARTIAL_RETRY_JOB_PERIOD_SECS: u64 = 120;
pub const INVARIANT_JOB_PERIOD_SECS: u64 = 600;
/// Outbox cleanup runs daily, aligned to 03:00 local at startup.
pub const OUTBOX_CLEANUP_HOUR_LOCAL: u32 = 3;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = ResilienceConfig::default();
        assert_eq!(config.fail_threshold_count, 3);
        assert_eq!(config.fail_threshold_seconds, 10.0);
        assert_eq!(config.min_safe_mode_seconds, 60.0);
        assert_eq!(config.recovery_stable_seconds, 30.0);
        assert_eq!(config.event_bus_queue_size, 10_000);
        assert_eq!(config.db_buffer_max_entries, 10_000);
        assert_eq!(config.db_buffer_max_bytes, 50 * 1024 * 1024);
    }
}
