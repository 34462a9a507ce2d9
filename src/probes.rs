//! Component health probes used by the recovery orchestrator.
//!
//! Each hot-path component exposes a probe with three capabilities: a quick
//! health check, a readiness-restore attempt, and the monotonic time of its
//! last good update. The orchestrator drives these per recovery stage.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use crate::config::ResilienceConfig;

/// Result of a health check.
#[derive(Debug, Clone)]
pub struct HealthSignal {
    pub healthy: bool,
    pub latency_ms: Option<f64>,
    pub message: Option<String>,
    pub timestamp_mono: Instant,
}

impl HealthSignal {
    fn new(healthy: bool, latency: Duration, message: Option<String>) -> Self {
        Self {
            healthy,
            latency_ms: Some(latency.as_secs_f64() * 1000.0),
            message,
            timestamp_mono: Instant::now(),
        }
    }
}

/// Probe capability set for one component.
#[async_trait]
pub trait ComponentProbe: Send + Sync {
    /// Quick health check for recovery orchestration.
    async fn health_check(&self) -> HealthSignal;

    /// Attempt to restore ready state. Returns whether it succeeded.
    async fn ensure_ready(&self) -> bool;

    /// Monotonic timestamp of the last successful update.
    fn last_update_mono(&self) -> Instant;
}

/// Broker connection probe. The broker connector flips `set_connected` as
/// its session goes up and down.
pub struct BrokerProbe {
    connected: AtomicBool,
    last_update_mono: Mutex<Instant>,
}

impl BrokerProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connected: AtomicBool::new(false),
            last_update_mono: Mutex::new(Instant::now()),
        })
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if connected {
            *self.last_update_mono.lock() = Instant::now();
        }
    }
}

#[async_trait]
impl ComponentProbe for BrokerProbe {
    async fn health_check(&self) -> HealthSignal {
        let start = Instant::now();
        let healthy = self.connected.load(Ordering::SeqCst);
        if healthy {
            *self.last_update_mono.lock() = Instant::now();
        }
        debug!(healthy, "Broker health check");
        HealthSignal::new(
            healthy,
            start.elapsed(),
            (!healthy).then(|| "Broker connection down".to_string()),
        )
    }

    async fn ensure_ready(&self) -> bool {
        // Reconnection is owned by the broker session itself; the probe can
        // only report whether it has come back.
        self.connected.load(Ordering::SeqCst)
    }

    fn last_update_mono(&self) -> Instant {
        *self.last_update_mono.lock()
    }
}

/// Market data freshness probe: healthy while the last tick is younger than
/// the configured staleness threshold.
pub struct MarketDataProbe {
    stale_after: Duration,
    last_tick_mono: Mutex<Instant>,
}

impl MarketDataProbe {
    pub fn new(config: &ResilienceConfig) -> Arc<Self> {
        Arc::new(Self {
            stale_after: Duration::from_millis(config.market_data_cache_stale_ms),
            last_tick_mono: Mutex::new(Instant::now()),
        })
    }

    /// Called by the feed on every accepted tick.
    pub fn record_tick(&self) {
        *self.last_tick_mono.lock() = Instant::now();
    }
}

#[async_trait]
impl ComponentProbe for MarketDataProbe {
    async fn health_check(&self) -> HealthSignal {
        let start = Instant::now();
        let age = self.last_tick_mono.lock().elapsed();
        let healthy = age < self.stale_after;
        debug!(healthy, age_ms = age.as_millis() as u64, "Market data health check");
        HealthSignal::new(
            healthy,
            start.elapsed(),
            (!healthy).then(|| format!("Market data stale for {}ms", age.as_millis())),
        )
    }

    async fn ensure_ready(&self) -> bool {
        self.last_tick_mono.lock().elapsed() < self.stale_after
    }

    fn last_update_mono(&self) -> Instant {
        *self.last_tick_mono.lock()
    }
}

/// Risk engine probe. The risk engine marks itself responsive after each
/// completed evaluation cycle.
pub struct RiskProbe {
    responsive: AtomicBool,
    last_update_mono: Mutex<Instant>,
}

impl RiskProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            responsive: AtomicBool::new(true),
            last_update_mono: Mutex::new(Instant::now()),
        })
    }

    pub fn set_responsive(&self, responsive: bool) {
        self.responsive.store(responsive, Ordering::SeqCst);
        if responsive {
            *self.last_update_mono.lock() = Instant::now();
        }
    }
}

#[async_trait]
impl ComponentProbe for RiskProbe {
    async fn health_check(&self) -> HealthSignal {
        let start = Instant::now();
        let healthy = self.responsive.load(Ordering::SeqCst);
        if healthy {
            *self.last_update_mono.lock() = Instant::now();
        }
        debug!(healthy, "Risk engine health check");
        HealthSignal::new(
            healthy,
            start.elapsed(),
            (!healthy).then(|| "Risk engine timeout".to_string()),
        )
    }

    async fn ensure_ready(&self) -> bool {
        self.responsive.load(Ordering::SeqCst)
    }

    fn last_update_mono(&self) -> Instant {
        *self.last_update_mono.lock()
    }
}
