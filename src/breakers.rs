//! Circuit breakers with hysteresis for component health tracking.
//!
//! A breaker watches one component and debounces its failures before the
//! central state service is allowed to react:
//! HEALTHY -> UNSTABLE on first failure, UNSTABLE -> TRIPPED once either
//! `fail_threshold_count` consecutive failures or `fail_threshold_seconds`
//! of sustained failure accumulate. Success resets to HEALTHY.
//!
//! Local can only tighten: `effective_level` never yields a level less
//! restrictive than the breaker's own.

use std::time::Instant;

use parking_lot::Mutex;
use serde_json::json;
use tracing::debug;

use crate::config::ResilienceConfig;
use crate::models::{
    ComponentSource, EventType, ReasonCode, Severity, SystemEvent, SystemLevel,
};

#[derive(Debug, Clone)]
struct BreakerState {
    level: SystemLevel,
    failure_count: u32,
    first_failure_mono: Option<Instant>,
    last_success_mono: Option<Instant>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            level: SystemLevel::Healthy,
            failure_count: 0,
            first_failure_mono: None,
            last_success_mono: None,
        }
    }
}

/// Per-component circuit breaker.
///
/// The specialized breakers (broker, market data, risk, DB) differ only in
/// the reason codes they emit; use the named constructors.
pub struct CircuitBreaker {
    source: ComponentSource,
    fail_threshold_count: u32,
    fail_threshold_seconds: f64,
    trip_reason_code: ReasonCode,
    recovery_reason_code: ReasonCode,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(
        source: ComponentSource,
        config: &ResilienceConfig,
        trip_reason_code: ReasonCode,
        recovery_reason_code: ReasonCode,
    ) -> Self {
        Self {
            source,
            fail_threshold_count: config.fail_threshold_count,
            fail_threshold_seconds: config.fail_threshold_seconds,
            trip_reason_code,
            recovery_reason_code,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Broker connectivity: trips with BROKER_DISCONNECT, recovers with
    /// BROKER_RECONNECTED (which drives the state service into RECOVERING).
    pub fn broker(config: &ResilienceConfig) -> Self {
        Self::new(
            ComponentSource::Broker,
            config,
            ReasonCode::BrokerDisconnect,
            ReasonCode::BrokerReconnected,
        )
    }

    /// Market data staleness: trips with MD_STALE.
    pub fn market_data(config: &ResilienceConfig) -> Self {
        Self::new(
            ComponentSource::MarketData,
            config,
            ReasonCode::MdStale,
            ReasonCode::AllHealthy,
        )
    }

    /// Risk engine responsiveness: trips with RISK_TIMEOUT.
    pub fn risk(config: &ResilienceConfig) -> Self {
        Self::new(
            ComponentSource::Risk,
            config,
            ReasonCode::RiskTimeout,
            ReasonCode::AllHealthy,
        )
    }

    /// Database writes: trips with DB_WRITE_FAIL.
    pub fn db(config: &ResilienceConfig) -> Self {
        Self::new(
            ComponentSource::Db,
            config,
            ReasonCode::DbWriteFail,
            ReasonCode::AllHealthy,
        )
    }

    pub fn source(&self) -> ComponentSource {
        self.source
    }

    pub fn level(&self) -> SystemLevel {
        self.state.lock().level
    }

    pub fn is_tripped(&self) -> bool {
        self.state.lock().level == SystemLevel::Tripped
    }

    pub fn failure_count(&self) -> u32 {
        self.state.lock().failure_count
    }

    /// Record a failure. Returns the event to publish if the level changed.
    ///
    /// HEALTHY -> UNSTABLE emits QUALITY_DEGRADED (WARNING); UNSTABLE ->
    /// TRIPPED emits FAIL_CRIT (CRITICAL); repeated failures while TRIPPED
    /// stay silent.
    pub fn record_failure(&self) -> Option<SystemEvent> {
        let now = Instant::now();
        let mut state = self.state.lock();

        state.failure_count += 1;
        if state.first_failure_mono.is_none() {
            state.first_failure_mono = Some(now);
        }

        match state.level {
            SystemLevel::Healthy => {
                state.level = SystemLevel::Unstable;
                debug!(
                    source = self.source.as_str(),
                    failures = state.failure_count,
                    "Breaker unstable"
                );
                Some(self.degraded_event(&state))
            }
            SystemLevel::Unstable => {
                if self.trip_conditions_met(&state, now) {
                    state.level = SystemLevel::Tripped;
                    debug!(
                        source = self.source.as_str(),
                        failures = state.failure_count,
                        "Breaker tripped"
                    );
                    Some(self.trip_event(&state))
                } else {
                    None
                }
            }
            SystemLevel::Tripped => None,
        }
    }

    /// Record a success. Resets to HEALTHY; returns a RECOVERED event only
    /// when the breaker was previously non-HEALTHY.
    pub fn record_success(&self) -> Option<SystemEvent> {
        let mut state = self.state.lock();
        let old_level = state.level;

        state.level = SystemLevel::Healthy;
        state.failure_count = 0;
        state.first_failure_mono = None;
        state.last_success_mono = Some(Instant::now());

        if old_level != SystemLevel::Healthy {
            debug!(source = self.source.as_str(), "Breaker recovered");
            Some(self.recovery_event())
        } else {
            None
        }
    }

    /// Merge the local level with the central policy level, taking the more
    /// restrictive of the two. The gate never widens permissions below
    /// local protection.
    pub fn effective_level(&self, central_level: SystemLevel) -> SystemLevel {
        let local = self.state.lock().level;
        if local.priority() >= central_level.priority() {
            local
        } else {
            central_level
        }
    }

    fn trip_conditions_met(&self, state: &BreakerState, now: Instant) -> bool {
        if state.failure_count >= self.fail_threshold_count {
            return true;
        }
        if let Some(first) = state.first_failure_mono {
            if now.duration_since(first).as_secs_f64() >= self.fail_threshold_seconds {
                return true;
            }
        }
        false
    }

    fn degraded_event(&self, state: &BreakerState) -> SystemEvent {
        SystemEvent::new(
            EventType::QualityDegraded,
            self.source,
            Severity::Warning,
            self.trip_reason_code,
            Some(json!({
                "level": SystemLevel::Unstable.as_str(),
                "failure_count": state.failure_count,
            })),
            None,
        )
    }

    fn trip_event(&self, state: &BreakerState) -> SystemEvent {
        SystemEvent::new(
            EventType::FailCrit,
            self.source,
            Severity::Critical,
            self.trip_reason_code,
            Some(json!({
                "level": SystemLevel::Tripped.as_str(),
                "failure_count": state.failure_count,
            })),
            None,
        )
    }

    fn recovery_event(&self) -> SystemEvent {
        SystemEvent::new(
            EventType::Recovered,
            self.source,
            Severity::Info,
            self.recovery_reason_code,
            Some(json!({
                "level": SystemLevel::Healthy.as_str(),
            })),
            None,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(count: u32, seconds: f64) -> ResilienceConfig {
        ResilienceConfig {
            fail_threshold_count: count,
            fail_threshold_seconds: seconds,
            ..ResilienceConfig::default()
        }
    }

    #[test]
    fn first_failure_goes_unstable_not_tripped() {
        let breaker = CircuitBreaker::broker(&config(3, 10.0));

        let event = breaker.record_failure().expect("level change");
        assert_eq!(event.event_type, EventType::QualityDegraded);
        assert_eq!(event.severity, Severity::Warning);
        assert_eq!(breaker.level(), SystemLevel::Unstable);
        assert!(!breaker.is_tripped());
    }

    #[test]
    fn trips_on_exactly_threshold_count_not_fewer() {
        let breaker = CircuitBreaker::broker(&config(3, 1e9));

        assert!(breaker.record_failure().is_some()); // -> UNSTABLE
        assert!(breaker.record_failure().is_none()); // 2 < 3
        let event = breaker.record_failure().expect("trip on 3rd");
        assert_eq!(event.event_type, EventType::FailCrit);
        assert_eq!(event.reason_code, ReasonCode::BrokerDisconnect);
        assert!(breaker.is_tripped());

        // Further failures while TRIPPED are silent.
        assert!(breaker.record_failure().is_none());
    }

    #[test]
    fn trips_on_sustained_failure_window() {
        // Tiny time threshold, huge count threshold: trip must come from
        // the elapsed-seconds condition.
        let breaker = CircuitBreaker::market_data(&config(1000, 0.0));

        assert!(breaker.record_failure().is_some()); // -> UNSTABLE
        let event = breaker.record_failure().expect("time-based trip");
        assert_eq!(event.event_type, EventType::FailCrit);
        assert_eq!(event.reason_code, ReasonCode::MdStale);
    }

    #[test]
    fn success_resets_and_emits_recovery_once() {
        let breaker = CircuitBreaker::broker(&config(2, 1e9));
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.is_tripped());

        let event = breaker.record_success().expect("recovery event");
        assert_eq!(event.event_type, EventType::Recovered);
        assert_eq!(event.reason_code, ReasonCode::BrokerReconnected);
        assert_eq!(breaker.level(), SystemLevel::Healthy);
        assert_eq!(breaker.failure_count(), 0);

        // Success while already HEALTHY stays silent.
        assert!(breaker.record_success().is_none());
    }

    #[test]
    fn effective_level_only_tightens() {
        let levels = [
            SystemLevel::Healthy,
            SystemLevel::Unstable,
            SystemLevel::Tripped,
        ];
        let cfg = config(2, 1e9);

        for (locals_applied, local) in levels.iter().enumerate() {
            let breaker = CircuitBreaker::risk(&cfg);
            for _ in 0..locals_applied {
                breaker.record_failure();
            }
            assert_eq!(breaker.level(), *local);

            for central in levels {
                let effective = breaker.effective_level(central);
                let expected = if local.priority() >= central.priority() {
                    *local
                } else {
                    central
                };
                assert_eq!(effective, expected);
            }
        }
    }
}
