//! SystemStateService - single source of truth for the system mode.
//!
//! Subscribes to every bus event, tracks per-component health, and resolves
//! the target mode with a static decision matrix plus priority merging.
//! All event handling is serialized by one mutex so that
//! "compute target -> append transition -> push gate" is atomic.
//!
//! Mode policy:
//! - only TRIPPED components contribute to the merge (hysteresis lives in
//!   the breakers, UNSTABLE never moves the system)
//! - recovery events lead to RECOVERING, never straight to NORMAL; only the
//!   orchestrator's ALL_HEALTHY completes recovery
//! - SAFE_MODE / HALT entered by component failures hold a minimum dwell;
//!   lower-severity targets during dwell are deferred, not dropped
//! - operator overrides win while their monotonic TTL is live

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::bus::EventHandler;
use crate::config::ResilienceConfig;
use crate::gate::TradingGate;
use crate::models::{
    ComponentSource, ComponentStatus, EventType, ModeTransition, ReasonCode, RecoveryStage,
    SystemEvent, SystemLevel, SystemMode,
};

/// Period of the background re-evaluation tick (override TTL expiry and
/// dwell release do not depend on fresh events arriving).
const REEVALUATE_PERIOD: Duration = Duration::from_millis(100);

/// Static decision matrix: what mode a tripped reason demands.
fn target_mode_for(reason: ReasonCode) -> Option<SystemMode> {
    match reason {
        ReasonCode::BrokerDisconnect => Some(SystemMode::SafeModeDisconnected),
        ReasonCode::BrokerReportMismatch => Some(SystemMode::SafeMode),
        ReasonCode::PositionTruthUnknown => Some(SystemMode::Halt),
        ReasonCode::RiskBreachHard => Some(SystemMode::Halt),
        ReasonCode::RiskTimeout => Some(SystemMode::Degraded),
        ReasonCode::MdStale => Some(SystemMode::Degraded),
        ReasonCode::MdQualityDegraded => Some(SystemMode::Degraded),
        ReasonCode::DbWriteFail => Some(SystemMode::Degraded),
        ReasonCode::DbBufferOverflow => Some(SystemMode::SafeMode),
        ReasonCode::AlertsChannelDown => Some(SystemMode::Degraded),
        ReasonCode::RecoveryFailed => Some(SystemMode::SafeMode),
        ReasonCode::BrokerReconnected => Some(SystemMode::Recovering),
        ReasonCode::ColdStart => Some(SystemMode::Recovering),
        ReasonCode::AllHealthy => Some(SystemMode::Normal),
        ReasonCode::OperatorOverride => None,
    }
}

/// What currently holds the mode: the component-driven computation or a
/// live operator override. Decides how re-entry to NORMAL is routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModeDriver {
    Computed,
    Override,
}

#[derive(Debug, Clone)]
struct OperatorOverride {
    mode: SystemMode,
    expires_at_mono: Instant,
    operator_id: String,
    reason: String,
    ttl_seconds: u64,
    allow_downgrade: bool,
}

struct StateInner {
    current_mode: SystemMode,
    current_stage: Option<RecoveryStage>,
    components: HashMap<ComponentSource, ComponentStatus>,
    history: Vec<ModeTransition>,
    operator_override: Option<OperatorOverride>,
    dwell_until: Option<Instant>,
    mode_driver: ModeDriver,
    last_critical_mono: Option<Instant>,
}

/// Snapshot of the full state for API/diagnostic surfaces.
#[derive(Debug, Clone)]
pub struct StateSnapshot {
    pub mode: SystemMode,
    pub stage: Option<RecoveryStage>,
    pub components: HashMap<ComponentSource, ComponentStatus>,
}

pub struct SystemStateService {
    min_safe_mode_seconds: f64,
    gate: Arc<TradingGate>,
    inner: Mutex<StateInner>,
    running: AtomicBool,
    ticker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SystemStateService {
    /// Construct in cold-start state, matching the gate:
    /// RECOVERING / CONNECT_BROKER.
    pub fn new(config: &ResilienceConfig, gate: Arc<TradingGate>) -> Arc<Self> {
        Arc::new(Self {
            min_safe_mode_seconds: config.min_safe_mode_seconds,
            gate,
            inner: Mutex::new(StateInner {
                current_mode: SystemMode::Recovering,
                current_stage: Some(RecoveryStage::ConnectBroker),
                components: HashMap::new(),
                history: Vec::new(),
                operator_override: None,
                dwell_until: None,
                mode_driver: ModeDriver::Computed,
                last_critical_mono: None,
            }),
            running: AtomicBool::new(false),
            ticker: Mutex::new(None),
        })
    }

    pub fn mode(&self) -> SystemMode {
        self.inner.lock().current_mode
    }

    pub fn stage(&self) -> Option<RecoveryStage> {
        self.inner.lock().current_stage
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let inner = self.inner.lock();
        StateSnapshot {
            mode: inner.current_mode,
            stage: inner.current_stage,
            components: inner.components.clone(),
        }
    }

    pub fn transition_history(&self) -> Vec<ModeTransition> {
        self.inner.lock().history.clone()
    }

    /// Monotonic time of the last critical (MUST_DELIVER) event observed.
    /// The recovery orchestrator uses this for the READY stability check.
    pub fn last_critical_event_mono(&self) -> Option<Instant> {
        self.inner.lock().last_critical_mono
    }

    /// Process one system event: update the component's status, then
    /// re-resolve the target mode. Serialized with every other mutation.
    pub fn process_event(&self, event: &SystemEvent) {
        let mut inner = self.inner.lock();

        if event.is_critical() {
            inner.last_critical_mono = Some(event.event_time_mono);
        }

        let status = inner
            .components
            .entry(event.source)
            .or_insert_with(|| ComponentStatus::new(event.source));
        let now = Instant::now();
        status.last_update_mono = now;

        match event.event_type {
            EventType::FailCrit => {
                status.consecutive_failures += 1;
                status.level = SystemLevel::Tripped;
                status.last_event = Some(event.clone());
            }
            EventType::QualityDegraded | EventType::FailSupp => {
                status.consecutive_failures += 1;
                if status.level == SystemLevel::Healthy {
                    status.level = SystemLevel::Unstable;
                    status.unstable_since_mono = Some(now);
                }
                status.last_event = Some(event.clone());
            }
            EventType::Recovered => {
                status.consecutive_failures = 0;
                status.level = SystemLevel::Healthy;
                status.unstable_since_mono = None;
                status.last_event = Some(event.clone());
            }
            EventType::Heartbeat => {}
        }

        self.reevaluate_locked(&mut inner, Some(event));
    }

    /// Re-resolve the target mode with no fresh event: releases expired
    /// operator overrides and applies deferred post-dwell targets.
    pub fn reevaluate(&self) {
        let mut inner = self.inner.lock();
        self.reevaluate_locked(&mut inner, None);
    }

    /// Operator override: force a mode for `ttl_seconds` (monotonic).
    ///
    /// Overrides may only tighten; loosening requires the literal marker
    /// `override_downgrade` in the reason, which is recorded for audit.
    pub fn force_mode(
        &self,
        mode: SystemMode,
        ttl_seconds: u64,
        operator_id: &str,
        reason: &str,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let allow_downgrade = reason.contains("override_downgrade");

        if mode.priority() < inner.current_mode.priority() && !allow_downgrade {
            bail!(
                "override to {} would loosen current mode {} (operator {})",
                mode.as_str(),
                inner.current_mode.as_str(),
                operator_id
            );
        }

        info!(
            mode = mode.as_str(),
            ttl_seconds,
            operator_id,
            reason,
            "Operator override"
        );

        inner.operator_override = Some(OperatorOverride {
            mode,
            expires_at_mono: Instant::now() + Duration::from_secs(ttl_seconds),
            operator_id: operator_id.to_string(),
            reason: reason.to_string(),
            ttl_seconds,
            allow_downgrade,
        });

        self.apply_transition(
            &mut inner,
            mode,
            ReasonCode::OperatorOverride,
            ComponentSource::System,
            Some(operator_id.to_string()),
            Some(ttl_seconds),
            ModeDriver::Override,
        );
        Ok(())
    }

    /// Push a new recovery stage into the gate. Only meaningful while
    /// RECOVERING; called by the orchestrator as stages advance.
    pub fn update_recovery_stage(&self, stage: RecoveryStage) {
        let mut inner = self.inner.lock();
        if inner.current_mode != SystemMode::Recovering {
            warn!(
                stage = stage.as_str(),
                mode = inner.current_mode.as_str(),
                "Ignoring stage update outside RECOVERING"
            );
            return;
        }
        inner.current_stage = Some(stage);
        if let Err(e) = self.gate.update_mode(SystemMode::Recovering, Some(stage)) {
            error!("Gate rejected stage update: {e:#}");
        }
    }

    /// Start the periodic re-evaluation task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let service = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(REEVALUATE_PERIOD);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            while service.running.load(Ordering::Relaxed) {
                tick.tick().await;
                service.reevaluate();
            }
        });
        *self.ticker.lock() = Some(handle);
        info!("SystemStateService started");
    }

    /// Stop the re-evaluation task. Idempotent.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Some(handle) = self.ticker.lock().take() {
            handle.abort();
        }
        info!("SystemStateService stopped");
    }

    fn reevaluate_locked(&self, inner: &mut StateInner, event: Option<&SystemEvent>) {
        let now = Instant::now();

        // Release an expired operator override before anything else; the
        // expiry itself can demand a transition even with no new events.
        let mut override_just_expired = false;
        let expired = inner
            .operator_override
            .as_ref()
            .is_some_and(|active| now >= active.expires_at_mono);
        if expired {
            if let Some(released) = inner.operator_override.take() {
                info!(
                    mode = released.mode.as_str(),
                    operator_id = released.operator_id.as_str(),
                    reason = released.reason.as_str(),
                    "Operator override expired"
                );
            }
            override_just_expired = true;
        }

        // Merge tripped components by mode priority, skipping events whose
        // TTL lapsed on the monotonic clock.
        let mut target = SystemMode::Normal;
        let mut reason = ReasonCode::AllHealthy;
        let mut source = ComponentSource::System;
        for status in inner.components.values() {
            if status.level != SystemLevel::Tripped {
                continue;
            }
            let Some(last_event) = &status.last_event else {
                continue;
            };
            if last_event.is_expired() {
                debug!(
                    source = status.source.as_str(),
                    "Tripped component event expired, excluded from merge"
                );
                continue;
            }
            if let Some(mode) = target_mode_for(last_event.reason_code) {
                if mode.priority() > target.priority() {
                    target = mode;
                    reason = last_event.reason_code;
                    source = status.source;
                }
            }
        }

        // Recovery hints ride on RECOVERED events only; failure events act
        // through the component levels above.
        if let Some(event) = event {
            if event.event_type == EventType::Recovered {
                if let Some(mode) = target_mode_for(event.reason_code) {
                    if mode.priority() > target.priority() {
                        target = mode;
                        reason = event.reason_code;
                        source = event.source;
                    }
                }
            }
        }

        // NORMAL is only reachable through a completed recovery: the
        // orchestrator's ALL_HEALTHY (source SYSTEM) is the sole direct
        // entry. While RECOVERING, hold until it arrives; from any other
        // computed non-NORMAL mode, route through RECOVERING. Override
        // releases are exempt: the pre-override baseline was already
        // computed.
        let recovery_completed = event.is_some_and(|e| {
            e.reason_code == ReasonCode::AllHealthy && e.source == ComponentSource::System
        });
        if target == SystemMode::Normal
            && inner.current_mode != SystemMode::Normal
            && !recovery_completed
            && !(override_just_expired && inner.mode_driver == ModeDriver::Override)
        {
            if inner.current_mode == SystemMode::Recovering {
                return;
            }
            target = SystemMode::Recovering;
            reason = ReasonCode::BrokerReconnected;
            source = ComponentSource::System;
        }

        // A live override wins unless the computed target is stricter and
        // the override was not granted downgrade semantics.
        if let Some(active) = &inner.operator_override {
            if active.mode.priority() >= target.priority() || active.allow_downgrade {
                if active.mode == inner.current_mode {
                    return;
                }
                let (mode, operator_id, ttl) = (
                    active.mode,
                    Some(active.operator_id.clone()),
                    Some(active.ttl_seconds),
                );
                self.apply_transition(
                    inner,
                    mode,
                    ReasonCode::OperatorOverride,
                    ComponentSource::System,
                    operator_id,
                    ttl,
                    ModeDriver::Override,
                );
                return;
            }
        }

        if target == inner.current_mode {
            return;
        }

        // Dwell floor: SAFE_MODE / HALT entered by component failures hold
        // for min_safe_mode_seconds. Lower-severity targets are deferred;
        // the periodic tick re-applies them once the dwell lapses.
        if matches!(
            inner.current_mode,
            SystemMode::SafeMode | SystemMode::Halt
        ) && target.priority() < inner.current_mode.priority()
        {
            if let Some(dwell_until) = inner.dwell_until {
                if now < dwell_until {
                    debug!(
                        target = target.as_str(),
                        remaining_ms = (dwell_until - now).as_millis() as u64,
                        "Deferring lower-severity transition during dwell"
                    );
                    return;
                }
            }
        }

        self.apply_transition(
            inner,
            target,
            reason,
            source,
            None,
            None,
            ModeDriver::Computed,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_transition(
        &self,
        inner: &mut StateInner,
        to_mode: SystemMode,
        reason_code: ReasonCode,
        source: ComponentSource,
        operator_id: Option<String>,
        override_ttl: Option<u64>,
        driver: ModeDriver,
    ) {
        let from_mode = inner.current_mode;
        if from_mode == to_mode {
            return;
        }

        let stage = if to_mode == SystemMode::Recovering {
            Some(inner.current_stage.unwrap_or(RecoveryStage::ConnectBroker))
        } else {
            None
        };

        info!(
            from = from_mode.as_str(),
            to = to_mode.as_str(),
            reason = reason_code.as_str(),
            source = source.as_str(),
            "Mode transition"
        );

        inner.history.push(ModeTransition {
            from_mode,
            to_mode,
            reason_code,
            source,
            timestamp_wall: Utc::now(),
            timestamp_mono: Instant::now(),
            operator_id,
            override_ttl,
        });
        inner.current_mode = to_mode;
        inner.current_stage = stage;
        inner.mode_driver = driver;

        // Component-driven SAFE_MODE / HALT entries start the dwell clock;
        // operator overrides carry their own TTL as the dwell.
        inner.dwell_until = match (driver, to_mode) {
            (ModeDriver::Computed, SystemMode::SafeMode | SystemMode::Halt) => {
                Some(Instant::now() + Duration::from_secs_f64(self.min_safe_mode_seconds))
            }
            _ => None,
        };

        if let Err(e) = self.gate.update_mode(to_mode, stage) {
            error!("Gate rejected mode update: {e:#}");
        }
    }
}

#[async_trait]
impl EventHandler for SystemStateService {
    async fn handle_event(&self, event: &SystemEvent) -> Result<()> {
        self.process_event(event);
        Ok(())
    }
}
