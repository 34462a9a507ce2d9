//! RecoveryOrchestrator - staged return from degraded states to NORMAL.
//!
//! Stages: CONNECT_BROKER -> CATCHUP_MARKETDATA -> VERIFY_RISK -> READY.
//! Each invocation is a run with a fresh run id; starting a new run
//! replaces any in-flight run. Every stage must pass its probe predicate
//! before advancing; READY additionally holds a strict stable dwell with no
//! new critical events. Repeated stage failures or external cancellation
//! abort into SAFE_MODE.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ResilienceConfig;
use crate::models::{
    ComponentSource, EventType, ReasonCode, RecoveryStage, RecoveryTrigger, Severity,
    SystemEvent, SystemMode,
};
use crate::probes::ComponentProbe;
use crate::state::SystemStateService;

#[derive(Default)]
struct RunState {
    run_id: Option<String>,
    stage: Option<RecoveryStage>,
    trigger: Option<RecoveryTrigger>,
    operator_id: Option<String>,
    stage_started_mono: Option<Instant>,
    stage_failures: u32,
}

impl RunState {
    fn clear(&mut self) {
        *self = RunState::default();
    }
}

pub struct RecoveryOrchestrator {
    recovery_stable_seconds: f64,
    stage_max_retries: u32,
    min_safe_mode_seconds: f64,
    state_service: Arc<SystemStateService>,
    broker_probe: Arc<dyn ComponentProbe>,
    market_data_probe: Arc<dyn ComponentProbe>,
    risk_probe: Arc<dyn ComponentProbe>,
    run: Mutex<RunState>,
}

impl RecoveryOrchestrator {
    pub fn new(
        config: &ResilienceConfig,
        state_service: Arc<SystemStateService>,
        broker_probe: Arc<dyn ComponentProbe>,
        market_data_probe: Arc<dyn ComponentProbe>,
        risk_probe: Arc<dyn ComponentProbe>,
    ) -> Self {
        Self {
            recovery_stable_seconds: config.recovery_stable_seconds,
            stage_max_retries: config.recovery_stage_max_retries,
            min_safe_mode_seconds: config.min_safe_mode_seconds,
            state_service,
            broker_probe,
            market_data_probe,
            risk_probe,
            run: Mutex::new(RunState::default()),
        }
    }

    pub async fn current_run_id(&self) -> Option<String> {
        self.run.lock().await.run_id.clone()
    }

    pub async fn current_stage(&self) -> Option<RecoveryStage> {
        self.run.lock().await.stage
    }

    pub async fn is_recovering(&self) -> bool {
        self.run.lock().await.run_id.is_some()
    }

    /// Start a recovery run and return its run id. Idempotent in the
    /// replace sense: an in-flight run is cancelled and superseded.
    pub async fn start_recovery(
        &self,
        trigger: RecoveryTrigger,
        operator_id: Option<&str>,
    ) -> String {
        let mut run = self.run.lock().await;

        if let Some(existing) = &run.run_id {
            info!(
                cancelled_run_id = existing.as_str(),
                "Cancelling existing recovery to start a new one"
            );
            run.clear();
        }

        let run_id = format!("recovery-{}", &Uuid::new_v4().simple().to_string()[..8]);
        run.run_id = Some(run_id.clone());
        run.trigger = Some(trigger);
        run.operator_id = operator_id.map(str::to_string);
        run.stage = Some(RecoveryStage::ConnectBroker);
        run.stage_started_mono = Some(Instant::now());
        run.stage_failures = 0;

        // Drive the mode machine into RECOVERING if it is not already
        // there; the stage push below keeps the gate in lock-step.
        if self.state_service.mode() != SystemMode::Recovering {
            let event = SystemEvent::new(
                EventType::Recovered,
                ComponentSource::System,
                Severity::Info,
                ReasonCode::BrokerReconnected,
                Some(serde_json::json!({
                    "run_id": run_id,
                    "trigger": trigger.as_str(),
                    "operator_id": operator_id,
                })),
                None,
            );
            self.state_service.process_event(&event);
        }
        self.state_service
            .update_recovery_stage(RecoveryStage::ConnectBroker);

        info!(
            run_id = run_id.as_str(),
            trigger = trigger.as_str(),
            stage = RecoveryStage::ConnectBroker.as_str(),
            "Recovery started"
        );
        run_id
    }

    /// Run the current stage's check and advance on success. Returns false
    /// for a stale run id or a failed check; completes the recovery when
    /// advancing past READY.
    pub async fn advance_stage(&self, run_id: &str) -> bool {
        let mut run = self.run.lock().await;

        if !validate_run_id(&run, run_id) {
            return false;
        }
        let Some(stage) = run.stage else {
            return false;
        };

        let passed = self.check_stage(stage, &run).await;
        if !passed {
            run.stage_failures += 1;
            warn!(
                run_id,
                stage = stage.as_str(),
                failures = run.stage_failures,
                "Recovery stage check failed"
            );
            if run.stage_failures > self.stage_max_retries {
                let reason = format!("stage {} failed repeatedly", stage.as_str());
                self.abort_locked(&mut run, run_id, &reason);
            }
            return false;
        }
        run.stage_failures = 0;

        match stage.next() {
            Some(next) => {
                run.stage = Some(next);
                run.stage_started_mono = Some(Instant::now());
                self.state_service.update_recovery_stage(next);
                info!(run_id, stage = next.as_str(), "Recovery advanced");
                true
            }
            None => {
                // Advancing past READY completes the run. ALL_HEALTHY lets
                // the state service resolve NORMAL unless a component is
                // still tripped, in which case completion does not override
                // the live failure.
                info!(run_id, "Recovery completed");
                run.clear();
                let event = SystemEvent::new(
                    EventType::Recovered,
                    ComponentSource::System,
                    Severity::Info,
                    ReasonCode::AllHealthy,
                    Some(serde_json::json!({ "recovery_completed": true })),
                    None,
                );
                self.state_service.process_event(&event);
                true
            }
        }
    }

    /// Abort the run and fall back to SAFE_MODE with the minimum dwell.
    /// Stale run ids are ignored.
    pub async fn abort_recovery(&self, run_id: &str, reason: &str) {
        let mut run = self.run.lock().await;
        if !validate_run_id(&run, run_id) {
            return;
        }
        self.abort_locked(&mut run, run_id, reason);
    }

    fn abort_locked(&self, run: &mut RunState, run_id: &str, reason: &str) {
        warn!(run_id, reason, "Recovery aborted");
        let operator = run
            .operator_id
            .clone()
            .unwrap_or_else(|| "system".to_string());
        run.clear();

        if let Err(e) = self.state_service.force_mode(
            SystemMode::SafeMode,
            self.min_safe_mode_seconds as u64,
            &operator,
            &format!("Recovery aborted: {reason}"),
        ) {
            // A stricter mode is already in effect; leave it be.
            debug!("Abort fallback not applied: {e:#}");
        }
    }

    async fn check_stage(&self, stage: RecoveryStage, run: &RunState) -> bool {
        match stage {
            RecoveryStage::ConnectBroker => self.probe_ready(&self.broker_probe).await,
            RecoveryStage::CatchupMarketdata => self.probe_ready(&self.market_data_probe).await,
            RecoveryStage::VerifyRisk => self.probe_ready(&self.risk_probe).await,
            RecoveryStage::Ready => self.check_ready_stable(run),
        }
    }

    async fn probe_ready(&self, probe: &Arc<dyn ComponentProbe>) -> bool {
        let signal = probe.health_check().await;
        if signal.healthy {
            return true;
        }
        debug!(
            message = signal.message.as_deref().unwrap_or(""),
            "Probe unhealthy, attempting ensure_ready"
        );
        probe.ensure_ready().await
    }

    /// Strict READY dwell: the stage must have run for
    /// `recovery_stable_seconds` AND no critical event may have landed
    /// since the stage started.
    fn check_ready_stable(&self, run: &RunState) -> bool {
        let Some(started) = run.stage_started_mono else {
            return false;
        };
        let elapsed = started.elapsed().as_secs_f64();
        if elapsed < self.recovery_stable_seconds {
            debug!(
                elapsed_s = elapsed,
                required_s = self.recovery_stable_seconds,
                "READY stage not stable yet"
            );
            return false;
        }
        if let Some(last_critical) = self.state_service.last_critical_event_mono() {
            if last_critical >= started {
                debug!("Critical event during READY dwell, not stable");
                return false;
            }
        }
        true
    }
}

fn validate_run_id(run: &RunState, run_id: &str) -> bool {
    match &run.run_id {
        None => {
            debug!(run_id, "No recovery in progress, rejecting run id");
            false
        }
        Some(current) if current != run_id => {
            debug!(
                run_id,
                current_run_id = current.as_str(),
                "Run id mismatch"
            );
            false
        }
        Some(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gate::TradingGate;
    use crate::probes::{BrokerProbe, MarketDataProbe, RiskProbe};

    struct Fixture {
        orchestrator: RecoveryOrchestrator,
        state: Arc<SystemStateService>,
        broker: Arc<BrokerProbe>,
    }

    fn make_fixture(recovery_stable_seconds: f64) -> Fixture {
        let config = ResilienceConfig {
            recovery_stable_seconds,
            min_safe_mode_seconds: 0.0,
            market_data_cache_stale_ms: 60_000,
            ..ResilienceConfig::default()
        };
        let gate = Arc::new(TradingGate::new());
        let state = SystemStateService::new(&config, gate);

        let broker = BrokerProbe::new();
        broker.set_connected(true);
        let market_data = MarketDataProbe::new(&config);
        market_data.record_tick();
        let risk = RiskProbe::new();

        let orchestrator = RecoveryOrchestrator::new(
            &config,
            Arc::clone(&state),
            broker.clone(),
            market_data,
            risk,
        );
        Fixture {
            orchestrator,
            state,
            broker,
        }
    }

    #[tokio::test]
    async fn full_run_walks_stages_and_completes() {
        let fx = make_fixture(0.0);
        let run_id = fx
            .orchestrator
            .start_recovery(RecoveryTrigger::ColdStart, None)
            .await;

        assert_eq!(fx.state.mode(), SystemMode::Recovering);
        assert_eq!(
            fx.orchestrator.current_stage().await,
            Some(RecoveryStage::ConnectBroker)
        );

        assert!(fx.orchestrator.advance_stage(&run_id).await);
        assert_eq!(fx.state.stage(), Some(RecoveryStage::CatchupMarketdata));
        assert!(fx.orchestrator.advance_stage(&run_id).await);
        assert_eq!(fx.state.stage(), Some(RecoveryStage::VerifyRisk));
        assert!(fx.orchestrator.advance_stage(&run_id).await);
        assert_eq!(fx.state.stage(), Some(RecoveryStage::Ready));

        // Fourth advance completes and the state service resolves NORMAL.
        assert!(fx.orchestrator.advance_stage(&run_id).await);
        assert!(!fx.orchestrator.is_recovering().await);
        assert_eq!(fx.state.mode(), SystemMode::Normal);
    }

    #[tokio::test]
    async fn new_run_invalidates_previous_run_id() {
        let fx = make_fixture(0.0);
        let first = fx
            .orchestrator
            .start_recovery(RecoveryTrigger::Auto, None)
            .await;
        let second = fx
            .orchestrator
            .start_recovery(RecoveryTrigger::Manual, Some("op1"))
            .await;

        assert_ne!(first, second);
        assert!(!fx.orchestrator.advance_stage(&first).await);
        assert!(fx.orchestrator.advance_stage(&second).await);
    }

    #[tokio::test]
    async fn ready_stage_enforces_strict_dwell() {
        let fx = make_fixture(3600.0);
        let run_id = fx
            .orchestrator
            .start_recovery(RecoveryTrigger::Auto, None)
            .await;

        assert!(fx.orchestrator.advance_stage(&run_id).await);
        assert!(fx.orchestrator.advance_stage(&run_id).await);
        assert!(fx.orchestrator.advance_stage(&run_id).await);
        assert_eq!(
            fx.orchestrator.current_stage().await,
            Some(RecoveryStage::Ready)
        );

        // Dwell not elapsed: READY must not pass.
        assert!(!fx.orchestrator.advance_stage(&run_id).await);
        assert!(fx.orchestrator.is_recovering().await);
    }

    #[tokio::test]
    async fn failing_stage_aborts_to_safe_mode_after_retries() {
        let fx = make_fixture(0.0);
        fx.broker.set_connected(false);
        let run_id = fx
            .orchestrator
            .start_recovery(RecoveryTrigger::Auto, None)
            .await;

        // Default budget is 3 retries; the 4th failure aborts.
        for _ in 0..4 {
            assert!(!fx.orchestrator.advance_stage(&run_id).await);
        }
        assert!(!fx.orchestrator.is_recovering().await);
        assert_eq!(fx.state.mode(), SystemMode::SafeMode);
    }

    #[tokio::test]
    async fn abort_is_ignored_for_stale_run_id() {
        let fx = make_fixture(0.0);
        let run_id = fx
            .orchestrator
            .start_recovery(RecoveryTrigger::Auto, None)
            .await;
        fx.orchestrator.abort_recovery("recovery-bogus", "nope").await;
        assert!(fx.orchestrator.is_recovering().await);

        fx.orchestrator.abort_recovery(&run_id, "operator halt").await;
        assert!(!fx.orchestrator.is_recovering().await);
        assert_eq!(fx.state.mode(), SystemMode::SafeMode);
    }
}
