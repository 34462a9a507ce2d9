//! Wiring and lifecycle for the resilience layer.
//!
//! Construction order matters: the gate exists first, the state service
//! holds a handle to it, the bus gets the state service as a subscriber,
//! and the emergency callback writes the gate directly. That callback is
//! the only place the gate is updated synchronously from outside the state
//! service, and only for critical drops. The setup module owns every
//! handle for the process lifetime.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{Local, NaiveTime, TimeZone};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::bus::EventBus;
use crate::config::{
    ResilienceConfig, INVARIANT_JOB_PERIOD_SECS, OUTBOX_CLEANUP_HOUR_LOCAL,
    PARTIAL_RETRY_JOB_PERIOD_SECS, STUCK_JOB_PERIOD_SECS, ZOMBIE_JOB_PERIOD_SECS,
};
use crate::db_buffer::DbBuffer;
use crate::gate::TradingGate;
use crate::models::SystemMode;
use crate::orders::outbox::{run_outbox_cleanup, OrderSubmitter, OutboxWorker};
use crate::orders::reconciler::{BrokerApi, Reconciler};
use crate::orders::store::OrderStore;
use crate::probes::{BrokerProbe, MarketDataProbe, RiskProbe};
use crate::recovery::RecoveryOrchestrator;
use crate::state::SystemStateService;

/// Process-wide handles for the resilience layer.
pub struct ResilienceRuntime {
    pub config: ResilienceConfig,
    pub bus: Arc<EventBus>,
    pub gate: Arc<TradingGate>,
    pub state: Arc<SystemStateService>,
    pub orchestrator: Arc<RecoveryOrchestrator>,
    pub store: OrderStore,
    pub db_buffer: Arc<DbBuffer>,
    pub outbox_worker: Arc<OutboxWorker>,
    pub reconciler: Arc<Reconciler>,
    pub broker_probe: Arc<BrokerProbe>,
    pub market_data_probe: Arc<MarketDataProbe>,
    pub risk_probe: Arc<RiskProbe>,
    jobs: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

lazy_static! {
    static ref RUNTIME: Mutex<Option<Arc<ResilienceRuntime>>> = Mutex::new(None);
}

/// The live runtime, if `init_resilience` has run.
pub fn runtime() -> Option<Arc<ResilienceRuntime>> {
    RUNTIME.lock().clone()
}

/// Construct and start the whole resilience layer. Fails if already
/// initialized; tests must call `shutdown_resilience` after each init.
pub async fn init_resilience(
    config: ResilienceConfig,
    submitter: Arc<dyn OrderSubmitter>,
    broker_api: Arc<dyn BrokerApi>,
) -> Result<Arc<ResilienceRuntime>> {
    if RUNTIME.lock().is_some() {
        bail!("resilience layer already initialized");
    }

    info!("Initializing resilience layer");

    let gate = Arc::new(TradingGate::new());
    let bus = Arc::new(EventBus::new(&config));
    let state = SystemStateService::new(&config, Arc::clone(&gate));
    bus.subscribe(state.clone());

    // Local emergency degrade: a dropped critical event slams the gate to
    // SAFE_MODE without touching the bus or the state service.
    let emergency_gate = Arc::clone(&gate);
    bus.set_emergency_callback(Arc::new(move |event| {
        error!(
            reason_code = event.reason_code.as_str(),
            "Emergency degrade: forcing gate to SAFE_MODE"
        );
        if let Err(e) = emergency_gate.update_mode(SystemMode::SafeMode, None) {
            error!("Emergency gate update failed: {e:#}");
        }
    }));

    let broker_probe = BrokerProbe::new();
    let market_data_probe = MarketDataProbe::new(&config);
    let risk_probe = RiskProbe::new();
    let orchestrator = Arc::new(RecoveryOrchestrator::new(
        &config,
        Arc::clone(&state),
        broker_probe.clone(),
        market_data_probe.clone(),
        risk_probe.clone(),
    ));

    let store = OrderStore::new(&config.database_path)?;
    let db_buffer = Arc::new(DbBuffer::new(&config, config.wal_path.clone()));
    let outbox_worker = Arc::new(OutboxWorker::new(
        &config,
        store.clone(),
        submitter,
        Arc::clone(&gate),
    ));
    let reconciler = Arc::new(Reconciler::new(
        store.clone(),
        broker_api,
        Some(Arc::clone(&bus)),
    ));

    bus.start();
    state.start();
    outbox_worker.start();

    let runtime = Arc::new(ResilienceRuntime {
        config,
        bus,
        gate,
        state,
        orchestrator,
        store,
        db_buffer,
        outbox_worker,
        reconciler: Arc::clone(&reconciler),
        broker_probe,
        market_data_probe,
        risk_probe,
        jobs: Mutex::new(Vec::new()),
    });

    spawn_reconciler_jobs(&runtime, reconciler);

    *RUNTIME.lock() = Some(Arc::clone(&runtime));
    info!("Resilience layer initialized");
    Ok(runtime)
}

/// Stop every background task and clear the global handle. Idempotent.
pub async fn shutdown_resilience() {
    let Some(runtime) = RUNTIME.lock().take() else {
        return;
    };

    info!("Shutting down resilience layer");
    for job in runtime.jobs.lock().drain(..) {
        job.abort();
    }
    runtime.outbox_worker.stop().await;
    runtime.state.stop();
    runtime.bus.stop().await;
    info!("Resilience layer shutdown complete");
}

fn spawn_reconciler_jobs(runtime: &Arc<ResilienceRuntime>, reconciler: Arc<Reconciler>) {
    let mut jobs = runtime.jobs.lock();

    let r = Arc::clone(&reconciler);
    jobs.push(spawn_interval_job(
        "zombie_detection",
        Duration::from_secs(ZOMBIE_JOB_PERIOD_SECS),
        move || {
            let r = Arc::clone(&r);
            async move { r.detect_zombies().await.map(|_| ()) }
        },
    ));

    let r = Arc::clone(&reconciler);
    jobs.push(spawn_interval_job(
        "stuck_order_recovery",
        Duration::from_secs(STUCK_JOB_PERIOD_SECS),
        move || {
            let r = Arc::clone(&r);
            async move { r.recover_stuck_orders().await }
        },
    ));

    let r = Arc::clone(&reconciler);
    jobs.push(spawn_interval_job(
        "partial_fill_retry",
        Duration::from_secs(PARTIAL_RETRY_JOB_PERIOD_SECS),
        move || {
            let r = Arc::clone(&r);
            async move { r.retry_partial_fills().await.map(|_| ()) }
        },
    ));

    let r = Arc::clone(&reconciler);
    jobs.push(spawn_interval_job(
        "invariant_check",
        Duration::from_secs(INVARIANT_JOB_PERIOD_SECS),
        move || {
            let r = Arc::clone(&r);
            async move { r.check_invariants().await.map(|_| ()) }
        },
    ));

    // Outbox cleanup: daily, first run aligned to the next 03:00 local.
    let store = runtime.store.clone();
    let retention_days = runtime.config.outbox_retention_days;
    jobs.push(tokio::spawn(async move {
        tokio::time::sleep(delay_until_local_hour(OUTBOX_CLEANUP_HOUR_LOCAL)).await;
        let mut tick = tokio::time::interval(Duration::from_secs(24 * 60 * 60));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tick.tick().await;
            if let Err(e) = run_outbox_cleanup(&store, retention_days).await {
                error!("Outbox cleanup failed: {e:#}");
            }
        }
    }));
}

fn spawn_interval_job<F, Fut>(
    name: &'static str,
    period: Duration,
    job: F,
) -> tokio::task::JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // Swallow the immediate first tick so the job runs after one full
        // period, like the rest of the schedules.
        tick.tick().await;
        loop {
            tick.tick().await;
            if let Err(e) = job().await {
                // Background jobs log and continue; they never die.
                error!(job = name, "Reconciler job failed: {e:#}");
            }
        }
    })
}

fn delay_until_local_hour(hour: u32) -> Duration {
    let now = Local::now();
    let target_time = NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN);
    let mut target = now.date_naive().and_time(target_time);
    if Local
        .from_local_datetime(&target)
        .earliest()
        .map(|t| t <= now)
        .unwrap_or(true)
    {
        target = target + chrono::Duration::days(1);
    }
    match Local.from_local_datetime(&target).earliest() {
        Some(t) => (t - now).to_std().unwrap_or(Duration::from_secs(60)),
        None => {
            warn!("Could not resolve local cleanup time, defaulting to 24h");
            Duration::from_secs(24 * 60 * 60)
        }
    }
}
