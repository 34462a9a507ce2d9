//! Sentinel - trading resilience service.
//!
//! Runs the mode machine, event bus, trading gate, recovery orchestrator
//! and the durable close flow workers. Order submission and broker queries
//! run against a paper adapter until a venue connector is wired in; the
//! safe default never sends real orders.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sentinel_backend::config::ResilienceConfig;
use sentinel_backend::models::RecoveryTrigger;
use sentinel_backend::orders::models::{BrokerOrderUpdate, CloseOrderPayload};
use sentinel_backend::orders::outbox::{OrderSubmitter, SubmitAck};
use sentinel_backend::orders::reconciler::BrokerApi;
use sentinel_backend::setup;

/// Paper trading adapter: acknowledges submissions without touching a
/// venue.
struct PaperAdapter;

#[async_trait]
impl OrderSubmitter for PaperAdapter {
    async fn submit_close_order(&self, payload: &CloseOrderPayload) -> Result<SubmitAck> {
        warn!(
            close_request_id = payload.close_request_id.as_str(),
            symbol = payload.symbol.as_str(),
            side = payload.side.as_str(),
            qty = payload.qty,
            "PAPER: would submit close order"
        );
        Ok(SubmitAck {
            broker_order_id: format!("paper-{}", payload.close_request_id),
        })
    }
}

#[async_trait]
impl BrokerApi for PaperAdapter {
    async fn query_order(&self, broker_order_id: &str) -> Result<Option<BrokerOrderUpdate>> {
        warn!(broker_order_id, "PAPER: order query, reporting not found");
        Ok(None)
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sentinel_backend=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let config = ResilienceConfig::from_env();
    info!(db = config.database_path.as_str(), "Starting sentinel");

    let adapter = Arc::new(PaperAdapter);
    let runtime = setup::init_resilience(config, adapter.clone(), adapter).await?;

    // Cold start always walks the full recovery ladder before the gate
    // opens anything beyond QUERY.
    let run_id = runtime
        .orchestrator
        .start_recovery(RecoveryTrigger::ColdStart, None)
        .await;
    info!(run_id = run_id.as_str(), "Cold start recovery running");

    // Drive the stages until the run completes or aborts; each advance
    // re-checks the stage probes.
    let orchestrator = runtime.orchestrator.clone();
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
            let Some(run_id) = orchestrator.current_run_id().await else {
                break;
            };
            orchestrator.advance_stage(&run_id).await;
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");
    setup::shutdown_resilience().await;
    Ok(())
}
