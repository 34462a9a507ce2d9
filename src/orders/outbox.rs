//! Outbox worker: dispatches intended external effects at least once.
//!
//! A single background loop claims PENDING events one at a time (the claim
//! itself flips them to IN_FLIGHT atomically), processes each to
//! completion, and marks them DONE. Processing failures charge an attempt
//! and the event returns to PENDING until `max_attempts` kills it (DEAD).
//! A gate refusal is not a failure: the event is released unchanged for a
//! later pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::ResilienceConfig;
use crate::gate::TradingGate;
use crate::models::ActionType;

use super::models::{
    CloseOrderPayload, CloseRequestStatus, OrderRecord, OrderStatus, OutboxEvent, OutboxStatus,
    SUBMIT_CLOSE_ORDER,
};
use super::store::{get_close_request, insert_order, update_close_request, OrderStore};

/// Broker acknowledgement of an accepted order submission.
#[derive(Debug, Clone)]
pub struct SubmitAck {
    pub broker_order_id: String,
}

/// Seam to the order manager that actually talks to the broker.
#[async_trait]
pub trait OrderSubmitter: Send + Sync {
    async fn submit_close_order(&self, payload: &CloseOrderPayload) -> Result<SubmitAck>;
}

enum ProcessOutcome {
    Done,
    GateDenied,
    Failed(anyhow::Error),
}

pub struct OutboxWorker {
    store: OrderStore,
    submitter: Arc<dyn OrderSubmitter>,
    gate: Arc<TradingGate>,
    max_attempts: u32,
    poll_interval: Duration,
    running: Arc<AtomicBool>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl OutboxWorker {
    pub fn new(
        config: &ResilienceConfig,
        store: OrderStore,
        submitter: Arc<dyn OrderSubmitter>,
        gate: Arc<TradingGate>,
    ) -> Self {
        Self {
            store,
            submitter,
            gate,
            max_attempts: config.outbox_max_attempts,
            poll_interval: Duration::from_secs_f64(config.outbox_poll_seconds),
            running: Arc::new(AtomicBool::new(false)),
            task: Mutex::new(None),
        }
    }

    /// Spawn the worker loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            info!("Outbox worker started");
            worker.run().await;
            info!("Outbox worker stopped");
        });
        *self.task.lock() = Some(handle);
    }

    /// Stop the worker loop. Idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self.task.lock().take();
        if let Some(mut handle) = handle {
            if tokio::time::timeout(Duration::from_secs(5), &mut handle)
                .await
                .is_err()
            {
                warn!("Outbox worker did not stop within grace period, aborting");
                handle.abort();
            }
        }
    }

    async fn run(&self) {
        while self.running.load(Ordering::Relaxed) {
            match self.store.claim_pending_outbox(1).await {
                Ok(events) if !events.is_empty() => {
                    for event in events {
                        self.handle_event(event).await;
                    }
                }
                Ok(_) => tokio::time::sleep(self.poll_interval).await,
                Err(e) => {
                    error!("Outbox worker claim error: {e:#}");
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }

    async fn handle_event(&self, event: OutboxEvent) {
        let id = event.id;
        match self.process_event(&event).await {
            // DONE is recorded inside the processing transaction.
            ProcessOutcome::Done => {}
            ProcessOutcome::GateDenied => {
                if let Err(e) = self.store.release_outbox(id).await {
                    error!(outbox_id = id, "Failed to release outbox event: {e:#}");
                }
            }
            ProcessOutcome::Failed(e) => {
                warn!(outbox_id = id, "Outbox event processing failed: {e:#}");
                match self.store.record_outbox_failure(id, self.max_attempts).await {
                    Ok(OutboxStatus::Dead) => {
                        error!(outbox_id = id, "Outbox event marked DEAD");
                    }
                    Ok(_) => {}
                    Err(e) => error!(outbox_id = id, "Failed to record outbox failure: {e:#}"),
                }
            }
        }
    }

    /// Process one claimed event to completion.
    async fn process_event(&self, event: &OutboxEvent) -> ProcessOutcome {
        if event.event_type != SUBMIT_CLOSE_ORDER {
            return ProcessOutcome::Failed(anyhow::anyhow!(
                "unknown outbox event type: {}",
                event.event_type
            ));
        }

        let payload: CloseOrderPayload = match serde_json::from_value(event.payload.clone())
            .context("decode close order payload")
        {
            Ok(p) => p,
            Err(e) => return ProcessOutcome::Failed(e),
        };

        // Closing reduces exposure; the gate still owns the final word.
        if let Err(refusal) = self.gate.check_order_request(&[ActionType::ReduceOnly]) {
            debug!(
                outbox_id = event.id,
                close_request_id = payload.close_request_id.as_str(),
                %refusal,
                "Close order submission refused by gate"
            );
            return ProcessOutcome::GateDenied;
        }

        let ack = match self.submitter.submit_close_order(&payload).await {
            Ok(ack) => ack,
            Err(e) => return ProcessOutcome::Failed(e.context("submit close order")),
        };

        info!(
            outbox_id = event.id,
            close_request_id = payload.close_request_id.as_str(),
            broker_order_id = ack.broker_order_id.as_str(),
            qty = payload.qty,
            "Close order submitted"
        );

        // Record the submission and advance the close request in one
        // transaction with the outbox completion.
        let outbox_id = event.id;
        let result = self
            .store
            .with_tx(move |tx| {
                insert_order(
                    tx,
                    &OrderRecord {
                        order_id: format!("ord-{}", Uuid::new_v4().simple()),
                        broker_order_id: Some(ack.broker_order_id.clone()),
                        close_request_id: Some(payload.close_request_id.clone()),
                        status: OrderStatus::Submitted,
                        filled_qty: 0,
                        broker_update_seq: None,
                        last_broker_update_at: None,
                        reconcile_not_found_count: 0,
                    },
                )?;

                if let Some(mut request) = get_close_request(tx, &payload.close_request_id)? {
                    if request.status == CloseRequestStatus::Pending {
                        request.status = CloseRequestStatus::Submitted;
                        request.submitted_at = Some(Utc::now());
                        update_close_request(tx, &request)?;
                    }
                }

                tx.execute(
                    "UPDATE outbox_events SET status = 'done' WHERE id = ?1",
                    rusqlite::params![outbox_id],
                )?;
                Ok(())
            })
            .await;

        match result {
            Ok(()) => ProcessOutcome::Done,
            Err(e) => ProcessOutcome::Failed(e),
        }
    }
}

/// Daily retention purge of DONE/DEAD outbox events.
pub async fn run_outbox_cleanup(store: &OrderStore, retention_days: u32) -> Result<usize> {
    let cutoff = Utc::now() - chrono::Duration::days(retention_days as i64);
    let purged = store.cleanup_outbox(cutoff).await?;
    if purged > 0 {
        info!(purged, "Cleaned up old outbox events");
    }
    Ok(purged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SystemMode;
    use crate::orders::store::test_support::{make_close_request, make_position};
    use std::sync::atomic::AtomicUsize;

    struct RecordingSubmitter {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl RecordingSubmitter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl OrderSubmitter for RecordingSubmitter {
        async fn submit_close_order(&self, payload: &CloseOrderPayload) -> Result<SubmitAck> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                anyhow::bail!("broker unavailable");
            }
            Ok(SubmitAck {
                broker_order_id: format!("bo-{}", payload.close_request_id),
            })
        }
    }

    async fn fixture(mode: SystemMode) -> (OrderStore, Arc<OutboxWorker>, Arc<RecordingSubmitter>) {
        let store = OrderStore::in_memory().unwrap();
        store.insert_position(&make_position("pos-1")).await.unwrap();
        store
            .create_close_request(&make_close_request("cr-1", "pos-1", 10))
            .await
            .unwrap();

        let gate = Arc::new(TradingGate::new());
        gate.update_mode(mode, None).unwrap();

        let submitter = RecordingSubmitter::new();
        let config = ResilienceConfig {
            outbox_max_attempts: 2,
            outbox_poll_seconds: 0.01,
            ..ResilienceConfig::default()
        };
        let worker = Arc::new(OutboxWorker::new(
            &config,
            store.clone(),
            submitter.clone(),
            gate,
        ));
        (store, worker, submitter)
    }

    #[tokio::test]
    async fn worker_submits_and_advances_close_request() {
        let (store, worker, submitter) = fixture(SystemMode::Normal).await;
        worker.start();

        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let request = store.close_request("cr-1").await.unwrap().unwrap();
                if request.status == CloseRequestStatus::Submitted {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("close request never submitted");
        worker.stop().await;

        assert_eq!(submitter.calls.load(Ordering::SeqCst), 1);
        let request = store.close_request("cr-1").await.unwrap().unwrap();
        assert!(request.submitted_at.is_some());

        let event = store.outbox_event(1).await.unwrap().unwrap();
        assert_eq!(event.status, OutboxStatus::Done);

        let order = store
            .order_by_broker_id("bo-cr-1")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(order.status, OrderStatus::Submitted);
        assert_eq!(order.close_request_id.as_deref(), Some("cr-1"));
    }

    #[tokio::test]
    async fn gate_denial_releases_event_without_charging_attempts() {
        let (store, worker, submitter) = fixture(SystemMode::Halt).await;

        let events = store.claim_pending_outbox(1).await.unwrap();
        worker.handle_event(events.into_iter().next().unwrap()).await;

        assert_eq!(submitter.calls.load(Ordering::SeqCst), 0);
        let event = store.outbox_event(1).await.unwrap().unwrap();
        assert_eq!(event.status, OutboxStatus::Pending);
        assert_eq!(event.attempts, 0);
    }

    #[tokio::test]
    async fn submit_failures_exhaust_attempts_to_dead() {
        let (store, worker, submitter) = fixture(SystemMode::Normal).await;
        submitter.fail.store(true, Ordering::SeqCst);

        for _ in 0..2 {
            let events = store.claim_pending_outbox(1).await.unwrap();
            worker.handle_event(events.into_iter().next().unwrap()).await;
        }

        let event = store.outbox_event(1).await.unwrap().unwrap();
        assert_eq!(event.status, OutboxStatus::Dead);
        assert_eq!(event.attempts, 2);
    }

    #[tokio::test]
    async fn cleanup_honors_retention() {
        let (store, worker, _submitter) = fixture(SystemMode::Normal).await;
        let events = store.claim_pending_outbox(1).await.unwrap();
        worker.handle_event(events.into_iter().next().unwrap()).await;

        // Everything is fresh: a 7-day retention purges nothing.
        assert_eq!(run_outbox_cleanup(&store, 7).await.unwrap(), 0);
    }
}
