//! Reconciler jobs that heal drift in the close position flow.
//!
//! Four independent schedules:
//! - detect_zombies (1 min): PENDING close requests older than 2 min with
//!   no PENDING outbox event were orphaned by a crash between the two
//!   writes; fail them and reopen the position
//! - recover_stuck_orders (5 min): SUBMITTED for over 10 min; ask the
//!   broker directly and route its answer through the update handler
//! - retry_partial_fills (2 min): re-issue the remaining quantity from the
//!   stored snapshot fields, never from the live position
//! - check_invariants (10 min): CLOSING without an active close request is
//!   a breach; force CLOSE_FAILED and raise a warning event

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::bus::EventBus;
use crate::config::{MAX_NOT_FOUND_RETRIES, STUCK_THRESHOLD_MINUTES, ZOMBIE_THRESHOLD_MINUTES};
use crate::models::{ComponentSource, EventType, ReasonCode, Severity, SystemEvent};

use super::handler::OrderUpdateHandler;
use super::models::{
    BrokerOrderUpdate, CloseOrderPayload, CloseRequestStatus, OrderRecord, PositionStatus,
    SUBMIT_CLOSE_ORDER,
};
use super::store::{
    close_requests_with_status_before, closing_positions_without_active_request,
    get_position, insert_outbox_event, pending_outbox_for_close_request, retryable_close_requests,
    update_close_request, update_position, OrderStore,
};

/// Broker-side order lookup. `Ok(None)` means the broker does not know the
/// order.
#[async_trait]
pub trait BrokerApi: Send + Sync {
    async fn query_order(&self, broker_order_id: &str) -> Result<Option<BrokerOrderUpdate>>;
}

pub struct Reconciler {
    store: OrderStore,
    broker_api: Arc<dyn BrokerApi>,
    handler: OrderUpdateHandler,
    bus: Option<Arc<EventBus>>,
}

impl Reconciler {
    pub fn new(
        store: OrderStore,
        broker_api: Arc<dyn BrokerApi>,
        bus: Option<Arc<EventBus>>,
    ) -> Self {
        let handler = OrderUpdateHandler::new(store.clone());
        Self {
            store,
            broker_api,
            handler,
            bus,
        }
    }

    /// PENDING close requests older than the zombie threshold without a
    /// matching PENDING outbox event were created by a process that died
    /// before writing the outbox row; the worker will never pick them up.
    pub async fn detect_zombies(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::minutes(ZOMBIE_THRESHOLD_MINUTES);
        self.store
            .with_tx(move |tx| {
                let candidates = close_requests_with_status_before(
                    tx,
                    CloseRequestStatus::Pending,
                    "created_at",
                    cutoff,
                )?;

                let mut fixed = 0;
                for mut request in candidates {
                    if pending_outbox_for_close_request(tx, &request.id)?.is_some() {
                        debug!(
                            close_request_id = request.id.as_str(),
                            "Pending outbox exists, letting the worker handle it"
                        );
                        continue;
                    }

                    warn!(
                        close_request_id = request.id.as_str(),
                        "Zombie close request, rolling back"
                    );
                    request.status = CloseRequestStatus::Failed;
                    request.completed_at = Some(Utc::now());
                    update_close_request(tx, &request)?;

                    if let Some(mut position) = get_position(tx, &request.position_id)? {
                        position.status = PositionStatus::Open;
                        position.active_close_request_id = None;
                        update_position(tx, &position)?;
                    }
                    fixed += 1;
                }
                Ok(fixed)
            })
            .await
    }

    /// SUBMITTED close requests past the stuck threshold get their orders
    /// re-queried at the broker. A found order's state flows through the
    /// normal update handler; repeated not-found marks the request failed.
    pub async fn recover_stuck_orders(&self) -> Result<()> {
        let cutoff = Utc::now() - Duration::minutes(STUCK_THRESHOLD_MINUTES);
        let stuck: Vec<(String, Vec<OrderRecord>)> = self
            .store
            .with_tx(move |tx| {
                let requests = close_requests_with_status_before(
                    tx,
                    CloseRequestStatus::Submitted,
                    "submitted_at",
                    cutoff,
                )?;
                requests
                    .into_iter()
                    .map(|request| {
                        let orders =
                            super::store::orders_for_close_request(tx, &request.id)?;
                        Ok((request.id, orders))
                    })
                    .collect()
            })
            .await?;

        for (close_request_id, orders) in stuck {
            for order in orders {
                let Some(broker_order_id) = order.broker_order_id.clone() else {
                    continue;
                };

                match self.broker_api.query_order(&broker_order_id).await {
                    Ok(Some(update)) => {
                        info!(
                            broker_order_id = broker_order_id.as_str(),
                            status = update.broker_status.as_str(),
                            "Recovered stuck order from broker"
                        );
                        if let Err(e) = self.handler.on_order_update(&update).await {
                            error!(
                                broker_order_id = broker_order_id.as_str(),
                                "Failed to apply recovered state: {e:#}"
                            );
                        }
                    }
                    Ok(None) => {
                        self.record_not_found(&close_request_id, &order).await?;
                    }
                    Err(e) => {
                        warn!(
                            broker_order_id = broker_order_id.as_str(),
                            "Broker API error: {e:#}"
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn record_not_found(&self, close_request_id: &str, order: &OrderRecord) -> Result<()> {
        let close_request_id = close_request_id.to_string();
        let mut order = order.clone();
        self.store
            .with_tx(move |tx| {
                order.reconcile_not_found_count += 1;
                super::store::update_order(tx, &order)?;

                if order.reconcile_not_found_count >= MAX_NOT_FOUND_RETRIES as i64 {
                    error!(
                        broker_order_id = order.broker_order_id.as_deref().unwrap_or(""),
                        attempts = order.reconcile_not_found_count,
                        "Order not found at broker after max retries"
                    );
                    if let Some(mut request) = super::store::get_close_request(tx, &close_request_id)? {
                        request.status = CloseRequestStatus::Failed;
                        request.completed_at = Some(Utc::now());
                        update_close_request(tx, &request)?;

                        if let Some(mut position) = get_position(tx, &request.position_id)? {
                            position.status = PositionStatus::CloseFailed;
                            update_position(tx, &position)?;
                        }
                    }
                }
                Ok(())
            })
            .await
    }

    /// RETRYABLE close requests with retries left get a fresh outbox event
    /// for the remaining quantity, built from the snapshot taken at
    /// creation.
    pub async fn retry_partial_fills(&self) -> Result<usize> {
        self.store
            .with_tx(|tx| {
                let retryable = retryable_close_requests(tx)?;

                let mut retried = 0;
                for mut request in retryable {
                    let remaining = request.target_qty - request.filled_qty;
                    if remaining <= 0 {
                        continue;
                    }

                    info!(
                        close_request_id = request.id.as_str(),
                        remaining,
                        target = request.target_qty,
                        "Retrying partial fill"
                    );

                    let payload = CloseOrderPayload {
                        close_request_id: request.id.clone(),
                        position_id: request.position_id.clone(),
                        symbol: request.symbol.clone(),
                        side: request.side.clone(),
                        qty: remaining,
                        asset_type: request.asset_type.clone(),
                        is_retry: Some(true),
                    };
                    insert_outbox_event(tx, SUBMIT_CLOSE_ORDER, &serde_json::to_value(&payload)?)?;

                    request.status = CloseRequestStatus::Pending;
                    request.retry_count += 1;
                    update_close_request(tx, &request)?;

                    if let Some(mut position) = get_position(tx, &request.position_id)? {
                        position.status = PositionStatus::Closing;
                        update_position(tx, &position)?;
                    }
                    retried += 1;
                }
                Ok(retried)
            })
            .await
    }

    /// A position in CLOSING must carry an active close request id.
    /// Breaches are forced to CLOSE_FAILED and raised as a warning event.
    pub async fn check_invariants(&self) -> Result<usize> {
        let breached = self
            .store
            .with_tx(|tx| {
                let orphaned = closing_positions_without_active_request(tx)?;
                let mut fixed = Vec::new();
                for mut position in orphaned {
                    error!(
                        position_id = position.id.as_str(),
                        "Invariant violation: CLOSING without active_close_request_id"
                    );
                    position.status = PositionStatus::CloseFailed;
                    update_position(tx, &position)?;
                    fixed.push(position.id);
                }
                Ok(fixed)
            })
            .await?;

        if let Some(bus) = &self.bus {
            for position_id in &breached {
                bus.publish(SystemEvent::new(
                    EventType::FailSupp,
                    ComponentSource::System,
                    Severity::Warning,
                    ReasonCode::PositionTruthUnknown,
                    Some(json!({ "position_id": position_id, "invariant": "closing_without_request" })),
                    None,
                ));
            }
        }
        Ok(breached.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orders::store::test_support::{make_close_request, make_position};
    use crate::orders::store::insert_close_request;
    use parking_lot::Mutex as PlMutex;

    struct ScriptedBroker {
        responses: PlMutex<Vec<Result<Option<BrokerOrderUpdate>>>>,
    }

    impl ScriptedBroker {
        fn not_found() -> Arc<Self> {
            Arc::new(Self {
                responses: PlMutex::new(Vec::new()),
            })
        }

        fn with_update(update: BrokerOrderUpdate) -> Arc<Self> {
            Arc::new(Self {
                responses: PlMutex::new(vec![Ok(Some(update))]),
            })
        }
    }

    #[async_trait]
    impl BrokerApi for ScriptedBroker {
        async fn query_order(&self, _broker_order_id: &str) -> Result<Option<BrokerOrderUpdate>> {
            self.responses.lock().pop().unwrap_or(Ok(None))
        }
    }

    async fn seed_position(store: &OrderStore, id: &str) {
        store.insert_position(&make_position(id)).await.unwrap();
    }

    #[tokio::test]
    async fn zombie_without_outbox_is_failed_and_position_reopened() {
        let store = OrderStore::in_memory().unwrap();
        seed_position(&store, "pos-1").await;

        // Close request created 3 minutes ago with NO outbox event: the
        // crash-between-writes shape.
        let mut request = make_close_request("cr-1", "pos-1", 10);
        request.created_at = Utc::now() - Duration::minutes(3);
        store
            .with_tx(|tx| {
                insert_close_request(tx, &request)?;
                tx.execute(
                    "UPDATE positions SET status = 'closing', active_close_request_id = 'cr-1'
                     WHERE id = 'pos-1'",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let reconciler = Reconciler::new(store.clone(), ScriptedBroker::not_found(), None);
        assert_eq!(reconciler.detect_zombies().await.unwrap(), 1);

        let request = store.close_request("cr-1").await.unwrap().unwrap();
        assert_eq!(request.status, CloseRequestStatus::Failed);

        let position = store.position("pos-1").await.unwrap().unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert!(position.active_close_request_id.is_none());
    }

    #[tokio::test]
    async fn zombie_with_pending_outbox_is_left_alone() {
        let store = OrderStore::in_memory().unwrap();
        seed_position(&store, "pos-1").await;

        let mut request = make_close_request("cr-1", "pos-1", 10);
        request.created_at = Utc::now() - Duration::minutes(3);
        // create_close_request writes the outbox event in the same tx, so
        // this request is old but dispatchable.
        store.create_close_request(&request).await.unwrap();

        let reconciler = Reconciler::new(store.clone(), ScriptedBroker::not_found(), None);
        assert_eq!(reconciler.detect_zombies().await.unwrap(), 0);

        let request = store.close_request("cr-1").await.unwrap().unwrap();
        assert_eq!(request.status, CloseRequestStatus::Pending);
    }

    #[tokio::test]
    async fn fresh_pending_request_is_not_a_zombie() {
        let store = OrderStore::in_memory().unwrap();
        seed_position(&store, "pos-1").await;
        let request = make_close_request("cr-1", "pos-1", 10);
        store
            .with_tx(|tx| insert_close_request(tx, &request))
            .await
            .unwrap();

        let reconciler = Reconciler::new(store.clone(), ScriptedBroker::not_found(), None);
        assert_eq!(reconciler.detect_zombies().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn partial_fill_retry_uses_snapshot_fields() {
        let store = OrderStore::in_memory().unwrap();
        seed_position(&store, "pos-1").await;

        let mut request = make_close_request("cr-1", "pos-1", 10);
        request.status = CloseRequestStatus::Retryable;
        request.filled_qty = 4;
        store
            .with_tx(|tx| {
                insert_close_request(tx, &request)?;
                tx.execute("UPDATE positions SET status = 'close_retryable' WHERE id = 'pos-1'", [])?;
                Ok(())
            })
            .await
            .unwrap();

        let reconciler = Reconciler::new(store.clone(), ScriptedBroker::not_found(), None);
        assert_eq!(reconciler.retry_partial_fills().await.unwrap(), 1);

        let request = store.close_request("cr-1").await.unwrap().unwrap();
        assert_eq!(request.status, CloseRequestStatus::Pending);
        assert_eq!(request.retry_count, 1);

        let position = store.position("pos-1").await.unwrap().unwrap();
        assert_eq!(position.status, PositionStatus::Closing);

        let events = store.claim_pending_outbox(1).await.unwrap();
        assert_eq!(events.len(), 1);
        let payload = &events[0].payload;
        assert_eq!(payload["qty"], 6);
        assert_eq!(payload["is_retry"], true);
        assert_eq!(payload["side"], "SELL");
        assert_eq!(payload["symbol"], "AAPL");
    }

    #[tokio::test]
    async fn exhausted_retries_are_not_retried_again() {
        let store = OrderStore::in_memory().unwrap();
        seed_position(&store, "pos-1").await;

        let mut request = make_close_request("cr-1", "pos-1", 10);
        request.status = CloseRequestStatus::Retryable;
        request.filled_qty = 4;
        request.retry_count = 3;
        store
            .with_tx(|tx| insert_close_request(tx, &request))
            .await
            .unwrap();

        let reconciler = Reconciler::new(store.clone(), ScriptedBroker::not_found(), None);
        assert_eq!(reconciler.retry_partial_fills().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn stuck_order_routes_broker_state_through_handler() {
        let store = OrderStore::in_memory().unwrap();
        seed_position(&store, "pos-1").await;

        let mut request = make_close_request("cr-1", "pos-1", 10);
        request.status = CloseRequestStatus::Submitted;
        request.submitted_at = Some(Utc::now() - Duration::minutes(15));
        store
            .with_tx(|tx| insert_close_request(tx, &request))
            .await
            .unwrap();
        store
            .insert_order(&OrderRecord {
                order_id: "ord-1".to_string(),
                broker_order_id: Some("bo-1".to_string()),
                close_request_id: Some("cr-1".to_string()),
                status: crate::orders::models::OrderStatus::Submitted,
                filled_qty: 0,
                broker_update_seq: None,
                last_broker_update_at: None,
                reconcile_not_found_count: 0,
            })
            .await
            .unwrap();

        let broker = ScriptedBroker::with_update(BrokerOrderUpdate {
            broker_order_id: "bo-1".to_string(),
            broker_status: "FILLED".to_string(),
            filled_qty: 10,
            broker_update_seq: Some(1),
        });
        let reconciler = Reconciler::new(store.clone(), broker, None);
        reconciler.recover_stuck_orders().await.unwrap();

        let request = store.close_request("cr-1").await.unwrap().unwrap();
        assert_eq!(request.status, CloseRequestStatus::Completed);
        let position = store.position("pos-1").await.unwrap().unwrap();
        assert_eq!(position.status, PositionStatus::Closed);
    }

    #[tokio::test]
    async fn repeated_not_found_fails_request_and_position() {
        let store = OrderStore::in_memory().unwrap();
        seed_position(&store, "pos-1").await;

        let mut request = make_close_request("cr-1", "pos-1", 10);
        request.status = CloseRequestStatus::Submitted;
        request.submitted_at = Some(Utc::now() - Duration::minutes(15));
        store
            .with_tx(|tx| insert_close_request(tx, &request))
            .await
            .unwrap();
        store
            .insert_order(&OrderRecord {
                order_id: "ord-1".to_string(),
                broker_order_id: Some("bo-1".to_string()),
                close_request_id: Some("cr-1".to_string()),
                status: crate::orders::models::OrderStatus::Submitted,
                filled_qty: 0,
                broker_update_seq: None,
                last_broker_update_at: None,
                reconcile_not_found_count: 0,
            })
            .await
            .unwrap();

        let reconciler = Reconciler::new(store.clone(), ScriptedBroker::not_found(), None);
        for _ in 0..3 {
            reconciler.recover_stuck_orders().await.unwrap();
        }

        let request = store.close_request("cr-1").await.unwrap().unwrap();
        assert_eq!(request.status, CloseRequestStatus::Failed);
        let position = store.position("pos-1").await.unwrap().unwrap();
        assert_eq!(position.status, PositionStatus::CloseFailed);
    }

    #[tokio::test]
    async fn closing_without_request_is_forced_close_failed() {
        let store = OrderStore::in_memory().unwrap();
        seed_position(&store, "pos-1").await;
        store
            .with_tx(|tx| {
                tx.execute(
                    "UPDATE positions SET status = 'closing', active_close_request_id = NULL
                     WHERE id = 'pos-1'",
                    [],
                )?;
                Ok(())
            })
            .await
            .unwrap();

        let reconciler = Reconciler::new(store.clone(), ScriptedBroker::not_found(), None);
        assert_eq!(reconciler.check_invariants().await.unwrap(), 1);

        let position = store.position("pos-1").await.unwrap().unwrap();
        assert_eq!(position.status, PositionStatus::CloseFailed);
    }
}
