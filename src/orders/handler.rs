//! Broker order update handling: idempotent, monotonic, terminal-safe.
//!
//! Invariants enforced per update, under one transaction per order row:
//! - updates with a stale `broker_update_seq` are ignored
//! - status only progresses forward through the priority table; the one
//!   exception is a late FILLED upgrading a terminal
//!   CANCELLED/REJECTED/EXPIRED (the broker's final word)
//! - `filled_qty` is monotonically non-decreasing under all conditions
//! - once FILLED, nothing changes the order again

use anyhow::Result;
use chrono::Utc;
use rusqlite::Transaction;
use tracing::{debug, info, warn};

use super::models::{BrokerOrderUpdate, CloseRequestStatus, OrderRecord, OrderStatus, PositionStatus};
use super::store::{
    get_close_request, get_order_by_broker_id, get_position, orders_for_close_request,
    update_close_request, update_order, update_position, OrderStore,
};

pub struct OrderUpdateHandler {
    store: OrderStore,
}

impl OrderUpdateHandler {
    pub fn new(store: OrderStore) -> Self {
        Self { store }
    }

    /// Apply one broker update. Unknown orders and unknown broker statuses
    /// are logged and ignored.
    pub async fn on_order_update(&self, update: &BrokerOrderUpdate) -> Result<()> {
        let update = update.clone();
        self.store
            .with_tx(move |tx| apply_update(tx, &update))
            .await
    }
}

fn apply_update(tx: &Transaction<'_>, update: &BrokerOrderUpdate) -> Result<()> {
    let Some(mut order) = get_order_by_broker_id(tx, &update.broker_order_id)? else {
        warn!(
            broker_order_id = update.broker_order_id.as_str(),
            "Unknown order update"
        );
        return Ok(());
    };

    let Some(new_status) = OrderStatus::from_broker(&update.broker_status) else {
        warn!(
            broker_status = update.broker_status.as_str(),
            "Unknown broker status"
        );
        return Ok(());
    };

    // Idempotency: skip already-processed sequences when both sides carry
    // one.
    if let (Some(seq), Some(stored)) = (update.broker_update_seq, order.broker_update_seq) {
        if seq <= stored {
            debug!(
                broker_order_id = update.broker_order_id.as_str(),
                seq, stored, "Skipping stale update"
            );
            return Ok(());
        }
    }

    if order.status.is_terminal() {
        if order.status == OrderStatus::Filled {
            debug!(
                broker_order_id = update.broker_order_id.as_str(),
                "Order already FILLED, ignoring"
            );
            return Ok(());
        }

        // Late FILLED: the broker's final word upgrades a terminal
        // cancel/reject/expire.
        if new_status == OrderStatus::Filled && update.filled_qty > order.filled_qty {
            info!(
                broker_order_id = update.broker_order_id.as_str(),
                from = order.status.as_str(),
                "Late FILLED upgrade"
            );
            order.status = OrderStatus::Filled;
            order.filled_qty = update.filled_qty;
            order.broker_update_seq = update.broker_update_seq.or(order.broker_update_seq);
            order.last_broker_update_at = Some(Utc::now());
            update_order(tx, &order)?;
            return recompute_close_request(tx, &order);
        }

        // Terminal to terminal: only the fill quantity may rise.
        order.filled_qty = order.filled_qty.max(update.filled_qty);
        order.broker_update_seq = update.broker_update_seq.or(order.broker_update_seq);
        update_order(tx, &order)?;
        return Ok(());
    }

    // Monotonic progression: a backward status is ignored, but its fill
    // quantity still counts.
    if new_status.priority() < order.status.priority() {
        warn!(
            broker_order_id = update.broker_order_id.as_str(),
            from = order.status.as_str(),
            to = new_status.as_str(),
            "Ignoring backward status"
        );
        order.filled_qty = order.filled_qty.max(update.filled_qty);
        order.broker_update_seq = update.broker_update_seq.or(order.broker_update_seq);
        update_order(tx, &order)?;
        return Ok(());
    }

    order.status = new_status;
    order.filled_qty = order.filled_qty.max(update.filled_qty);
    order.broker_update_seq = update.broker_update_seq.or(order.broker_update_seq);
    order.last_broker_update_at = Some(Utc::now());
    update_order(tx, &order)?;

    recompute_close_request(tx, &order)
}

/// After any successful advance of a close-linked order, re-derive the
/// close request and position from the full set of linked orders.
fn recompute_close_request(tx: &Transaction<'_>, order: &OrderRecord) -> Result<()> {
    let Some(close_request_id) = &order.close_request_id else {
        return Ok(());
    };
    let Some(mut request) = get_close_request(tx, close_request_id)? else {
        return Ok(());
    };
    let Some(mut position) = get_position(tx, &request.position_id)? else {
        return Ok(());
    };

    let orders = orders_for_close_request(tx, close_request_id)?;
    let total_filled: i64 = orders.iter().map(|o| o.filled_qty).sum();
    request.filled_qty = total_filled;

    let all_terminal = orders.iter().all(|o| o.status.is_terminal());
    if !all_terminal {
        // Still waiting on live orders; just track the fill.
        return update_close_request(tx, &request);
    }

    if total_filled == request.target_qty {
        request.status = CloseRequestStatus::Completed;
        request.completed_at = Some(Utc::now());
        position.status = PositionStatus::Closed;
        position.active_close_request_id = None;
        info!(close_request_id, "Close request completed");
    } else if total_filled == 0 {
        request.status = CloseRequestStatus::Failed;
        request.completed_at = Some(Utc::now());
        position.status = PositionStatus::Open;
        position.active_close_request_id = None;
        info!(close_request_id, "Close request failed with zero fill");
    } else if total_filled < request.target_qty {
        request.status = CloseRequestStatus::Retryable;
        position.status = PositionStatus::CloseRetryable;
        info!(
            close_request_id,
            filled = total_filled,
            target = request.target_qty,
            "Close request partially filled, retryable"
        );
    } else {
        // Overfill: the broker filled more than was targeted. Nothing is
        // left to retry, so treat the close as done and flag it loudly for
        // reconciliation against broker reports.
        request.status = CloseRequestStatus::Completed;
        request.completed_at = Some(Utc::now());
        position.status = PositionStatus::Closed;
        position.active_close_request_id = None;
        warn!(
            close_request_id,
            filled = total_filled,
            target = request.target_qty,
            "Close request overfilled, completing"
        );
    }

    update_close_request(tx, &request)?;
    update_position(tx, &position)
}
