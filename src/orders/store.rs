//! SQLite persistence for the order close flow.
//!
//! One serialized connection behind an async mutex; every multi-step
//! update runs inside a single transaction, which is what stands in for
//! row locks on this engine. The transactional-outbox invariant lives
//! here: a close request and its SUBMIT_CLOSE_ORDER outbox event are
//! written in the same transaction.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tracing::{debug, info};

use super::models::{
    CloseOrderPayload, CloseRequest, CloseRequestStatus, OrderRecord, OrderStatus, OutboxEvent,
    OutboxStatus, Position, PositionStatus, SUBMIT_CLOSE_ORDER,
};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS positions (
    id TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    qty INTEGER NOT NULL,
    status TEXT NOT NULL,
    active_close_request_id TEXT
);

CREATE TABLE IF NOT EXISTS close_requests (
    id TEXT PRIMARY KEY,
    position_id TEXT NOT NULL,
    symbol TEXT NOT NULL,
    side TEXT NOT NULL,
    asset_type TEXT NOT NULL,
    target_qty INTEGER NOT NULL,
    filled_qty INTEGER NOT NULL DEFAULT 0,
    retry_count INTEGER NOT NULL DEFAULT 0,
    max_retries INTEGER NOT NULL DEFAULT 3,
    status TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    submitted_at INTEGER,
    completed_at INTEGER
);
CREATE INDEX IF NOT EXISTS idx_close_requests_status ON close_requests(status);

CREATE TABLE IF NOT EXISTS orders (
    order_id TEXT PRIMARY KEY,
    broker_order_id TEXT UNIQUE,
    close_request_id TEXT,
    status TEXT NOT NULL,
    filled_qty INTEGER NOT NULL DEFAULT 0,
    broker_update_seq INTEGER,
    last_broker_update_at INTEGER,
    reconcile_not_found_count INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_orders_close_request ON orders(close_request_id);

CREATE TABLE IF NOT EXISTS outbox_events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'pending',
    created_at INTEGER NOT NULL,
    claimed_at INTEGER,
    attempts INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_outbox_status_id ON outbox_events(status, id);
"#;

fn to_ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn opt_ts(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(to_ts)
}

#[derive(Clone)]
pub struct OrderStore {
    conn: Arc<tokio::sync::Mutex<Connection>>,
}

impl OrderStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).context("open order store")?;
        conn.pragma_update(None, "journal_mode", "WAL").ok();
        conn.pragma_update(None, "synchronous", "NORMAL").ok();
        conn.execute_batch(SCHEMA_SQL).context("create schema")?;
        info!(db_path, "Order store ready");
        Ok(Self {
            conn: Arc::new(tokio::sync::Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory store")?;
        conn.execute_batch(SCHEMA_SQL).context("create schema")?;
        Ok(Self {
            conn: Arc::new(tokio::sync::Mutex::new(conn)),
        })
    }

    /// Run `f` inside one transaction. The closure gets exclusive access to
    /// the rows it touches; commit happens only if it returns Ok.
    pub async fn with_tx<T>(
        &self,
        f: impl FnOnce(&Transaction<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().context("begin transaction")?;
        let out = f(&tx)?;
        tx.commit().context("commit transaction")?;
        Ok(out)
    }

    pub async fn insert_position(&self, position: &Position) -> Result<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT INTO positions (id, symbol, qty, status, active_close_request_id)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    position.id,
                    position.symbol,
                    position.qty,
                    position.status.as_str(),
                    position.active_close_request_id,
                ],
            )?;
            Ok(())
        })
        .await
    }

    pub async fn position(&self, id: &str) -> Result<Option<Position>> {
        self.with_tx(|tx| get_position(tx, id)).await
    }

    pub async fn close_request(&self, id: &str) -> Result<Option<CloseRequest>> {
        self.with_tx(|tx| get_close_request(tx, id)).await
    }

    pub async fn order_by_broker_id(&self, broker_order_id: &str) -> Result<Option<OrderRecord>> {
        self.with_tx(|tx| get_order_by_broker_id(tx, broker_order_id))
            .await
    }

    pub async fn insert_order(&self, order: &OrderRecord) -> Result<()> {
        self.with_tx(|tx| insert_order(tx, order)).await
    }

    pub async fn outbox_event(&self, id: i64) -> Result<Option<OutboxEvent>> {
        self.with_tx(|tx| {
            tx.query_row(
                "SELECT id, event_type, payload, status, created_at, claimed_at, attempts
                 FROM outbox_events WHERE id = ?1",
                params![id],
                outbox_from_row,
            )
            .optional()
            .context("load outbox event")
        })
        .await
    }

    /// Create a close request: flips the position to CLOSING, stamps its
    /// `active_close_request_id`, and writes the SUBMIT_CLOSE_ORDER outbox
    /// event, all in the same transaction. A crash can never leave intent
    /// without a dispatchable record.
    pub async fn create_close_request(&self, request: &CloseRequest) -> Result<i64> {
        let payload = CloseOrderPayload {
            close_request_id: request.id.clone(),
            position_id: request.position_id.clone(),
            symbol: request.symbol.clone(),
            side: request.side.clone(),
            qty: request.target_qty,
            asset_type: request.asset_type.clone(),
            is_retry: None,
        };
        let request = request.clone();
        self.with_tx(move |tx| {
            insert_close_request(tx, &request)?;
            tx.execute(
                "UPDATE positions SET status = ?1, active_close_request_id = ?2 WHERE id = ?3",
                params![
                    PositionStatus::Closing.as_str(),
                    request.id,
                    request.position_id
                ],
            )?;
            insert_outbox_event(tx, SUBMIT_CLOSE_ORDER, &serde_json::to_value(&payload)?)
        })
        .await
    }

    /// Atomically claim up to `limit` PENDING outbox events: the status
    /// moves to IN_FLIGHT inside the claim transaction, so concurrent
    /// workers never double-process.
    pub async fn claim_pending_outbox(&self, limit: usize) -> Result<Vec<OutboxEvent>> {
        self.with_tx(|tx| {
            let mut stmt = tx.prepare_cached(
                "SELECT id, event_type, payload, status, created_at, claimed_at, attempts
                 FROM outbox_events WHERE status = 'pending' ORDER BY id LIMIT ?1",
            )?;
            let mut events: Vec<OutboxEvent> = stmt
                .query_map(params![limit as i64], outbox_from_row)?
                .collect::<std::result::Result<_, _>>()?;

            let now = to_ts(Utc::now());
            for event in &mut events {
                tx.execute(
                    "UPDATE outbox_events SET status = 'in_flight', claimed_at = ?1 WHERE id = ?2",
                    params![now, event.id],
                )?;
                event.status = OutboxStatus::InFlight;
                event.claimed_at = Some(from_ts(now));
            }
            Ok(events)
        })
        .await
    }

    pub async fn mark_outbox_done(&self, id: i64) -> Result<()> {
        self.with_tx(move |tx| {
            tx.execute(
                "UPDATE outbox_events SET status = 'done' WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
        .await
    }

    /// Release a claimed event back to PENDING without charging an
    /// attempt. Used when dispatch is refused by the gate rather than
    /// failing.
    pub async fn release_outbox(&self, id: i64) -> Result<()> {
        self.with_tx(move |tx| {
            tx.execute(
                "UPDATE outbox_events SET status = 'pending', claimed_at = NULL WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
        .await
    }

    /// Record a processing failure: the event goes back to PENDING for
    /// another attempt, or to DEAD once `max_attempts` is exhausted.
    pub async fn record_outbox_failure(&self, id: i64, max_attempts: u32) -> Result<OutboxStatus> {
        self.with_tx(move |tx| {
            tx.execute(
                "UPDATE outbox_events SET attempts = attempts + 1 WHERE id = ?1",
                params![id],
            )?;
            let attempts: i64 = tx.query_row(
                "SELECT attempts FROM outbox_events WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )?;
            let status = if attempts >= max_attempts as i64 {
                OutboxStatus::Dead
            } else {
                OutboxStatus::Pending
            };
            tx.execute(
                "UPDATE outbox_events SET status = ?1 WHERE id = ?2",
                params![status.as_str(), id],
            )?;
            Ok(status)
        })
        .await
    }

    /// Purge DONE/DEAD events created before `cutoff`.
    pub async fn cleanup_outbox(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        self.with_tx(move |tx| {
            let purged = tx.execute(
                "DELETE FROM outbox_events
                 WHERE status IN ('done', 'dead') AND created_at < ?1",
                params![to_ts(cutoff)],
            )?;
            Ok(purged)
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Row-level helpers. These run inside a caller-owned transaction; that
// transaction is the row lock.
// ---------------------------------------------------------------------------

pub fn get_position(tx: &Transaction<'_>, id: &str) -> Result<Option<Position>> {
    tx.query_row(
        "SELECT id, symbol, qty, status, active_close_request_id FROM positions WHERE id = ?1",
        params![id],
        position_from_row,
    )
    .optional()
    .context("load position")
}

pub fn update_position(tx: &Transaction<'_>, position: &Position) -> Result<()> {
    tx.execute(
        "UPDATE positions SET symbol = ?1, qty = ?2, status = ?3, active_close_request_id = ?4
         WHERE id = ?5",
        params![
            position.symbol,
            position.qty,
            position.status.as_str(),
            position.active_close_request_id,
            position.id,
        ],
    )
    .context("update position")?;
    Ok(())
}

pub fn get_close_request(tx: &Transaction<'_>, id: &str) -> Result<Option<CloseRequest>> {
    tx.query_row(
        "SELECT id, position_id, symbol, side, asset_type, target_qty, filled_qty,
                retry_count, max_retries, status, created_at, submitted_at, completed_at
         FROM close_requests WHERE id = ?1",
        params![id],
        close_request_from_row,
    )
    .optional()
    .context("load close request")
}

pub fn insert_close_request(tx: &Transaction<'_>, request: &CloseRequest) -> Result<()> {
    tx.execute(
        "INSERT INTO close_requests
         (id, position_id, symbol, side, asset_type, target_qty, filled_qty,
          retry_count, max_retries, status, created_at, submitted_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            request.id,
            request.position_id,
            request.symbol,
            request.side,
            request.asset_type,
            request.target_qty,
            request.filled_qty,
            request.retry_count,
            request.max_retries,
            request.status.as_str(),
            to_ts(request.created_at),
            opt_ts(request.submitted_at),
            opt_ts(request.completed_at),
        ],
    )
    .context("insert close request")?;
    Ok(())
}

pub fn update_close_request(tx: &Transaction<'_>, request: &CloseRequest) -> Result<()> {
    tx.execute(
        "UPDATE close_requests SET filled_qty = ?1, retry_count = ?2, status = ?3,
                submitted_at = ?4, completed_at = ?5
         WHERE id = ?6",
        params![
            request.filled_qty,
            request.retry_count,
            request.status.as_str(),
            opt_ts(request.submitted_at),
            opt_ts(request.completed_at),
            request.id,
        ],
    )
    .context("update close request")?;
    Ok(())
}

pub fn close_requests_with_status_before(
    tx: &Transaction<'_>,
    status: CloseRequestStatus,
    time_column: &str,
    cutoff: DateTime<Utc>,
) -> Result<Vec<CloseRequest>> {
    // time_column comes from a fixed call-site set, never user input.
    let sql = format!(
        "SELECT id, position_id, symbol, side, asset_type, target_qty, filled_qty,
                retry_count, max_retries, status, created_at, submitted_at, completed_at
         FROM close_requests WHERE status = ?1 AND {time_column} < ?2"
    );
    let mut stmt = tx.prepare(&sql)?;
    let requests = stmt
        .query_map(params![status.as_str(), to_ts(cutoff)], close_request_from_row)?
        .collect::<std::result::Result<_, _>>()?;
    Ok(requests)
}

pub fn retryable_close_requests(tx: &Transaction<'_>) -> Result<Vec<CloseRequest>> {
    let mut stmt = tx.prepare_cached(
        "SELECT id, position_id, symbol, side, asset_type, target_qty, filled_qty,
                retry_count, max_retries, status, created_at, submitted_at, completed_at
         FROM close_requests WHERE status = 'retryable' AND retry_count < max_retries",
    )?;
    let requests = stmt
        .query_map([], close_request_from_row)?
        .collect::<std::result::Result<_, _>>()?;
    Ok(requests)
}

pub fn closing_positions_without_active_request(
    tx: &Transaction<'_>,
) -> Result<Vec<Position>> {
    let mut stmt = tx.prepare_cached(
        "SELECT id, symbol, qty, status, active_close_request_id FROM positions
         WHERE status = 'closing' AND active_close_request_id IS NULL",
    )?;
    let positions = stmt
        .query_map([], position_from_row)?
        .collect::<std::result::Result<_, _>>()?;
    Ok(positions)
}

pub fn get_order_by_broker_id(
    tx: &Transaction<'_>,
    broker_order_id: &str,
) -> Result<Option<OrderRecord>> {
    tx.query_row(
        "SELECT order_id, broker_order_id, close_request_id, status, filled_qty,
                broker_update_seq, last_broker_update_at, reconcile_not_found_count
         FROM orders WHERE broker_order_id = ?1",
        params![broker_order_id],
        order_from_row,
    )
    .optional()
    .context("load order")
}

pub fn orders_for_close_request(
    tx: &Transaction<'_>,
    close_request_id: &str,
) -> Result<Vec<OrderRecord>> {
    let mut stmt = tx.prepare_cached(
        "SELECT order_id, broker_order_id, close_request_id, status, filled_qty,
                broker_update_seq, last_broker_update_at, reconcile_not_found_count
         FROM orders WHERE close_request_id = ?1",
    )?;
    let orders = stmt
        .query_map(params![close_request_id], order_from_row)?
        .collect::<std::result::Result<_, _>>()?;
    Ok(orders)
}

pub fn insert_order(tx: &Transaction<'_>, order: &OrderRecord) -> Result<()> {
    tx.execute(
        "INSERT INTO orders
         (order_id, broker_order_id, close_request_id, status, filled_qty,
          broker_update_seq, last_broker_update_at, reconcile_not_found_count)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            order.order_id,
            order.broker_order_id,
            order.close_request_id,
            order.status.as_str(),
            order.filled_qty,
            order.broker_update_seq,
            opt_ts(order.last_broker_update_at),
            order.reconcile_not_found_count,
        ],
    )
    .context("insert order")?;
    Ok(())
}

pub fn update_order(tx: &Transaction<'_>, order: &OrderRecord) -> Result<()> {
    tx.execute(
        "UPDATE orders SET status = ?1, filled_qty = ?2, broker_update_seq = ?3,
                last_broker_update_at = ?4, reconcile_not_found_count = ?5
         WHERE order_id = ?6",
        params![
            order.status.as_str(),
            order.filled_qty,
            order.broker_update_seq,
            opt_ts(order.last_broker_update_at),
            order.reconcile_not_found_count,
            order.order_id,
        ],
    )
    .context("update order")?;
    Ok(())
}

/// Find a PENDING SUBMIT_CLOSE_ORDER outbox event for a close request.
/// Payloads are filtered in code, keeping the query portable.
pub fn pending_outbox_for_close_request(
    tx: &Transaction<'_>,
    close_request_id: &str,
) -> Result<Option<OutboxEvent>> {
    let mut stmt = tx.prepare_cached(
        "SELECT id, event_type, payload, status, created_at, claimed_at, attempts
         FROM outbox_events WHERE event_type = ?1 AND status = 'pending'",
    )?;
    let events: Vec<OutboxEvent> = stmt
        .query_map(params![SUBMIT_CLOSE_ORDER], outbox_from_row)?
        .collect::<std::result::Result<_, _>>()?;

    Ok(events.into_iter().find(|event| {
        event
            .payload
            .get("close_request_id")
            .and_then(|v| v.as_str())
            == Some(close_request_id)
    }))
}

pub fn insert_outbox_event(
    tx: &Transaction<'_>,
    event_type: &str,
    payload: &serde_json::Value,
) -> Result<i64> {
    tx.execute(
        "INSERT INTO outbox_events (event_type, payload, status, created_at, attempts)
         VALUES (?1, ?2, 'pending', ?3, 0)",
        params![event_type, payload.to_string(), to_ts(Utc::now())],
    )
    .context("insert outbox event")?;
    let id = tx.last_insert_rowid();
    debug!(event_type, outbox_id = id, "Outbox event written");
    Ok(id)
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

fn parse_or_invalid<T>(parsed: Option<T>, what: &str, raw: &str) -> rusqlite::Result<T> {
    parsed.ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("invalid {what}: {raw}").into(),
        )
    })
}

fn position_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Position> {
    let status: String = row.get(3)?;
    Ok(Position {
        id: row.get(0)?,
        symbol: row.get(1)?,
        qty: row.get(2)?,
        status: parse_or_invalid(PositionStatus::parse(&status), "position status", &status)?,
        active_close_request_id: row.get(4)?,
    })
}

fn close_request_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<CloseRequest> {
    let status: String = row.get(9)?;
    Ok(CloseRequest {
        id: row.get(0)?,
        position_id: row.get(1)?,
        symbol: row.get(2)?,
        side: row.get(3)?,
        asset_type: row.get(4)?,
        target_qty: row.get(5)?,
        filled_qty: row.get(6)?,
        retry_count: row.get(7)?,
        max_retries: row.get(8)?,
        status: parse_or_invalid(
            CloseRequestStatus::parse(&status),
            "close request status",
            &status,
        )?,
        created_at: from_ts(row.get(10)?),
        submitted_at: row.get::<_, Option<i64>>(11)?.map(from_ts),
        completed_at: row.get::<_, Option<i64>>(12)?.map(from_ts),
    })
}

fn order_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderRecord> {
    let status: String = row.get(3)?;
    Ok(OrderRecord {
        order_id: row.get(0)?,
        broker_order_id: row.get(1)?,
        close_request_id: row.get(2)?,
        status: parse_or_invalid(OrderStatus::parse(&status), "order status", &status)?,
        filled_qty: row.get(4)?,
        broker_update_seq: row.get(5)?,
        last_broker_update_at: row.get::<_, Option<i64>>(6)?.map(from_ts),
        reconcile_not_found_count: row.get(7)?,
    })
}

fn outbox_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEvent> {
    let status: String = row.get(3)?;
    let payload: String = row.get(2)?;
    Ok(OutboxEvent {
        id: row.get(0)?,
        event_type: row.get(1)?,
        payload: serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?,
        status: parse_or_invalid(OutboxStatus::parse(&status), "outbox status", &status)?,
        created_at: from_ts(row.get(4)?),
        claimed_at: row.get::<_, Option<i64>>(5)?.map(from_ts),
        attempts: row.get(6)?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn make_position(id: &str) -> Position {
        Position {
            id: id.to_string(),
            symbol: "AAPL".to_string(),
            qty: 10,
            status: PositionStatus::Open,
            active_close_request_id: None,
        }
    }

    pub fn make_close_request(id: &str, position_id: &str, target_qty: i64) -> CloseRequest {
        CloseRequest {
            id: id.to_string(),
            position_id: position_id.to_string(),
            symbol: "AAPL".to_string(),
            side: "SELL".to_string(),
            asset_type: "equity".to_string(),
            target_qty,
            filled_qty: 0,
            retry_count: 0,
            max_retries: 3,
            status: CloseRequestStatus::Pending,
            created_at: Utc::now(),
            submitted_at: None,
            completed_at: None,
        }
    }
}
