//! Order lifecycle records: orders, close requests, positions and the
//! transactional outbox.
//!
//! Order status progression is monotonic per the priority table; FILLED is
//! the broker's final word and the single allowed upgrade out of a
//! terminal CANCELLED/REJECTED/EXPIRED.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Internal order status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Submitted,
    PartialFill,
    CancelReq,
    Cancelled,
    Rejected,
    Expired,
    Filled,
}

impl OrderStatus {
    /// Monotonic progression priority. Lower priorities never overwrite
    /// higher ones.
    pub fn priority(&self) -> u8 {
        match self {
            OrderStatus::Pending => 0,
            OrderStatus::Submitted => 1,
            OrderStatus::PartialFill | OrderStatus::CancelReq => 2,
            OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired => 3,
            OrderStatus::Filled => 4,
        }
    }

    /// Terminal states need special handling: no further broker-driven
    /// progression is expected, except the late FILLED upgrade.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Rejected | OrderStatus::Expired
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Submitted => "submitted",
            OrderStatus::PartialFill => "partial",
            OrderStatus::CancelReq => "cancel_req",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Rejected => "rejected",
            OrderStatus::Expired => "expired",
            OrderStatus::Filled => "filled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OrderStatus::Pending),
            "submitted" => Some(OrderStatus::Submitted),
            "partial" => Some(OrderStatus::PartialFill),
            "cancel_req" => Some(OrderStatus::CancelReq),
            "cancelled" => Some(OrderStatus::Cancelled),
            "rejected" => Some(OrderStatus::Rejected),
            "expired" => Some(OrderStatus::Expired),
            "filled" => Some(OrderStatus::Filled),
            _ => None,
        }
    }

    /// Map a broker-reported status string. Unknown statuses return None
    /// and are logged and ignored by the handler.
    pub fn from_broker(broker_status: &str) -> Option<Self> {
        match broker_status.to_ascii_uppercase().as_str() {
            "NEW" => Some(OrderStatus::Pending),
            "SUBMITTED" => Some(OrderStatus::Submitted),
            "PARTIAL" | "PARTIAL_FILL" => Some(OrderStatus::PartialFill),
            "FILLED" => Some(OrderStatus::Filled),
            "CANCELLED" => Some(OrderStatus::Cancelled),
            "REJECTED" => Some(OrderStatus::Rejected),
            "EXPIRED" => Some(OrderStatus::Expired),
            _ => None,
        }
    }
}

/// Close request lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseRequestStatus {
    Pending,
    Submitted,
    Completed,
    Failed,
    Retryable,
}

impl CloseRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseRequestStatus::Pending => "pending",
            CloseRequestStatus::Submitted => "submitted",
            CloseRequestStatus::Completed => "completed",
            CloseRequestStatus::Failed => "failed",
            CloseRequestStatus::Retryable => "retryable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(CloseRequestStatus::Pending),
            "submitted" => Some(CloseRequestStatus::Submitted),
            "completed" => Some(CloseRequestStatus::Completed),
            "failed" => Some(CloseRequestStatus::Failed),
            "retryable" => Some(CloseRequestStatus::Retryable),
            _ => None,
        }
    }
}

/// Position lifecycle. Invariant: CLOSING requires an
/// `active_close_request_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closing,
    Closed,
    CloseFailed,
    CloseRetryable,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closing => "closing",
            PositionStatus::Closed => "closed",
            PositionStatus::CloseFailed => "close_failed",
            PositionStatus::CloseRetryable => "close_retryable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(PositionStatus::Open),
            "closing" => Some(PositionStatus::Closing),
            "closed" => Some(PositionStatus::Closed),
            "close_failed" => Some(PositionStatus::CloseFailed),
            "close_retryable" => Some(PositionStatus::CloseRetryable),
            _ => None,
        }
    }
}

/// Outbox event lifecycle. PENDING -> IN_FLIGHT happens atomically inside
/// the claim transaction so multiple workers are safe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    InFlight,
    Done,
    Dead,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::InFlight => "in_flight",
            OutboxStatus::Done => "done",
            OutboxStatus::Dead => "dead",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OutboxStatus::Pending),
            "in_flight" => Some(OutboxStatus::InFlight),
            "done" => Some(OutboxStatus::Done),
            "dead" => Some(OutboxStatus::Dead),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub order_id: String,
    pub broker_order_id: Option<String>,
    pub close_request_id: Option<String>,
    pub status: OrderStatus,
    pub filled_qty: i64,
    pub broker_update_seq: Option<i64>,
    pub last_broker_update_at: Option<DateTime<Utc>>,
    pub reconcile_not_found_count: i64,
}

/// Close intent. `target_qty`, `side`, `symbol` and `asset_type` are
/// snapshots taken at creation; retries must reuse them and never
/// re-derive from the live position.
#[derive(Debug, Clone)]
pub struct CloseRequest {
    pub id: String,
    pub position_id: String,
    pub symbol: String,
    pub side: String,
    pub asset_type: String,
    pub target_qty: i64,
    pub filled_qty: i64,
    pub retry_count: i64,
    pub max_retries: i64,
    pub status: CloseRequestStatus,
    pub created_at: DateTime<Utc>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub qty: i64,
    pub status: PositionStatus,
    pub active_close_request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OutboxEvent {
    pub id: i64,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub attempts: i64,
}

/// Outbox event type for close order submission.
pub const SUBMIT_CLOSE_ORDER: &str = "SUBMIT_CLOSE_ORDER";

/// Payload of a SUBMIT_CLOSE_ORDER outbox event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloseOrderPayload {
    pub close_request_id: String,
    pub position_id: String,
    pub symbol: String,
    pub side: String,
    pub qty: i64,
    pub asset_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_retry: Option<bool>,
}

/// One order update as reported by the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerOrderUpdate {
    pub broker_order_id: String,
    pub broker_status: String,
    pub filled_qty: i64,
    pub broker_update_seq: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_priorities_follow_progression() {
        assert!(OrderStatus::Pending.priority() < OrderStatus::Submitted.priority());
        assert!(OrderStatus::Submitted.priority() < OrderStatus::PartialFill.priority());
        assert_eq!(
            OrderStatus::PartialFill.priority(),
            OrderStatus::CancelReq.priority()
        );
        assert!(OrderStatus::CancelReq.priority() < OrderStatus::Cancelled.priority());
        assert_eq!(
            OrderStatus::Cancelled.priority(),
            OrderStatus::Rejected.priority()
        );
        assert!(OrderStatus::Expired.priority() < OrderStatus::Filled.priority());
    }

    #[test]
    fn broker_status_mapping_covers_known_inputs() {
        assert_eq!(OrderStatus::from_broker("NEW"), Some(OrderStatus::Pending));
        assert_eq!(
            OrderStatus::from_broker("partial_fill"),
            Some(OrderStatus::PartialFill)
        );
        assert_eq!(OrderStatus::from_broker("FILLED"), Some(OrderStatus::Filled));
        assert_eq!(OrderStatus::from_broker("WEIRD"), None);
    }

    #[test]
    fn status_round_trips_through_storage_form() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Submitted,
            OrderStatus::PartialFill,
            OrderStatus::CancelReq,
            OrderStatus::Cancelled,
            OrderStatus::Rejected,
            OrderStatus::Expired,
            OrderStatus::Filled,
        ] {
            assert_eq!(OrderStatus::parse(status.as_str()), Some(status));
        }
    }
}
