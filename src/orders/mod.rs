//! Order lifecycle and close flow: records, persistence, broker update
//! handling, the transactional outbox worker and the reconciler jobs.

pub mod handler;
pub mod models;
pub mod outbox;
pub mod reconciler;
pub mod store;

pub use handler::OrderUpdateHandler;
pub use models::{
    BrokerOrderUpdate, CloseOrderPayload, CloseRequest, CloseRequestStatus, OrderRecord,
    OrderStatus, OutboxEvent, OutboxStatus, Position, PositionStatus, SUBMIT_CLOSE_ORDER,
};
pub use outbox::{OrderSubmitter, OutboxWorker, SubmitAck};
pub use reconciler::{BrokerApi, Reconciler};
pub use store::OrderStore;
