//! Sentinel Backend Library
//!
//! Trading resilience core: mode machine, event bus, circuit breakers,
//! trading gate, staged recovery and the durable order close flow.
//! Exposed for binaries and integration tests.

pub mod breakers;
pub mod bus;
pub mod config;
pub mod db_buffer;
pub mod gate;
pub mod models;
pub mod orders;
pub mod probes;
pub mod recovery;
pub mod setup;
pub mod state;

pub use bus::EventBus;
pub use config::ResilienceConfig;
pub use gate::TradingGate;
pub use recovery::RecoveryOrchestrator;
pub use state::SystemStateService;
