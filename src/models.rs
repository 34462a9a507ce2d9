//! Core models for the trading resilience layer.
//!
//! Defines the mode machine vocabulary shared by every component: system
//! modes, component health levels, recovery stages, event/reason enums and
//! the records that flow between them.
//!
//! Key constraints:
//! - SystemMode has 6 modes with strict priority ordering
//! - MUST_DELIVER_EVENTS is a frozen whitelist of critical reason codes
//! - SystemEvent carries dual timestamps: wall clock (display/audit) and
//!   monotonic (all TTL/staleness/scheduling logic)

use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// System operating modes, ordered by severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemMode {
    /// Full functionality.
    Normal,
    /// Recovery orchestration in progress.
    Recovering,
    /// Limited operation.
    Degraded,
    /// Protect capital; control plane still reachable.
    SafeMode,
    /// Protect capital; control plane unreachable.
    SafeModeDisconnected,
    /// Requires human intervention.
    Halt,
}

impl SystemMode {
    /// Strict priority ordering (higher = more severe). Used only for
    /// "take the more severe" conflict resolution.
    pub fn priority(&self) -> u8 {
        match self {
            SystemMode::Normal => 0,
            SystemMode::Recovering => 1,
            SystemMode::Degraded => 2,
            SystemMode::SafeMode => 3,
            SystemMode::SafeModeDisconnected => 4,
            SystemMode::Halt => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemMode::Normal => "normal",
            SystemMode::Recovering => "recovering",
            SystemMode::Degraded => "degraded",
            SystemMode::SafeMode => "safe_mode",
            SystemMode::SafeModeDisconnected => "safe_mode_disconnected",
            SystemMode::Halt => "halt",
        }
    }
}

/// Per-component health level used for hysteresis tracking.
///
/// UNSTABLE is a warning state that does not move the system mode by
/// itself; only TRIPPED components feed the mode merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemLevel {
    Healthy,
    Unstable,
    Tripped,
}

impl SystemLevel {
    /// Restriction priority for "local can only tighten" merging.
    pub fn priority(&self) -> u8 {
        match self {
            SystemLevel::Healthy => 0,
            SystemLevel::Unstable => 1,
            SystemLevel::Tripped => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemLevel::Healthy => "healthy",
            SystemLevel::Unstable => "unstable",
            SystemLevel::Tripped => "tripped",
        }
    }
}

/// Recovery orchestration stages, in progression order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStage {
    ConnectBroker,
    CatchupMarketdata,
    VerifyRisk,
    Ready,
}

/// Stage progression order.
pub const STAGE_ORDER: [RecoveryStage; 4] = [
    RecoveryStage::ConnectBroker,
    RecoveryStage::CatchupMarketdata,
    RecoveryStage::VerifyRisk,
    RecoveryStage::Ready,
];

impl RecoveryStage {
    /// Next stage in the progression, or None when already READY.
    pub fn next(&self) -> Option<RecoveryStage> {
        match self {
            RecoveryStage::ConnectBroker => Some(RecoveryStage::CatchupMarketdata),
            RecoveryStage::CatchupMarketdata => Some(RecoveryStage::VerifyRisk),
            RecoveryStage::VerifyRisk => Some(RecoveryStage::Ready),
            RecoveryStage::Ready => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryStage::ConnectBroker => "connect_broker",
            RecoveryStage::CatchupMarketdata => "catchup_marketdata",
            RecoveryStage::VerifyRisk => "verify_risk",
            RecoveryStage::Ready => "ready",
        }
    }
}

/// How a recovery run was triggered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryTrigger {
    Auto,
    Manual,
    ColdStart,
}

impl RecoveryTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecoveryTrigger::Auto => "auto",
            RecoveryTrigger::Manual => "manual",
            RecoveryTrigger::ColdStart => "cold_start",
        }
    }
}

/// Types of system events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    /// Critical failure requiring immediate action.
    FailCrit,
    /// Supplementary / non-critical failure.
    FailSupp,
    /// Component has recovered.
    Recovered,
    /// Periodic health check.
    Heartbeat,
    /// Quality degraded but not failed.
    QualityDegraded,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::FailCrit => "fail_crit",
            EventType::FailSupp => "fail_supp",
            EventType::Recovered => "recovered",
            EventType::Heartbeat => "heartbeat",
            EventType::QualityDegraded => "quality_degraded",
        }
    }
}

/// Components with an explicit degradation design.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentSource {
    Broker,
    MarketData,
    Risk,
    Db,
    Alerts,
    System,
}

impl ComponentSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentSource::Broker => "broker",
            ComponentSource::MarketData => "market_data",
            ComponentSource::Risk => "risk",
            ComponentSource::Db => "db",
            ComponentSource::Alerts => "alerts",
            ComponentSource::System => "system",
        }
    }
}

/// Event severity levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// Standardized reason codes. Closed enumeration: each code maps to a
/// specific target mode in the state service decision matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    // Broker
    BrokerDisconnect,
    BrokerReconnected,
    BrokerReportMismatch,
    // Market data
    MdStale,
    MdQualityDegraded,
    // Risk
    RiskTimeout,
    RiskBreachHard,
    // Position
    PositionTruthUnknown,
    // Database
    DbWriteFail,
    DbBufferOverflow,
    // Alerts
    AlertsChannelDown,
    // Operator
    OperatorOverride,
    // Recovery
    ColdStart,
    RecoveryFailed,
    AllHealthy,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::BrokerDisconnect => "broker.disconnect",
            ReasonCode::BrokerReconnected => "broker.reconnected",
            ReasonCode::BrokerReportMismatch => "broker.report_mismatch",
            ReasonCode::MdStale => "market_data.stale",
            ReasonCode::MdQualityDegraded => "market_data.quality_degraded",
            ReasonCode::RiskTimeout => "risk.timeout",
            ReasonCode::RiskBreachHard => "risk.breach_hard",
            ReasonCode::PositionTruthUnknown => "position.unknown",
            ReasonCode::DbWriteFail => "db.write_fail",
            ReasonCode::DbBufferOverflow => "db.buffer_overflow",
            ReasonCode::AlertsChannelDown => "alerts.channel_down",
            ReasonCode::OperatorOverride => "operator.override",
            ReasonCode::ColdStart => "cold_start",
            ReasonCode::RecoveryFailed => "recovery.failed",
            ReasonCode::AllHealthy => "all.healthy",
        }
    }
}

/// Trading actions controlled by the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Open,
    Send,
    Amend,
    Cancel,
    ReduceOnly,
    Query,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Open => "open",
            ActionType::Send => "send",
            ActionType::Amend => "amend",
            ActionType::Cancel => "cancel",
            ActionType::ReduceOnly => "reduce_only",
            ActionType::Query => "query",
        }
    }
}

/// Critical reason codes that MUST be delivered even when the event bus is
/// full. Only these trigger local emergency degradation on a dropped
/// publish. Adding a code here requires code review.
pub const MUST_DELIVER_EVENTS: [ReasonCode; 4] = [
    ReasonCode::BrokerDisconnect,
    ReasonCode::PositionTruthUnknown,
    ReasonCode::BrokerReportMismatch,
    ReasonCode::RiskBreachHard,
];

/// A system event emitted by a component.
///
/// Dual timestamps: `event_time_wall` is for display/audit only and may
/// jump with the system clock; `event_time_mono` drives every TTL,
/// staleness and scheduling decision.
#[derive(Debug, Clone)]
pub struct SystemEvent {
    pub event_type: EventType,
    pub source: ComponentSource,
    pub severity: Severity,
    pub reason_code: ReasonCode,
    pub event_time_wall: DateTime<Utc>,
    pub event_time_mono: Instant,
    pub details: Option<serde_json::Value>,
    pub ttl_seconds: Option<u64>,
}

impl SystemEvent {
    /// Create an event stamped with the current wall and monotonic clocks.
    pub fn new(
        event_type: EventType,
        source: ComponentSource,
        severity: Severity,
        reason_code: ReasonCode,
        details: Option<serde_json::Value>,
        ttl_seconds: Option<u64>,
    ) -> Self {
        Self {
            event_type,
            source,
            severity,
            reason_code,
            event_time_wall: Utc::now(),
            event_time_mono: Instant::now(),
            details,
            ttl_seconds,
        }
    }

    /// Whether this event is on the MUST_DELIVER whitelist. Alert/audit/
    /// metric events never are, so they can never trigger local emergency
    /// degradation on bus overflow.
    pub fn is_critical(&self) -> bool {
        MUST_DELIVER_EVENTS.contains(&self.reason_code)
    }

    /// TTL check on the monotonic clock. Events without a TTL never expire.
    pub fn is_expired(&self) -> bool {
        match self.ttl_seconds {
            Some(ttl) => self.event_time_mono.elapsed().as_secs_f64() > ttl as f64,
            None => false,
        }
    }

    /// JSON form for audit surfaces. The monotonic timestamp is reported as
    /// elapsed seconds since the event, which is the only portable reading.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "event_type": self.event_type.as_str(),
            "source": self.source.as_str(),
            "severity": self.severity.as_str(),
            "reason_code": self.reason_code.as_str(),
            "event_time_wall": self.event_time_wall.to_rfc3339(),
            "age_seconds": self.event_time_mono.elapsed().as_secs_f64(),
            "details": self.details,
            "ttl_seconds": self.ttl_seconds,
        })
    }
}

/// Record of a single mode transition. The state service keeps these as an
/// append-only history.
#[derive(Debug, Clone)]
pub struct ModeTransition {
    pub from_mode: SystemMode,
    pub to_mode: SystemMode,
    pub reason_code: ReasonCode,
    pub source: ComponentSource,
    pub timestamp_wall: DateTime<Utc>,
    pub timestamp_mono: Instant,
    pub operator_id: Option<String>,
    pub override_ttl: Option<u64>,
}

/// Health bookkeeping for a single component inside the state service.
/// Mutated only via `SystemStateService::handle_event`.
#[derive(Debug, Clone)]
pub struct ComponentStatus {
    pub source: ComponentSource,
    pub level: SystemLevel,
    pub last_event: Option<SystemEvent>,
    pub last_update_mono: Instant,
    pub consecutive_failures: u32,
    pub unstable_since_mono: Option<Instant>,
}

impl ComponentStatus {
    pub fn new(source: ComponentSource) -> Self {
        Self {
            source,
            level: SystemLevel::Healthy,
            last_event: None,
            last_update_mono: Instant::now(),
            consecutive_failures: 0,
            unstable_since_mono: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_priority_is_strictly_ordered() {
        let ordered = [
            SystemMode::Normal,
            SystemMode::Recovering,
            SystemMode::Degraded,
            SystemMode::SafeMode,
            SystemMode::SafeModeDisconnected,
            SystemMode::Halt,
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0].priority() < pair[1].priority());
        }
    }

    #[test]
    fn must_deliver_whitelist_is_exact() {
        assert!(MUST_DELIVER_EVENTS.contains(&ReasonCode::BrokerDisconnect));
        assert!(MUST_DELIVER_EVENTS.contains(&ReasonCode::PositionTruthUnknown));
        assert!(MUST_DELIVER_EVENTS.contains(&ReasonCode::BrokerReportMismatch));
        assert!(MUST_DELIVER_EVENTS.contains(&ReasonCode::RiskBreachHard));
        assert_eq!(MUST_DELIVER_EVENTS.len(), 4);

        let alert = SystemEvent::new(
            EventType::FailSupp,
            ComponentSource::Alerts,
            Severity::Warning,
            ReasonCode::AlertsChannelDown,
            None,
            None,
        );
        assert!(!alert.is_critical());
    }

    #[test]
    fn event_ttl_uses_monotonic_clock() {
        let mut event = SystemEvent::new(
            EventType::Heartbeat,
            ComponentSource::System,
            Severity::Info,
            ReasonCode::AllHealthy,
            None,
            Some(3600),
        );
        assert!(!event.is_expired());

        event.ttl_seconds = None;
        assert!(!event.is_expired());
    }

    #[test]
    fn stage_progression_terminates_at_ready() {
        let mut stage = RecoveryStage::ConnectBroker;
        let mut hops = 0;
        while let Some(next) = stage.next() {
            stage = next;
            hops += 1;
        }
        assert_eq!(stage, RecoveryStage::Ready);
        assert_eq!(hops, 3);
    }
}
