//! TradingGate - the single permission check for all trading operations.
//!
//! Every order-placing call site must pass through this gate. It holds no
//! business logic and does no I/O: one O(1) matrix lookup over the current
//! (mode, stage) pair.
//!
//! Permission matrix:
//!
//! | Mode                   | open | send | amend | cancel          | reduce_only | query     |
//! |------------------------|------|------|-------|-----------------|-------------|-----------|
//! | NORMAL                 | Y    | Y    | Y     | Y               | Y           | Y         |
//! | DEGRADED               | Y*   | Y    | Y     | Y               | Y           | Y         |
//! | SAFE_MODE              | N    | N    | N     | Y (best-effort) | Y           | Y         |
//! | SAFE_MODE_DISCONNECTED | N    | N    | N     | N               | N           | Y (local) |
//! | HALT                   | N    | N    | N     | N               | N           | Y         |
//!
//! `*` open is allowed but restricted in DEGRADED.
//!
//! While RECOVERING, the stage sub-matrix supersedes the mode row:
//! CONNECT_BROKER/CATCHUP_MARKETDATA allow {query}; VERIFY_RISK adds
//! cancel; READY adds reduce_only.

use anyhow::{bail, Result};
use parking_lot::RwLock;
use serde::Serialize;

use crate::models::{ActionType, RecoveryStage, SystemMode};

/// Result of a permission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PermissionResult {
    pub allowed: bool,
    /// Allowed but restricted (position sizing etc. is up to the caller).
    pub restricted: bool,
    pub warning: Option<&'static str>,
    /// Result only valid against local caches; the control plane is out.
    pub local_only: bool,
}

impl PermissionResult {
    fn denied() -> Self {
        Self {
            allowed: false,
            restricted: false,
            warning: None,
            local_only: false,
        }
    }

    fn allowed() -> Self {
        Self {
            allowed: true,
            restricted: false,
            warning: None,
            local_only: false,
        }
    }
}

/// Structured refusal returned to order call sites when the gate denies a
/// request. Never a silent drop.
#[derive(Debug, Clone, Serialize)]
pub struct GateRefusal {
    pub mode: SystemMode,
    pub stage: Option<RecoveryStage>,
    pub denied_action: ActionType,
}

impl std::fmt::Display for GateRefusal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.stage {
            Some(stage) => write!(
                f,
                "action {} denied in mode {} (stage {})",
                self.denied_action.as_str(),
                self.mode.as_str(),
                stage.as_str()
            ),
            None => write!(
                f,
                "action {} denied in mode {}",
                self.denied_action.as_str(),
                self.mode.as_str()
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct GateState {
    mode: SystemMode,
    stage: Option<RecoveryStage>,
}

/// Unified gate for all trading operations. Exclusive writer (the state
/// service), many concurrent readers.
pub struct TradingGate {
    state: RwLock<GateState>,
}

impl Default for TradingGate {
    fn default() -> Self {
        Self::new()
    }
}

impl TradingGate {
    /// Cold start: RECOVERING / CONNECT_BROKER. Nothing but QUERY passes
    /// until the orchestrator walks the stages.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GateState {
                mode: SystemMode::Recovering,
                stage: Some(RecoveryStage::ConnectBroker),
            }),
        }
    }

    pub fn mode(&self) -> SystemMode {
        self.state.read().mode
    }

    pub fn stage(&self) -> Option<RecoveryStage> {
        self.state.read().stage
    }

    /// Update the gate. `stage` must be present iff `mode` is RECOVERING;
    /// anything else is operator misuse and leaves the gate unchanged.
    pub fn update_mode(&self, mode: SystemMode, stage: Option<RecoveryStage>) -> Result<()> {
        if mode == SystemMode::Recovering && stage.is_none() {
            bail!("recovery stage required when entering RECOVERING");
        }
        if mode != SystemMode::Recovering && stage.is_some() {
            bail!("recovery stage only valid in RECOVERING mode");
        }

        let mut state = self.state.write();
        state.mode = mode;
        state.stage = stage;
        Ok(())
    }

    /// Fast path: is the action allowed right now?
    pub fn allows(&self, action: ActionType) -> bool {
        self.check_permission(action).allowed
    }

    /// Full permission check with restriction/warning/local-only flags.
    pub fn check_permission(&self, action: ActionType) -> PermissionResult {
        let state = *self.state.read();

        if state.mode == SystemMode::Recovering {
            let Some(stage) = state.stage else {
                // Unreachable via update_mode; deny defensively.
                return PermissionResult::denied();
            };
            return if stage_allows(stage, action) {
                PermissionResult::allowed()
            } else {
                PermissionResult::denied()
            };
        }

        mode_permission(state.mode, action)
    }

    /// Check a whole order request. Returns the first denied action as a
    /// structured refusal carrying the current mode/stage.
    pub fn check_order_request(&self, actions: &[ActionType]) -> Result<(), GateRefusal> {
        let state = *self.state.read();
        for &action in actions {
            let allowed = if state.mode == SystemMode::Recovering {
                state.stage.is_some_and(|stage| stage_allows(stage, action))
            } else {
                mode_permission(state.mode, action).allowed
            };
            if !allowed {
                return Err(GateRefusal {
                    mode: state.mode,
                    stage: state.stage,
                    denied_action: action,
                });
            }
        }
        Ok(())
    }
}

fn stage_allows(stage: RecoveryStage, action: ActionType) -> bool {
    match stage {
        RecoveryStage::ConnectBroker | RecoveryStage::CatchupMarketdata => {
            matches!(action, ActionType::Query)
        }
        RecoveryStage::VerifyRisk => matches!(action, ActionType::Query | ActionType::Cancel),
        RecoveryStage::Ready => matches!(
            action,
            ActionType::Query | ActionType::Cancel | ActionType::ReduceOnly
        ),
    }
}

fn mode_permission(mode: SystemMode, action: ActionType) -> PermissionResult {
    match (mode, action) {
        (SystemMode::Normal, _) => PermissionResult::allowed(),

        (SystemMode::Degraded, ActionType::Open) => PermissionResult {
            allowed: true,
            restricted: true,
            warning: None,
            local_only: false,
        },
        (SystemMode::Degraded, _) => PermissionResult::allowed(),

        (SystemMode::SafeMode, ActionType::Cancel) => PermissionResult {
            allowed: true,
            restricted: false,
            warning: Some("Cancel is best-effort; broker connection may be unstable"),
            local_only: false,
        },
        (SystemMode::SafeMode, ActionType::ReduceOnly | ActionType::Query) => {
            PermissionResult::allowed()
        }
        (SystemMode::SafeMode, _) => PermissionResult::denied(),

        (SystemMode::SafeModeDisconnected, ActionType::Query) => PermissionResult {
            allowed: true,
            restricted: false,
            warning: None,
            local_only: true,
        },
        (SystemMode::SafeModeDisconnected, _) => PermissionResult::denied(),

        (SystemMode::Halt, ActionType::Query) => PermissionResult::allowed(),
        (SystemMode::Halt, _) => PermissionResult::denied(),

        // RECOVERING is handled by the stage sub-matrix before we get here.
        (SystemMode::Recovering, _) => PermissionResult::denied(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_ACTIONS: [ActionType; 6] = [
        ActionType::Open,
        ActionType::Send,
        ActionType::Amend,
        ActionType::Cancel,
        ActionType::ReduceOnly,
        ActionType::Query,
    ];

    #[test]
    fn cold_start_allows_only_query() {
        let gate = TradingGate::new();
        assert_eq!(gate.mode(), SystemMode::Recovering);
        assert_eq!(gate.stage(), Some(RecoveryStage::ConnectBroker));

        for action in ALL_ACTIONS {
            assert_eq!(gate.allows(action), action == ActionType::Query);
        }
    }

    #[test]
    fn normal_allows_everything() {
        let gate = TradingGate::new();
        gate.update_mode(SystemMode::Normal, None).unwrap();
        for action in ALL_ACTIONS {
            let result = gate.check_permission(action);
            assert!(result.allowed);
            assert!(!result.restricted);
            assert!(result.warning.is_none());
        }
    }

    #[test]
    fn degraded_restricts_open_only() {
        let gate = TradingGate::new();
        gate.update_mode(SystemMode::Degraded, None).unwrap();

        let open = gate.check_permission(ActionType::Open);
        assert!(open.allowed && open.restricted);

        for action in [ActionType::Send, ActionType::Amend, ActionType::Cancel] {
            let result = gate.check_permission(action);
            assert!(result.allowed && !result.restricted);
        }
    }

    #[test]
    fn safe_mode_cancel_carries_best_effort_warning() {
        let gate = TradingGate::new();
        gate.update_mode(SystemMode::SafeMode, None).unwrap();

        assert!(!gate.allows(ActionType::Open));
        assert!(!gate.allows(ActionType::Send));
        assert!(!gate.allows(ActionType::Amend));
        assert!(gate.allows(ActionType::ReduceOnly));

        let cancel = gate.check_permission(ActionType::Cancel);
        assert!(cancel.allowed);
        assert!(cancel.warning.unwrap().contains("best-effort"));
    }

    #[test]
    fn disconnected_query_is_local_only() {
        let gate = TradingGate::new();
        gate.update_mode(SystemMode::SafeModeDisconnected, None)
            .unwrap();

        for action in ALL_ACTIONS {
            let result = gate.check_permission(action);
            if action == ActionType::Query {
                assert!(result.allowed && result.local_only);
            } else {
                assert!(!result.allowed);
            }
        }
    }

    #[test]
    fn halt_allows_query_without_local_flag() {
        let gate = TradingGate::new();
        gate.update_mode(SystemMode::Halt, None).unwrap();
        let query = gate.check_permission(ActionType::Query);
        assert!(query.allowed && !query.local_only);
        assert!(!gate.allows(ActionType::Cancel));
    }

    #[test]
    fn recovery_stages_widen_in_order() {
        let gate = TradingGate::new();

        let expectations = [
            (RecoveryStage::ConnectBroker, vec![ActionType::Query]),
            (RecoveryStage::CatchupMarketdata, vec![ActionType::Query]),
            (
                RecoveryStage::VerifyRisk,
                vec![ActionType::Query, ActionType::Cancel],
            ),
            (
                RecoveryStage::Ready,
                vec![ActionType::Query, ActionType::Cancel, ActionType::ReduceOnly],
            ),
        ];

        for (stage, allowed) in expectations {
            gate.update_mode(SystemMode::Recovering, Some(stage)).unwrap();
            for action in ALL_ACTIONS {
                assert_eq!(
                    gate.allows(action),
                    allowed.contains(&action),
                    "stage {:?} action {:?}",
                    stage,
                    action
                );
            }
        }
    }

    #[test]
    fn update_mode_validates_stage_presence() {
        let gate = TradingGate::new();

        assert!(gate.update_mode(SystemMode::Recovering, None).is_err());
        assert!(gate
            .update_mode(SystemMode::Normal, Some(RecoveryStage::Ready))
            .is_err());
        // Invalid updates leave the gate untouched.
        assert_eq!(gate.mode(), SystemMode::Recovering);
        assert_eq!(gate.stage(), Some(RecoveryStage::ConnectBroker));
    }

    #[test]
    fn order_refusal_names_first_denied_action() {
        let gate = TradingGate::new();
        gate.update_mode(SystemMode::SafeMode, None).unwrap();

        let refusal = gate
            .check_order_request(&[ActionType::Query, ActionType::Open, ActionType::Send])
            .unwrap_err();
        assert_eq!(refusal.denied_action, ActionType::Open);
        assert_eq!(refusal.mode, SystemMode::SafeMode);
        assert!(refusal.to_string().contains("open"));

        assert!(gate
            .check_order_request(&[ActionType::Cancel, ActionType::Query])
            .is_ok());
    }
}
