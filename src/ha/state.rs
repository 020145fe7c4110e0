//! Management node lifecycle states and HA modes.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{FleetError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagementNodeState {
    Initializing,
    Standby,
    HotStandby,
    HotBackup,
    Master,
    Failed,
    Terminated,
}

impl fmt::Display for ManagementNodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ManagementNodeState::Initializing => "INITIALIZING",
            ManagementNodeState::Standby => "STANDBY",
            ManagementNodeState::HotStandby => "HOT_STANDBY",
            ManagementNodeState::HotBackup => "HOT_BACKUP",
            ManagementNodeState::Master => "MASTER",
            ManagementNodeState::Failed => "FAILED",
            ManagementNodeState::Terminated => "TERMINATED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HighAvailabilityMode {
    Disabled,
    #[default]
    Auto,
    Standby,
    HotStandby,
    HotBackup,
    Master,
}

impl fmt::Display for HighAvailabilityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HighAvailabilityMode::Disabled => "DISABLED",
            HighAvailabilityMode::Auto => "AUTO",
            HighAvailabilityMode::Standby => "STANDBY",
            HighAvailabilityMode::HotStandby => "HOT_STANDBY",
            HighAvailabilityMode::HotBackup => "HOT_BACKUP",
            HighAvailabilityMode::Master => "MASTER",
        };
        f.write_str(name)
    }
}

impl FromStr for HighAvailabilityMode {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().replace('-', "_").as_str() {
            "DISABLED" => Ok(HighAvailabilityMode::Disabled),
            "AUTO" => Ok(HighAvailabilityMode::Auto),
            "STANDBY" => Ok(HighAvailabilityMode::Standby),
            "HOT_STANDBY" => Ok(HighAvailabilityMode::HotStandby),
            "HOT_BACKUP" => Ok(HighAvailabilityMode::HotBackup),
            "MASTER" => Ok(HighAvailabilityMode::Master),
            other => Err(FleetError::config(format!("unknown HA mode: {}", other))),
        }
    }
}

/// The state a mode asks for, if any
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModeTarget {
    /// The mode names a concrete state
    State(ManagementNodeState),
    /// DISABLED and AUTO are resolved at runtime, not by a fixed state
    Resolved,
}

/// Maps an explicit mode onto the node state it requests.
pub fn to_node_state(mode: HighAvailabilityMode) -> ModeTarget {
    match mode {
        HighAvailabilityMode::Standby => ModeTarget::State(ManagementNodeState::Standby),
        HighAvailabilityMode::HotStandby => ModeTarget::State(ManagementNodeState::HotStandby),
        HighAvailabilityMode::HotBackup => ModeTarget::State(ManagementNodeState::HotBackup),
        HighAvailabilityMode::Master => ModeTarget::State(ManagementNodeState::Master),
        HighAvailabilityMode::Disabled | HighAvailabilityMode::Auto => ModeTarget::Resolved,
    }
}

/// States that keep a continuously refreshed mirror of the fleet
pub fn is_hot_proxy(state: ManagementNodeState) -> bool {
    matches!(
        state,
        ManagementNodeState::HotStandby | ManagementNodeState::HotBackup
    )
}

/// States eligible for promotion
pub fn is_standby(state: ManagementNodeState) -> bool {
    matches!(
        state,
        ManagementNodeState::Standby | ManagementNodeState::HotStandby
    )
}

fn is_backup_state(state: ManagementNodeState) -> bool {
    matches!(
        state,
        ManagementNodeState::Standby
            | ManagementNodeState::HotStandby
            | ManagementNodeState::HotBackup
    )
}

/// Whether `from -> to` is a legal transition. Staying put is always legal
/// except out of TERMINATED, which nothing leaves.
pub fn can_transition(from: ManagementNodeState, to: ManagementNodeState) -> bool {
    use ManagementNodeState::*;
    match (from, to) {
        (Terminated, _) => false,
        (a, b) if a == b => true,
        (Failed, Terminated) => true,
        (Failed, _) => false,
        (_, Failed) => true,
        (Initializing, b) => b != Terminated && b != Initializing,
        (a, Master) => is_standby(a),
        (Master, b) => is_backup_state(b),
        (a, b) => is_backup_state(a) && is_backup_state(b),
    }
}

/// Guards every state change a node makes.
#[derive(Debug, Clone)]
pub struct NodeStateMachine {
    state: ManagementNodeState,
}

impl Default for NodeStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeStateMachine {
    pub fn new() -> Self {
        Self {
            state: ManagementNodeState::Initializing,
        }
    }

    pub fn state(&self) -> ManagementNodeState {
        self.state
    }

    /// Moves to `to`, returning the previous state.
    pub fn transition(&mut self, to: ManagementNodeState) -> Result<ManagementNodeState> {
        if !can_transition(self.state, to) {
            return Err(FleetError::IllegalTransition {
                from: self.state,
                to,
            });
        }
        let previous = self.state;
        self.state = to;
        Ok(previous)
    }

    /// Unrecoverable error: any live state may fail.
    pub fn fail(&mut self) -> ManagementNodeState {
        let previous = self.state;
        if previous != ManagementNodeState::Terminated {
            self.state = ManagementNodeState::Failed;
        }
        previous
    }
}
