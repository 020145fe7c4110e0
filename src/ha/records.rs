//! Records persisted by the coordinator.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::state::{HighAvailabilityMode, ManagementNodeState};

/// Published by each node for itself only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub state: ManagementNodeState,
    /// Highest fencing token the node has observed
    pub priority_token: u64,
}

impl HeartbeatRecord {
    pub fn is_fresh(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        within(self.timestamp, now, timeout)
    }
}

/// The singleton mastership slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterClaimRecord {
    pub node_id: String,
    pub token: u64,
    pub timestamp: DateTime<Utc>,
}

impl MasterClaimRecord {
    pub fn new(node_id: impl Into<String>, token: u64, timestamp: DateTime<Utc>) -> Self {
        Self {
            node_id: node_id.into(),
            token,
            timestamp,
        }
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, timeout: Duration) -> bool {
        within(self.timestamp, now, timeout)
    }

    /// The same claim, aged so every reader treats it as stale.
    pub fn relinquished(&self) -> Self {
        Self {
            node_id: self.node_id.clone(),
            token: self.token,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
        }
    }
}

/// A claim read from the store with the version needed to replace it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedClaim {
    pub claim: Option<MasterClaimRecord>,
    pub version: Option<u64>,
}

impl ObservedClaim {
    pub fn token(&self) -> u64 {
        self.claim.as_ref().map(|c| c.token).unwrap_or(0)
    }

    pub fn owner(&self) -> Option<&str> {
        self.claim.as_ref().map(|c| c.node_id.as_str())
    }
}

/// Public view of this node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ManagementNode {
    pub node_id: String,
    pub state: ManagementNodeState,
    pub mode: HighAvailabilityMode,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub priority_token: u64,
}

fn within(timestamp: DateTime<Utc>, now: DateTime<Utc>, timeout: Duration) -> bool {
    let timeout = ChronoDuration::from_std(timeout).unwrap_or(ChronoDuration::MAX);
    now.signed_duration_since(timestamp) <= timeout
}
