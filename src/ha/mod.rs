//! High availability: node states, mastership records and the coordinator.

mod clock;
mod coordinator;
mod fencing;
mod records;
mod retry;
mod state;

pub use clock::{Clock, MockClock, SystemClock};
pub use coordinator::{HaManager, PromotionOutcome, PromotionTrigger, ResumeResult};
pub use fencing::FencingGuard;
pub use records::{HeartbeatRecord, ManagementNode, MasterClaimRecord, ObservedClaim};
pub use retry::RetryPolicy;
pub use state::{
    can_transition, is_hot_proxy, is_standby, to_node_state, HighAvailabilityMode,
    ManagementNodeState, ModeTarget, NodeStateMachine,
};
