use std::io;
use thiserror::Error;

use crate::ha::ManagementNodeState;
use crate::persistence::StoreError;

#[derive(Debug, Error, Clone)]
pub enum FleetError {
    /// The shared store could not be reached; transient and retried
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Another node won a promotion race
    #[error("Master claim lost to node {winner} (token {token})")]
    StaleClaimLost { winner: String, token: u64 },

    #[error("Dangling reference: {0}")]
    DanglingReference(String),

    /// An explicit HA mode was requested but its precondition does not hold
    #[error("Ambiguous mode request: {0}")]
    AmbiguousModeRequest(String),

    #[error("Corrupt memento {key}: {reason}")]
    CorruptMemento { key: String, reason: String },

    #[error("Corrupt snapshot manifest: {0}")]
    CorruptManifest(String),

    #[error("Illegal node state transition {from} -> {to}")]
    IllegalTransition {
        from: ManagementNodeState,
        to: ManagementNodeState,
    },

    /// A call issued by a node that no longer holds the highest fencing token
    #[error("Fenced: held token {held}, observed token {observed}")]
    Fenced { held: u64, observed: u64 },

    #[error("Resume of entity {0} abandoned")]
    ResumeAbandoned(String),

    #[error("Rebind failed: {0}")]
    RebindFailed(String),

    #[error("Transformer {name} rejected: {reason}")]
    TransformerRejected { name: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),

    #[error("YAML error: {0}")]
    Yaml(String),

    #[error("Control error: {0}")]
    Control(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, FleetError>;

impl FleetError {
    pub fn config(msg: impl Into<String>) -> Self {
        FleetError::Config(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        FleetError::Internal(msg.into())
    }

    pub fn ambiguous(msg: impl Into<String>) -> Self {
        FleetError::AmbiguousModeRequest(msg.into())
    }

    /// Only store outages are worth retrying; everything else is a decision.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FleetError::StoreUnavailable(_))
    }
}

impl From<StoreError> for FleetError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => FleetError::StoreUnavailable(msg),
            StoreError::Serialization(msg) => FleetError::Json(msg),
        }
    }
}

impl From<io::Error> for FleetError {
    fn from(e: io::Error) -> Self {
        FleetError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for FleetError {
    fn from(e: serde_json::Error) -> Self {
        FleetError::Json(e.to_string())
    }
}

impl From<serde_yaml::Error> for FleetError {
    fn from(e: serde_yaml::Error) -> Self {
        FleetError::Yaml(e.to_string())
    }
}

impl From<ctrlc::Error> for FleetError {
    fn from(e: ctrlc::Error) -> Self {
        FleetError::Control(e.to_string())
    }
}
