pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod ha;
pub mod logging;
pub mod memento;
pub mod persistence;
pub mod rebind;

// Re-export common types
pub use config::Config;
pub use controller::{EntityController, LoggingController};
pub use error::{FleetError, Result};
pub use ha::{HaManager, HighAvailabilityMode, ManagementNodeState, PromotionOutcome};
pub use memento::FleetSnapshot;
pub use persistence::{InMemoryStore, ObjectStore};
pub use rebind::{LiveGraph, RebindEngine};
