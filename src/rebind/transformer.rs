//! Memento transformers applied to every snapshot before rebind.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::{FleetError, Result};
use crate::memento::FleetSnapshot;

use super::orphans::DeleteOrphanedLocations;

/// A pure snapshot rewrite. Implementations must be idempotent.
pub trait MementoTransformer: Send + Sync {
    fn name(&self) -> &'static str;

    fn transform(&self, snapshot: FleetSnapshot) -> Result<FleetSnapshot>;
}

/// Transformers selectable from configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformerKind {
    DeleteOrphanedLocations,
}

impl TransformerKind {
    pub fn build(&self) -> Arc<dyn MementoTransformer> {
        match self {
            TransformerKind::DeleteOrphanedLocations => Arc::new(DeleteOrphanedLocations),
        }
    }
}

/// Result of running the pipeline. On rejection `snapshot` is the input,
/// unchanged.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub snapshot: FleetSnapshot,
    pub rejected: Option<FleetError>,
}

/// Ordered transformers. Fails closed: if any step errors or leaves a
/// reference dangling that was not dangling in the input, the whole pipeline
/// yields the original snapshot.
#[derive(Clone, Default)]
pub struct TransformerPipeline {
    transformers: Vec<Arc<dyn MementoTransformer>>,
}

impl TransformerPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_kinds(kinds: &[TransformerKind]) -> Self {
        Self {
            transformers: kinds.iter().map(TransformerKind::build).collect(),
        }
    }

    pub fn with(mut self, transformer: Arc<dyn MementoTransformer>) -> Self {
        self.transformers.push(transformer);
        self
    }

    pub fn len(&self) -> usize {
        self.transformers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transformers.is_empty()
    }

    pub fn apply(&self, snapshot: FleetSnapshot) -> PipelineOutcome {
        if self.transformers.is_empty() {
            return PipelineOutcome {
                snapshot,
                rejected: None,
            };
        }

        let baseline: BTreeSet<_> = snapshot.dangling_references().into_iter().collect();
        let mut current = snapshot.clone();
        for transformer in &self.transformers {
            let step = transformer.transform(current).and_then(|next| {
                let introduced: Vec<_> = next
                    .dangling_references()
                    .into_iter()
                    .filter(|d| !baseline.contains(d))
                    .collect();
                if introduced.is_empty() {
                    Ok(next)
                } else {
                    Err(FleetError::TransformerRejected {
                        name: transformer.name().to_string(),
                        reason: format!(
                            "introduced {} dangling reference(s), first: {}",
                            introduced.len(),
                            introduced[0]
                        ),
                    })
                }
            });
            match step {
                Ok(next) => {
                    debug!(transformer = transformer.name(), "Applied memento transformer");
                    current = next;
                }
                Err(e) => {
                    warn!(transformer = transformer.name(), error = %e, "Transformer failed, using original snapshot");
                    return PipelineOutcome {
                        snapshot,
                        rejected: Some(e),
                    };
                }
            }
        }
        PipelineOutcome {
            snapshot: current,
            rejected: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memento::{EntityMemento, LocationMemento};

    struct DropAllLocations;

    impl MementoTransformer for DropAllLocations {
        fn name(&self) -> &'static str {
            "drop_all_locations"
        }

        fn transform(&self, mut snapshot: FleetSnapshot) -> Result<FleetSnapshot> {
            snapshot.locations.clear();
            Ok(snapshot)
        }
    }

    struct Broken;

    impl MementoTransformer for Broken {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn transform(&self, _snapshot: FleetSnapshot) -> Result<FleetSnapshot> {
            Err(FleetError::internal("boom"))
        }
    }

    fn snapshot() -> FleetSnapshot {
        FleetSnapshot::new()
            .with_entity(EntityMemento::new("e1", "app").with_location("l1"))
            .with_location(LocationMemento::new("l1", "cloud"))
            .with_location(LocationMemento::new("stale", "cloud"))
    }

    #[test]
    fn configured_transformer_prunes() {
        let pipeline = TransformerPipeline::from_kinds(&[TransformerKind::DeleteOrphanedLocations]);
        let outcome = pipeline.apply(snapshot());
        assert!(outcome.rejected.is_none());
        assert!(!outcome.snapshot.locations.contains_key("stale"));
    }

    #[test]
    fn new_dangling_reference_fails_closed() {
        let pipeline = TransformerPipeline::new()
            .with(Arc::new(DeleteOrphanedLocations))
            .with(Arc::new(DropAllLocations));
        let outcome = pipeline.apply(snapshot());
        assert!(matches!(
            outcome.rejected,
            Some(FleetError::TransformerRejected { .. })
        ));
        assert_eq!(outcome.snapshot, snapshot());
    }

    #[test]
    fn transformer_error_fails_closed() {
        let pipeline = TransformerPipeline::new().with(Arc::new(Broken));
        let outcome = pipeline.apply(snapshot());
        assert!(outcome.rejected.is_some());
        assert_eq!(outcome.snapshot, snapshot());
    }

    #[test]
    fn preexisting_dangling_references_are_tolerated() {
        let input = snapshot().with_entity(EntityMemento::new("e2", "app").with_location("gone"));
        let outcome = TransformerPipeline::from_kinds(&[TransformerKind::DeleteOrphanedLocations])
            .apply(input);
        assert!(outcome.rejected.is_none());
    }
}
