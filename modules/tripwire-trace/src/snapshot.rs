use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use tripwire_common::error::Result;
use tripwire_common::{ContextSnapshot, GraphNeighborhood};

use crate::store::{EntityStore, GraphStore, TraceStore};

/// Hops captured around each entity unless the caller asks otherwise.
pub const DEFAULT_DEPTH: u32 = 1;

/// Captures the state of the involved entities and their graph neighborhood
/// at decision time.
#[derive(Clone)]
pub struct ContextSnapshotService {
    entities: Arc<dyn EntityStore>,
    graph: Arc<dyn GraphStore>,
    snapshots: Arc<dyn TraceStore>,
}

impl ContextSnapshotService {
    pub fn new(
        entities: Arc<dyn EntityStore>,
        graph: Arc<dyn GraphStore>,
        snapshots: Arc<dyn TraceStore>,
    ) -> Self {
        Self {
            entities,
            graph,
            snapshots,
        }
    }

    /// Entity-store and persistence failures propagate. A graph failure is
    /// recorded in the snapshot as `{error}` instead.
    pub async fn capture_snapshot(&self, entity_ids: &[String], depth: u32) -> Result<Uuid> {
        let entity_states = self.entities.entity_states(entity_ids).await?;

        let graph_neighborhood = if entity_ids.is_empty() {
            GraphNeighborhood::empty()
        } else {
            match self.graph.neighborhood(entity_ids, depth).await {
                Ok(subgraph) => GraphNeighborhood::Graph {
                    nodes: subgraph.nodes,
                    relationships: subgraph.relationships,
                },
                Err(e) => {
                    warn!(error = %e, "Error fetching graph context");
                    GraphNeighborhood::Error {
                        error: e.to_string(),
                    }
                }
            }
        };

        let snapshot = ContextSnapshot {
            id: Uuid::new_v4(),
            entity_states,
            graph_neighborhood,
            timestamp: Utc::now(),
        };
        self.snapshots.insert_snapshot(&snapshot).await?;

        info!(snapshot_id = %snapshot.id, entities = entity_ids.len(), "Captured context snapshot");
        Ok(snapshot.id)
    }
}
