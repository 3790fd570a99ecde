//! Audit side of the engine: decision traces, context snapshots and the
//! correlation of traces with ambient context events.

pub mod correlation;
pub mod decision;
pub mod graph;
pub mod memory;
pub mod postgres;
pub mod snapshot;
pub mod store;

pub use correlation::{CorrelationEngine, CorrelationStats};
pub use decision::{DecisionRecord, DecisionTraceService};
pub use graph::{GraphClient, Neo4jGraph};
pub use memory::MemoryStore;
pub use postgres::PgStore;
pub use snapshot::{ContextSnapshotService, DEFAULT_DEPTH};
pub use store::{ContextStore, EntityStore, GraphStore, Subgraph, TraceFilter, TraceStore};
