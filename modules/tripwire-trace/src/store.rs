//! Storage seams for traces, snapshots, entity state, the graph and context events.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use tripwire_common::error::Result;
use tripwire_common::{
    ContextEvent, ContextLink, ContextSnapshot, DecisionTrace, EntityState, GraphNode,
    GraphRelationship, TraceStatus,
};

/// Optional narrowing for trace listings. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TraceFilter {
    pub status: Option<TraceStatus>,
    pub user_id: Option<Uuid>,
    pub rule_id: Option<Uuid>,
    pub limit: Option<i64>,
}

impl TraceFilter {
    pub fn matches(&self, trace: &DecisionTrace) -> bool {
        self.status.map_or(true, |s| s == trace.status)
            && self.user_id.map_or(true, |u| trace.user_id == Some(u))
            && self.rule_id.map_or(true, |r| trace.rule_id == Some(r))
    }
}

/// Flattened graph neighborhood: relationships reference nodes by id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subgraph {
    pub nodes: Vec<GraphNode>,
    pub relationships: Vec<GraphRelationship>,
}

/// Decision traces and the snapshots they point at. Append-only.
#[async_trait]
pub trait TraceStore: Send + Sync {
    async fn insert_snapshot(&self, snapshot: &ContextSnapshot) -> Result<()>;

    async fn get_snapshot(&self, id: Uuid) -> Result<Option<ContextSnapshot>>;

    async fn insert_trace(&self, trace: &DecisionTrace) -> Result<()>;

    async fn get_trace(&self, id: Uuid) -> Result<Option<DecisionTrace>>;

    /// Traces at or after `since`, oldest first.
    async fn traces_since(
        &self,
        since: DateTime<Utc>,
        filter: &TraceFilter,
    ) -> Result<Vec<DecisionTrace>>;
}

/// Current state of business entities, keyed by entity id. Unknown ids are
/// omitted from the result.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn entity_states(&self, ids: &[String]) -> Result<BTreeMap<String, EntityState>>;
}

#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Nodes within `depth` hops of any of `ids` (including the start nodes)
    /// and the relationships along those paths.
    async fn neighborhood(&self, ids: &[String], depth: u32) -> Result<Subgraph>;
}

/// Ambient context events and their links to traces.
#[async_trait]
pub trait ContextStore: Send + Sync {
    async fn insert_context_event(&self, event: &ContextEvent) -> Result<()>;

    /// Events with `start <= timestamp <= end`, restricted to `user_id` when given.
    async fn context_events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        user_id: Option<Uuid>,
    ) -> Result<Vec<ContextEvent>>;

    async fn link_exists(&self, trace_id: Uuid, context_event_id: Uuid) -> Result<bool>;

    /// Returns false when a link for the same pair already existed.
    async fn insert_link(&self, link: &ContextLink) -> Result<bool>;

    async fn links_for_trace(&self, trace_id: Uuid) -> Result<Vec<ContextLink>>;
}
