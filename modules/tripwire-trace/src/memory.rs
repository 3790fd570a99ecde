//! In-memory implementation of every trace-side store, with failure injection
//! for exercising degraded paths in tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use tripwire_common::error::Result;
use tripwire_common::{
    ContextEvent, ContextLink, ContextSnapshot, DecisionTrace, EntityState, GraphNode,
    GraphRelationship, TripwireError,
};

use crate::store::{ContextStore, EntityStore, GraphStore, Subgraph, TraceFilter, TraceStore};

#[derive(Default)]
struct State {
    traces: Vec<DecisionTrace>,
    snapshots: HashMap<Uuid, ContextSnapshot>,
    entities: HashMap<String, EntityState>,
    nodes: Vec<GraphNode>,
    relationships: Vec<GraphRelationship>,
    context_events: Vec<ContextEvent>,
    links: Vec<ContextLink>,
    failing_link_traces: HashSet<Uuid>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    graph_error: Mutex<Option<String>>,
    fail_trace_writes: AtomicBool,
    fail_entity_reads: AtomicBool,
}

/// Clones share state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- seeding ---

    pub fn put_entity(&self, id: impl Into<String>, state: EntityState) {
        self.state().entities.insert(id.into(), state);
    }

    pub fn add_node(&self, node: GraphNode) {
        self.state().nodes.push(node);
    }

    pub fn add_relationship(&self, relationship: GraphRelationship) {
        self.state().relationships.push(relationship);
    }

    // --- failure injection ---

    /// Make graph reads fail with `message` (or succeed again with `None`).
    pub fn fail_graph(&self, message: Option<&str>) {
        *self.inner.graph_error.lock().unwrap_or_else(|e| e.into_inner()) =
            message.map(str::to_string);
    }

    pub fn fail_trace_writes(&self, fail: bool) {
        self.inner.fail_trace_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_entity_reads(&self, fail: bool) {
        self.inner.fail_entity_reads.store(fail, Ordering::SeqCst);
    }

    /// Make link lookups and inserts for `trace_id` fail.
    pub fn fail_links_for(&self, trace_id: Uuid) {
        self.state().failing_link_traces.insert(trace_id);
    }

    // --- inspection ---

    pub fn traces(&self) -> Vec<DecisionTrace> {
        self.state().traces.clone()
    }

    pub fn snapshots(&self) -> Vec<ContextSnapshot> {
        self.state().snapshots.values().cloned().collect()
    }

    pub fn links(&self) -> Vec<ContextLink> {
        self.state().links.clone()
    }

    fn check_link_failure(&self, trace_id: Uuid) -> Result<()> {
        if self.state().failing_link_traces.contains(&trace_id) {
            return Err(TripwireError::Storage(format!(
                "injected link failure for trace {trace_id}"
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl TraceStore for MemoryStore {
    async fn insert_snapshot(&self, snapshot: &ContextSnapshot) -> Result<()> {
        self.state().snapshots.insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    async fn get_snapshot(&self, id: Uuid) -> Result<Option<ContextSnapshot>> {
        Ok(self.state().snapshots.get(&id).cloned())
    }

    async fn insert_trace(&self, trace: &DecisionTrace) -> Result<()> {
        if self.inner.fail_trace_writes.load(Ordering::SeqCst) {
            return Err(TripwireError::Storage("injected trace write failure".into()));
        }
        self.state().traces.push(trace.clone());
        Ok(())
    }

    async fn get_trace(&self, id: Uuid) -> Result<Option<DecisionTrace>> {
        Ok(self.state().traces.iter().find(|t| t.id == id).cloned())
    }

    async fn traces_since(
        &self,
        since: DateTime<Utc>,
        filter: &TraceFilter,
    ) -> Result<Vec<DecisionTrace>> {
        let mut traces: Vec<DecisionTrace> = self
            .state()
            .traces
            .iter()
            .filter(|t| t.timestamp >= since && filter.matches(t))
            .cloned()
            .collect();
        traces.sort_by_key(|t| t.timestamp);
        if let Some(limit) = filter.limit {
            traces.truncate(limit.max(0) as usize);
        }
        Ok(traces)
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    async fn entity_states(&self, ids: &[String]) -> Result<BTreeMap<String, EntityState>> {
        if self.inner.fail_entity_reads.load(Ordering::SeqCst) {
            return Err(TripwireError::Storage("injected entity read failure".into()));
        }
        let state = self.state();
        Ok(ids
            .iter()
            .filter_map(|id| state.entities.get(id).map(|e| (id.clone(), e.clone())))
            .collect())
    }
}

#[async_trait]
impl GraphStore for MemoryStore {
    async fn neighborhood(&self, ids: &[String], depth: u32) -> Result<Subgraph> {
        if let Some(message) = self
            .inner
            .graph_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(TripwireError::Storage(message));
        }

        let state = self.state();
        let known: HashSet<&str> = state.nodes.iter().map(|n| n.id.as_str()).collect();

        // Breadth-first over relationships in either direction.
        let mut seen: HashSet<String> = HashSet::new();
        let mut frontier: VecDeque<(String, u32)> = VecDeque::new();
        for id in ids.iter().filter(|id| known.contains(id.as_str())) {
            if seen.insert(id.clone()) {
                frontier.push_back((id.clone(), 0));
            }
        }
        let mut rel_ids: HashSet<String> = HashSet::new();
        while let Some((id, hops)) = frontier.pop_front() {
            if hops == depth {
                continue;
            }
            for rel in &state.relationships {
                let other = if rel.start == id {
                    &rel.end
                } else if rel.end == id {
                    &rel.start
                } else {
                    continue;
                };
                rel_ids.insert(rel.id.clone());
                if seen.insert(other.clone()) {
                    frontier.push_back((other.clone(), hops + 1));
                }
            }
        }

        Ok(Subgraph {
            nodes: state
                .nodes
                .iter()
                .filter(|n| seen.contains(&n.id))
                .cloned()
                .collect(),
            relationships: state
                .relationships
                .iter()
                .filter(|r| rel_ids.contains(&r.id))
                .cloned()
                .collect(),
        })
    }
}

#[async_trait]
impl ContextStore for MemoryStore {
    async fn insert_context_event(&self, event: &ContextEvent) -> Result<()> {
        self.state().context_events.push(event.clone());
        Ok(())
    }

    async fn context_events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        user_id: Option<Uuid>,
    ) -> Result<Vec<ContextEvent>> {
        Ok(self
            .state()
            .context_events
            .iter()
            .filter(|e| e.timestamp >= start && e.timestamp <= end)
            .filter(|e| user_id.map_or(true, |u| e.user_id == Some(u)))
            .cloned()
            .collect())
    }

    async fn link_exists(&self, trace_id: Uuid, context_event_id: Uuid) -> Result<bool> {
        self.check_link_failure(trace_id)?;
        Ok(self
            .state()
            .links
            .iter()
            .any(|l| l.trace_id == trace_id && l.context_event_id == context_event_id))
    }

    async fn insert_link(&self, link: &ContextLink) -> Result<bool> {
        self.check_link_failure(link.trace_id)?;
        let mut state = self.state();
        if state
            .links
            .iter()
            .any(|l| l.trace_id == link.trace_id && l.context_event_id == link.context_event_id)
        {
            return Ok(false);
        }
        state.links.push(link.clone());
        Ok(true)
    }

    async fn links_for_trace(&self, trace_id: Uuid) -> Result<Vec<ContextLink>> {
        Ok(self
            .state()
            .links
            .iter()
            .filter(|l| l.trace_id == trace_id)
            .cloned()
            .collect())
    }
}
