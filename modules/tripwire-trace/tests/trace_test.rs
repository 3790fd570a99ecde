//! Decision traces, snapshots and correlation against the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::watch;
use uuid::Uuid;

use tripwire_common::{
    ContextEvent, CorrelationConfig, DecisionTrace, EntityState, GraphNode, GraphRelationship,
    LinkType, TraceStatus,
};
use tripwire_trace::{
    ContextSnapshotService, ContextStore, CorrelationEngine, DecisionRecord, DecisionTraceService,
    MemoryStore, TraceFilter, TraceStore,
};

// =========================================================================
// Helpers
// =========================================================================

fn services(store: &MemoryStore) -> (ContextSnapshotService, DecisionTraceService) {
    let shared = Arc::new(store.clone());
    let snapshots = ContextSnapshotService::new(shared.clone(), shared.clone(), shared.clone());
    let decisions = DecisionTraceService::new(shared, snapshots.clone());
    (snapshots, decisions)
}

fn entity(status: &str) -> EntityState {
    EntityState {
        entity_type: "deal".into(),
        data: json!({"amount": 1200}),
        status: Some(status.into()),
        version: 3,
    }
}

fn node(id: &str) -> GraphNode {
    GraphNode {
        id: id.into(),
        labels: vec!["Object".into()],
        properties: json!({"id": id}),
    }
}

fn edge(id: &str, start: &str, end: &str) -> GraphRelationship {
    GraphRelationship {
        id: id.into(),
        rel_type: "RELATES_TO".into(),
        start: start.into(),
        end: end.into(),
        properties: json!({}),
    }
}

fn trace_at(timestamp: DateTime<Utc>, user_id: Option<Uuid>) -> DecisionTrace {
    DecisionTrace {
        id: Uuid::new_v4(),
        rule_id: None,
        trigger_event_id: Some(Uuid::new_v4()),
        user_id,
        action_type: "slack".into(),
        input_payload: json!({}),
        output_payload: None,
        status: TraceStatus::Success,
        error_message: None,
        latency_ms: Some(12.5),
        timestamp,
        snapshot_id: None,
    }
}

fn context_event_at(timestamp: DateTime<Utc>, user_id: Option<Uuid>) -> ContextEvent {
    ContextEvent {
        id: Uuid::new_v4(),
        source: "browser".into(),
        source_id: "tab-1".into(),
        user_id,
        session_id: None,
        content: json!({"url": "https://crm.example/deals/7"}),
        timestamp,
    }
}

// =========================================================================
// Snapshots
// =========================================================================

#[tokio::test]
async fn snapshot_flattens_bounded_neighborhood() {
    let store = MemoryStore::new();
    store.put_entity("obj-1", entity("active"));
    for id in ["obj-1", "obj-2", "obj-3"] {
        store.add_node(node(id));
    }
    store.add_relationship(edge("r1", "obj-1", "obj-2"));
    store.add_relationship(edge("r2", "obj-2", "obj-3"));
    let (snapshots, _) = services(&store);

    let id = snapshots
        .capture_snapshot(&["obj-1".to_string()], 1)
        .await
        .unwrap();
    let snapshot = store.get_snapshot(id).await.unwrap().unwrap();

    assert_eq!(snapshot.entity_states["obj-1"].status.as_deref(), Some("active"));
    let graph = serde_json::to_value(&snapshot.graph_neighborhood).unwrap();
    let node_ids: Vec<&str> = graph["nodes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|n| n["id"].as_str().unwrap())
        .collect();
    assert_eq!(node_ids, vec!["obj-1", "obj-2"]);
    assert_eq!(graph["relationships"], json!([{
        "id": "r1", "type": "RELATES_TO", "start": "obj-1", "end": "obj-2", "properties": {}
    }]));
}

#[tokio::test]
async fn graph_failure_is_recorded_in_snapshot() {
    let store = MemoryStore::new();
    store.put_entity("obj-1", entity("active"));
    store.fail_graph(Some("connection refused"));
    let (snapshots, _) = services(&store);

    let id = snapshots
        .capture_snapshot(&["obj-1".to_string()], 1)
        .await
        .unwrap();
    let snapshot = store.get_snapshot(id).await.unwrap().unwrap();

    assert_eq!(snapshot.entity_states.len(), 1);
    assert!(snapshot
        .graph_neighborhood
        .error()
        .unwrap()
        .contains("connection refused"));
}

#[tokio::test]
async fn entity_store_failure_propagates() {
    let store = MemoryStore::new();
    store.fail_entity_reads(true);
    let (snapshots, _) = services(&store);

    assert!(snapshots
        .capture_snapshot(&["obj-1".to_string()], 1)
        .await
        .is_err());
    assert!(store.snapshots().is_empty());
}

// =========================================================================
// Decision traces
// =========================================================================

#[tokio::test]
async fn decision_with_entities_gets_snapshot() {
    let store = MemoryStore::new();
    store.put_entity("obj-1", entity("active"));
    let (_, decisions) = services(&store);
    let rule_id = Uuid::new_v4();
    let event_id = Uuid::new_v4();

    let trace_id = decisions
        .log_decision(
            DecisionRecord::success("in_app", json!({"title": "hi"}))
                .with_rule(rule_id)
                .with_trigger(event_id, None)
                .with_entities(vec!["obj-1".into()])
                .with_latency_ms(4.2),
        )
        .await
        .unwrap();

    let trace = decisions.get(trace_id).await.unwrap().unwrap();
    assert_eq!(trace.rule_id, Some(rule_id));
    assert_eq!(trace.trigger_event_id, Some(event_id));
    assert_eq!(trace.status, TraceStatus::Success);
    assert_eq!(trace.latency_ms, Some(4.2));
    let snapshot_id = trace.snapshot_id.expect("snapshot attached");
    assert!(store.get_snapshot(snapshot_id).await.unwrap().is_some());
}

#[tokio::test]
async fn snapshot_failure_does_not_block_trace() {
    let store = MemoryStore::new();
    store.fail_entity_reads(true);
    let (_, decisions) = services(&store);

    let trace_id = decisions
        .log_decision(
            DecisionRecord::failure("slack", json!({}), "webhook returned 500")
                .with_entities(vec!["obj-1".into()]),
        )
        .await
        .unwrap();

    let trace = decisions.get(trace_id).await.unwrap().unwrap();
    assert_eq!(trace.snapshot_id, None);
    assert_eq!(trace.status, TraceStatus::Failure);
    assert_eq!(trace.error_message.as_deref(), Some("webhook returned 500"));
}

#[tokio::test]
async fn trace_write_failure_is_returned() {
    let store = MemoryStore::new();
    store.fail_trace_writes(true);
    let (_, decisions) = services(&store);

    assert!(decisions
        .log_decision(DecisionRecord::success("log", json!({})))
        .await
        .is_err());
}

#[tokio::test]
async fn list_since_applies_filters() {
    let store = MemoryStore::new();
    let (_, decisions) = services(&store);
    let user = Uuid::new_v4();
    let rule = Uuid::new_v4();
    let start = Utc::now() - chrono::Duration::seconds(1);

    decisions
        .log_decision(DecisionRecord::success("log", json!({})).with_rule(rule))
        .await
        .unwrap();
    decisions
        .log_decision(
            DecisionRecord::failure("slack", json!({}), "boom").with_trigger(Uuid::new_v4(), Some(user)),
        )
        .await
        .unwrap();
    decisions
        .log_decision(DecisionRecord::success("in_app", json!({})).with_trigger(Uuid::new_v4(), Some(user)))
        .await
        .unwrap();

    let all = decisions.list_since(start, &TraceFilter::default()).await.unwrap();
    assert_eq!(all.len(), 3);

    let failures = TraceFilter {
        status: Some(TraceStatus::Failure),
        ..Default::default()
    };
    assert_eq!(decisions.list_since(start, &failures).await.unwrap().len(), 1);

    let by_user = TraceFilter {
        user_id: Some(user),
        limit: Some(1),
        ..Default::default()
    };
    let listed = decisions.list_since(start, &by_user).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].user_id, Some(user));

    let by_rule = TraceFilter {
        rule_id: Some(rule),
        ..Default::default()
    };
    assert_eq!(decisions.list_since(start, &by_rule).await.unwrap()[0].action_type, "log");
}

// =========================================================================
// Correlation
// =========================================================================

fn engine(store: &MemoryStore) -> CorrelationEngine {
    let shared = Arc::new(store.clone());
    CorrelationEngine::new(shared.clone(), shared, CorrelationConfig::default())
}

#[tokio::test]
async fn correlation_links_nearby_events_once() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let t = now - chrono::Duration::minutes(10);
    let user = Uuid::new_v4();

    let trace = trace_at(t, Some(user));
    store.insert_trace(&trace).await.unwrap();
    let near = context_event_at(t - chrono::Duration::minutes(2), Some(user));
    store.insert_context_event(&near).await.unwrap();
    // Outside the window, and inside the window but for someone else.
    store
        .insert_context_event(&context_event_at(t - chrono::Duration::minutes(7), Some(user)))
        .await
        .unwrap();
    store
        .insert_context_event(&context_event_at(t + chrono::Duration::minutes(1), Some(Uuid::new_v4())))
        .await
        .unwrap();

    let engine = engine(&store);
    let first = engine.run_once(now).await.unwrap();
    let second = engine.run_once(now).await.unwrap();

    assert_eq!(first.traces_scanned, 1);
    assert_eq!(first.links_created, 1);
    assert_eq!(second.links_created, 0);

    let links = store.links_for_trace(trace.id).await.unwrap();
    assert_eq!(links.len(), 1);
    assert_eq!(links[0].context_event_id, near.id);
    assert_eq!(links[0].link_type, LinkType::Temporal);
    assert_eq!(links[0].relevance_score, 1.0);
}

#[tokio::test]
async fn trace_without_user_links_any_user() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let trace = trace_at(now - chrono::Duration::minutes(1), None);
    store.insert_trace(&trace).await.unwrap();
    store
        .insert_context_event(&context_event_at(now, Some(Uuid::new_v4())))
        .await
        .unwrap();
    store
        .insert_context_event(&context_event_at(now, None))
        .await
        .unwrap();

    let stats = engine(&store).run_once(now).await.unwrap();
    assert_eq!(stats.links_created, 2);
}

#[tokio::test]
async fn traces_outside_lookback_are_ignored() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let old = trace_at(now - chrono::Duration::hours(2), None);
    store.insert_trace(&old).await.unwrap();
    store
        .insert_context_event(&context_event_at(old.timestamp, None))
        .await
        .unwrap();

    let stats = engine(&store).run_once(now).await.unwrap();
    assert_eq!(stats.traces_scanned, 0);
    assert!(store.links().is_empty());
}

#[tokio::test]
async fn failing_trace_is_counted_and_batch_continues() {
    let store = MemoryStore::new();
    let now = Utc::now();
    let broken = trace_at(now - chrono::Duration::minutes(3), None);
    let healthy = trace_at(now - chrono::Duration::minutes(2), None);
    store.insert_trace(&broken).await.unwrap();
    store.insert_trace(&healthy).await.unwrap();
    store
        .insert_context_event(&context_event_at(now - chrono::Duration::minutes(2), None))
        .await
        .unwrap();
    store.fail_links_for(broken.id);

    let stats = engine(&store).run_once(now).await.unwrap();
    assert_eq!(stats.traces_scanned, 2);
    assert_eq!(stats.failures, 1);
    assert_eq!(stats.links_created, 1);
    assert_eq!(store.links_for_trace(healthy.id).await.unwrap().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn run_stops_on_shutdown() {
    let store = MemoryStore::new();
    let engine = Arc::new(engine(&store));
    let (tx, rx) = watch::channel(false);

    let worker = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run(rx).await })
    };
    tokio::time::sleep(Duration::from_secs(150)).await;
    tx.send(true).unwrap();

    tokio::time::timeout(Duration::from_secs(5), worker)
        .await
        .expect("worker stops")
        .unwrap();
}

// =========================================================================
// Postgres (skipped unless DATABASE_TEST_URL is set)
// =========================================================================

async fn test_pool() -> Option<sqlx::PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = sqlx::PgPool::connect(&url).await.ok()?;
    sqlx::migrate!("../../migrations").run(&pool).await.ok()?;
    Some(pool)
}

#[tokio::test]
async fn pg_store_links_are_unique_per_trace_and_event() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = tripwire_trace::PgStore::new(pool);
    let now = Utc::now();
    let user = Uuid::new_v4();

    let trace = trace_at(now - chrono::Duration::minutes(1), Some(user));
    store.insert_trace(&trace).await.unwrap();
    let event = context_event_at(now, Some(user));
    store.insert_context_event(&event).await.unwrap();

    let link = tripwire_common::ContextLink::temporal(trace.id, event.id);
    assert!(store.insert_link(&link).await.unwrap());
    let again = tripwire_common::ContextLink::temporal(trace.id, event.id);
    assert!(!store.insert_link(&again).await.unwrap());
    assert!(store.link_exists(trace.id, event.id).await.unwrap());

    let loaded = store.get_trace(trace.id).await.unwrap().unwrap();
    assert_eq!(loaded.user_id, Some(user));
    assert_eq!(loaded.status, TraceStatus::Success);
    assert_eq!(store.links_for_trace(trace.id).await.unwrap().len(), 1);
}
