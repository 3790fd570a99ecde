use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, warn};
use uuid::Uuid;

use tripwire_common::error::Result;
use tripwire_common::{DecisionTrace, TraceStatus};

use crate::snapshot::{ContextSnapshotService, DEFAULT_DEPTH};
use crate::store::{TraceFilter, TraceStore};

/// What to record about one decision. Becomes a `DecisionTrace` once the
/// service assigns an id, timestamp and snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionRecord {
    pub action_type: String,
    pub input_payload: Value,
    pub output_payload: Option<Value>,
    pub rule_id: Option<Uuid>,
    pub trigger_event_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    /// Entities to snapshot. Empty means no snapshot.
    pub involved_entity_ids: Vec<String>,
    pub latency_ms: Option<f64>,
    pub status: TraceStatus,
    pub error_message: Option<String>,
}

impl DecisionRecord {
    pub fn success(action_type: impl Into<String>, input_payload: Value) -> Self {
        Self {
            action_type: action_type.into(),
            input_payload,
            output_payload: None,
            rule_id: None,
            trigger_event_id: None,
            user_id: None,
            involved_entity_ids: Vec::new(),
            latency_ms: None,
            status: TraceStatus::Success,
            error_message: None,
        }
    }

    pub fn failure(
        action_type: impl Into<String>,
        input_payload: Value,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            status: TraceStatus::Failure,
            error_message: Some(error_message.into()),
            ..Self::success(action_type, input_payload)
        }
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output_payload = Some(output);
        self
    }

    pub fn with_rule(mut self, rule_id: Uuid) -> Self {
        self.rule_id = Some(rule_id);
        self
    }

    pub fn with_trigger(mut self, event_id: Uuid, user_id: Option<Uuid>) -> Self {
        self.trigger_event_id = Some(event_id);
        self.user_id = user_id;
        self
    }

    pub fn with_entities(mut self, ids: Vec<String>) -> Self {
        self.involved_entity_ids = ids;
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// Writes decision traces, capturing a context snapshot first when the
/// decision involves entities.
#[derive(Clone)]
pub struct DecisionTraceService {
    store: Arc<dyn TraceStore>,
    snapshots: ContextSnapshotService,
}

impl DecisionTraceService {
    pub fn new(store: Arc<dyn TraceStore>, snapshots: ContextSnapshotService) -> Self {
        Self { store, snapshots }
    }

    /// Persist a trace and return its id. Snapshot failures are logged and the
    /// trace is written without one; trace write failures are returned.
    pub async fn log_decision(&self, record: DecisionRecord) -> Result<Uuid> {
        let trace_id = Uuid::new_v4();

        let snapshot_id = if record.involved_entity_ids.is_empty() {
            None
        } else {
            match self
                .snapshots
                .capture_snapshot(&record.involved_entity_ids, DEFAULT_DEPTH)
                .await
            {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(trace_id = %trace_id, error = %e, "Failed to capture snapshot for trace");
                    None
                }
            }
        };

        let trace = DecisionTrace {
            id: trace_id,
            rule_id: record.rule_id,
            trigger_event_id: record.trigger_event_id,
            user_id: record.user_id,
            action_type: record.action_type,
            input_payload: record.input_payload,
            output_payload: record.output_payload,
            status: record.status,
            error_message: record.error_message,
            latency_ms: record.latency_ms,
            timestamp: Utc::now(),
            snapshot_id,
        };

        if let Err(e) = self.store.insert_trace(&trace).await {
            error!(trace_id = %trace_id, error = %e, "Failed to log decision trace");
            return Err(e);
        }

        debug!(trace_id = %trace_id, action_type = %trace.action_type, status = %trace.status, "Logged decision trace");
        Ok(trace_id)
    }

    pub async fn get(&self, trace_id: Uuid) -> Result<Option<DecisionTrace>> {
        self.store.get_trace(trace_id).await
    }

    pub async fn list_since(
        &self,
        since: DateTime<Utc>,
        filter: &TraceFilter,
    ) -> Result<Vec<DecisionTrace>> {
        self.store.traces_since(since, filter).await
    }
}
