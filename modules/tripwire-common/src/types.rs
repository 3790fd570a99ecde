use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// JSON object used for payloads, metadata and entity data.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// `action_type` recorded on the trace written for the evaluation step itself.
pub const RULE_EVALUATION: &str = "rule_evaluation";

// --- Events ---

/// Immutable envelope published to the bus. Never mutated after publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Event {
    pub event_id: Uuid,
    /// Dotted hierarchical type, e.g. `object.created`.
    pub event_type: String,
    pub entity_type: String,
    pub entity_id: Uuid,
    pub tenant_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: JsonMap,
    #[serde(default)]
    pub metadata: JsonMap,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: Uuid,
        tenant_id: Uuid,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            entity_type: entity_type.into(),
            entity_id,
            tenant_id,
            user_id: None,
            timestamp: Utc::now(),
            payload: JsonMap::new(),
            metadata: JsonMap::new(),
        }
    }

    /// Replace the payload. Non-object values are stored under `value`.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = into_map(payload);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = into_map(metadata);
        self
    }

    pub fn with_user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Bus subject for this event: `<namespace>.<event_type>`.
    pub fn subject(&self, namespace: &str) -> String {
        format!("{namespace}.{}", self.event_type)
    }

    /// Fields listed in `metadata.changed_fields` (update events).
    pub fn changed_fields(&self) -> Vec<String> {
        self.metadata
            .get("changed_fields")
            .and_then(|v| v.as_array())
            .map(|fields| {
                fields
                    .iter()
                    .filter_map(|f| f.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn into_map(value: serde_json::Value) -> JsonMap {
    match value {
        serde_json::Value::Object(map) => map,
        serde_json::Value::Null => JsonMap::new(),
        other => {
            let mut map = JsonMap::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

// --- Rules ---

/// Persisted (event-type filter, condition, action) triple.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Rule {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    /// Matched against `Event::event_type` by exact equality.
    pub event_type_filter: String,
    pub condition: serde_json::Value,
    pub action_config: serde_json::Value,
    pub enabled: bool,
    pub version: i32,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Rule {
    /// Build a fresh rule (version 1) from a create request.
    pub fn from_new(new: NewRule) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: new.name,
            description: new.description,
            event_type_filter: new.event_type_filter,
            condition: new.condition,
            action_config: new.action_config,
            enabled: new.enabled,
            version: 1,
            created_by: new.created_by,
            created_at: now,
            updated_at: now,
        }
    }

    /// The action discriminator, `action_config.type`.
    pub fn action_type(&self) -> Option<&str> {
        self.action_config.get("type").and_then(|t| t.as_str())
    }

    /// Apply a partial update. Bumps `version` by exactly one unless the
    /// update is empty, in which case the rule is left as-is.
    pub fn apply(&mut self, update: RuleUpdate) -> bool {
        if update.is_empty() {
            return false;
        }
        if let Some(name) = update.name {
            self.name = name;
        }
        if let Some(description) = update.description {
            self.description = Some(description);
        }
        if let Some(filter) = update.event_type_filter {
            self.event_type_filter = filter;
        }
        if let Some(condition) = update.condition {
            self.condition = condition;
        }
        if let Some(action_config) = update.action_config {
            self.action_config = action_config;
        }
        if let Some(enabled) = update.enabled {
            self.enabled = enabled;
        }
        self.version += 1;
        self.updated_at = Utc::now();
        true
    }
}

/// Create request for a rule.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NewRule {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub event_type_filter: String,
    pub condition: serde_json::Value,
    pub action_config: serde_json::Value,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub created_by: Option<String>,
}

fn default_enabled() -> bool {
    true
}

impl NewRule {
    pub fn new(
        name: impl Into<String>,
        event_type_filter: impl Into<String>,
        condition: serde_json::Value,
        action_config: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: None,
            event_type_filter: event_type_filter.into(),
            condition,
            action_config,
            enabled: true,
            created_by: None,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}

/// Partial update. Unset fields are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub event_type_filter: Option<String>,
    pub condition: Option<serde_json::Value>,
    pub action_config: Option<serde_json::Value>,
    pub enabled: Option<bool>,
}

impl RuleUpdate {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.event_type_filter.is_none()
            && self.condition.is_none()
            && self.action_config.is_none()
            && self.enabled.is_none()
    }
}

// --- Decision traces ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Success,
    Failure,
}

impl TraceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceStatus::Success => "success",
            TraceStatus::Failure => "failure",
        }
    }
}

impl std::fmt::Display for TraceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TraceStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(TraceStatus::Success),
            "failure" => Ok(TraceStatus::Failure),
            other => Err(format!("unknown trace status: {other}")),
        }
    }
}

/// Append-only audit record of one evaluation or action attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DecisionTrace {
    pub id: Uuid,
    pub rule_id: Option<Uuid>,
    pub trigger_event_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    pub action_type: String,
    pub input_payload: serde_json::Value,
    pub output_payload: Option<serde_json::Value>,
    pub status: TraceStatus,
    pub error_message: Option<String>,
    pub latency_ms: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub snapshot_id: Option<Uuid>,
}

impl DecisionTrace {
    /// `output_payload.match` for `rule_evaluation` traces.
    pub fn matched(&self) -> Option<bool> {
        self.output_payload
            .as_ref()
            .and_then(|o| o.get("match"))
            .and_then(|m| m.as_bool())
    }
}

// --- Context snapshots ---

/// State of one entity at capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct EntityState {
    #[serde(rename = "type")]
    pub entity_type: String,
    pub data: serde_json::Value,
    pub status: Option<String>,
    pub version: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GraphNode {
    pub id: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub properties: serde_json::Value,
}

/// Edge between two nodes, referenced by node id only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct GraphRelationship {
    pub id: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    pub start: String,
    pub end: String,
    pub properties: serde_json::Value,
}

/// Bounded-hop neighborhood. Serialized as `{nodes, relationships}` or, when
/// the graph store could not be read, `{error}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum GraphNeighborhood {
    Graph {
        nodes: Vec<GraphNode>,
        relationships: Vec<GraphRelationship>,
    },
    Error {
        error: String,
    },
}

impl GraphNeighborhood {
    pub fn empty() -> Self {
        GraphNeighborhood::Graph {
            nodes: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            GraphNeighborhood::Error { error } => Some(error),
            GraphNeighborhood::Graph { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ContextSnapshot {
    pub id: Uuid,
    pub entity_states: BTreeMap<String, EntityState>,
    pub graph_neighborhood: GraphNeighborhood,
    pub timestamp: DateTime<Utc>,
}

// --- Ambient context ---

/// Raw context captured from an external source (browser, chat, IDE...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ContextEvent {
    pub id: Uuid,
    pub source: String,
    pub source_id: String,
    pub user_id: Option<Uuid>,
    pub session_id: Option<String>,
    pub content: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum LinkType {
    Temporal,
    Semantic,
    Manual,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Temporal => "temporal",
            LinkType::Semantic => "semantic",
            LinkType::Manual => "manual",
        }
    }
}

impl std::fmt::Display for LinkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for LinkType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temporal" => Ok(LinkType::Temporal),
            "semantic" => Ok(LinkType::Semantic),
            "manual" => Ok(LinkType::Manual),
            other => Err(format!("unknown link type: {other}")),
        }
    }
}

/// Association between a trace and a context event. Unique per pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ContextLink {
    pub id: Uuid,
    pub trace_id: Uuid,
    pub context_event_id: Uuid,
    pub relevance_score: f64,
    pub link_type: LinkType,
    pub created_at: DateTime<Utc>,
}

impl ContextLink {
    pub fn temporal(trace_id: Uuid, context_event_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            trace_id,
            context_event_id,
            relevance_score: 1.0,
            link_type: LinkType::Temporal,
            created_at: Utc::now(),
        }
    }
}

// --- Notifications ---

/// In-app notification row written by the `in_app` action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Notification {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub rule_id: Option<Uuid>,
    pub rule_name: String,
    pub event_id: Option<Uuid>,
    pub title: String,
    pub message: String,
    pub status: String,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
