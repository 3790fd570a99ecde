use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use tripwire_common::{Event, JsonMap, Rule, TripwireError};

use crate::session::Session;
use crate::template;

#[derive(Error, Debug)]
pub enum ActionError {
    #[error("invalid action config: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("action type not registered: {0}")]
    NotFound(String),

    #[error("action type already registered: {0}")]
    AlreadyRegistered(String),

    #[error("action failed: {0}")]
    Failed(String),
}

impl From<sqlx::Error> for ActionError {
    fn from(e: sqlx::Error) -> Self {
        ActionError::Persistence(e.to_string())
    }
}

impl From<TripwireError> for ActionError {
    fn from(e: TripwireError) -> Self {
        ActionError::Persistence(e.to_string())
    }
}

impl From<reqwest::Error> for ActionError {
    fn from(e: reqwest::Error) -> Self {
        ActionError::Transport(e.to_string())
    }
}

/// Everything an action may read about the match that triggered it, plus the
/// session its writes go through.
pub struct ActionContext {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub event_id: Uuid,
    pub event_type: String,
    pub tenant_id: Option<Uuid>,
    pub user_id: Option<Uuid>,
    /// The triggering event's payload.
    pub event_data: JsonMap,
    pub session: Box<dyn Session>,
}

impl ActionContext {
    pub fn new(rule: &Rule, event: &Event, session: Box<dyn Session>) -> Self {
        Self {
            rule_id: rule.id,
            rule_name: rule.name.clone(),
            event_id: event.event_id,
            event_type: event.event_type.clone(),
            tenant_id: (!event.tenant_id.is_nil()).then_some(event.tenant_id),
            user_id: event.user_id,
            event_data: event.payload.clone(),
            session,
        }
    }

    /// Fill `{{ ... }}` placeholders from this context.
    pub fn render(&self, template: &str) -> String {
        template::render(template, &self.rule_name, &self.event_type, &self.event_data)
    }
}

/// A side effect a rule can trigger, resolved by `type_name`.
#[async_trait]
pub trait Action: Send + Sync {
    /// Registry key, matched against `action_config.type`.
    fn type_name(&self) -> &str;

    /// Perform the action. `config` is the rule's `action_config` verbatim.
    async fn execute(&self, config: &serde_json::Value, ctx: &ActionContext)
        -> Result<(), ActionError>;
}

/// String field of an action config, if present.
pub(crate) fn config_str<'a>(config: &'a serde_json::Value, key: &str) -> Option<&'a str> {
    config.get(key).and_then(|v| v.as_str())
}
