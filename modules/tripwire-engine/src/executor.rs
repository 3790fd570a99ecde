//! RuleExecutor: the bus handler that loads rules for an event, evaluates
//! them, dispatches matching actions and records a decision trace for every
//! step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use tripwire_actions::{ActionContext, ActionError, ActionRegistry, SessionFactory};
use tripwire_bus::{BusError, EventBus, EventHandler, SubscriptionHandle};
use tripwire_common::{Event, JsonMap, Rule, RULE_EVALUATION};
use tripwire_rules::{try_evaluate, RuleStore};
use tripwire_trace::{DecisionRecord, DecisionTraceService};

use crate::enrich::{CalendarEnricher, Enricher, EventEnricher};

/// Payload keys checked, in order, for the id of the entity an event is about.
const ENTITY_ID_KEYS: [&str; 3] = ["id", "entity_id", "object_id"];

/// Fallback `action_type` on traces for rules whose config names no type.
const UNKNOWN_ACTION: &str = "unknown";

/// Outcome counts for one handled event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionReport {
    pub rules_checked: usize,
    pub rules_matched: usize,
    pub actions_succeeded: usize,
    pub actions_failed: usize,
}

pub struct RuleExecutor {
    rules: Arc<dyn RuleStore>,
    actions: Arc<ActionRegistry>,
    sessions: Arc<dyn SessionFactory>,
    traces: DecisionTraceService,
    enrichers: Vec<Box<dyn Enricher>>,
    stopped: AtomicBool,
    patterns: Mutex<Vec<String>>,
}

impl RuleExecutor {
    pub fn new(
        rules: Arc<dyn RuleStore>,
        actions: Arc<ActionRegistry>,
        sessions: Arc<dyn SessionFactory>,
        traces: DecisionTraceService,
    ) -> Self {
        Self {
            rules,
            actions,
            sessions,
            traces,
            enrichers: vec![Box::new(EventEnricher), Box::new(CalendarEnricher::system())],
            stopped: AtomicBool::new(false),
            patterns: Mutex::new(Vec::new()),
        }
    }

    /// Replace the default enrichers.
    pub fn with_enrichers(mut self, enrichers: Vec<Box<dyn Enricher>>) -> Self {
        self.enrichers = enrichers;
        self
    }

    /// Subscribe to object and link events under the bus namespace.
    pub async fn start(self: &Arc<Self>, bus: &EventBus) -> Result<Vec<SubscriptionHandle>, BusError> {
        self.stopped.store(false, Ordering::SeqCst);
        let namespace = bus.namespace().to_string();
        let mut handles = Vec::new();
        let mut patterns = self.patterns.lock().await;
        for pattern in [format!("{namespace}.object.*"), format!("{namespace}.link.*")] {
            handles.push(bus.subscribe(&pattern, self.clone()).await?);
            patterns.push(pattern);
        }
        info!(namespace = %namespace, subscriptions = patterns.len(), "Rule executor listening");
        Ok(handles)
    }

    /// Stop handling events and drop the executor's subscriptions.
    pub async fn stop(&self, bus: &EventBus) {
        self.stopped.store(true, Ordering::SeqCst);
        let patterns: Vec<String> = self.patterns.lock().await.drain(..).collect();
        for pattern in &patterns {
            bus.unsubscribe(pattern).await;
        }
        info!("Rule executor stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Run every enabled rule for `event`. Action failures are traced and
    /// counted; only rule loading and trace writes fail the call.
    pub async fn execute(&self, event: &Event) -> Result<ExecutionReport> {
        let rules = self
            .rules
            .list_enabled_by_event_type(&event.event_type)
            .await
            .with_context(|| format!("Failed to load rules for {}", event.event_type))?;

        let mut report = ExecutionReport::default();
        if rules.is_empty() {
            debug!(event_id = %event.event_id, event_type = %event.event_type, "No rules for event type");
            return Ok(report);
        }

        let context = Value::Object(self.build_context(event));
        let entity_ids = involved_entity_ids(&event.payload);

        for rule in &rules {
            report.rules_checked += 1;
            if !self.evaluate(rule, event, &context).await? {
                continue;
            }

            report.rules_matched += 1;
            info!(rule = %rule.name, event_id = %event.event_id, "Rule matched");

            let started = Instant::now();
            let (action_type, outcome) = self.dispatch(rule, event).await;
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

            let record = match &outcome {
                Ok(()) => {
                    report.actions_succeeded += 1;
                    DecisionRecord::success(&action_type, rule.action_config.clone())
                }
                Err(e) => {
                    report.actions_failed += 1;
                    warn!(rule = %rule.name, action_type = %action_type, error = %e, "Action failed");
                    DecisionRecord::failure(&action_type, rule.action_config.clone(), e.to_string())
                }
            };
            self.traces
                .log_decision(
                    record
                        .with_rule(rule.id)
                        .with_trigger(event.event_id, event.user_id)
                        .with_entities(entity_ids.clone())
                        .with_latency_ms(latency_ms),
                )
                .await
                .context("Failed to record action trace")?;
        }

        debug!(
            event_id = %event.event_id,
            checked = report.rules_checked,
            matched = report.rules_matched,
            failed = report.actions_failed,
            "Event handled"
        );
        Ok(report)
    }

    fn build_context(&self, event: &Event) -> JsonMap {
        let mut context = event.payload.clone();
        for enricher in &self.enrichers {
            enricher.enrich(event, &mut context);
        }
        context
    }

    /// Evaluate one rule and write its `rule_evaluation` trace. An evaluator
    /// error counts as no match.
    async fn evaluate(&self, rule: &Rule, event: &Event, context: &Value) -> Result<bool> {
        let (matched, record) = match try_evaluate(&rule.condition, context) {
            Ok(matched) => (matched, DecisionRecord::success(RULE_EVALUATION, context.clone())),
            Err(e) => {
                warn!(rule = %rule.name, error = %e, "Condition evaluation failed");
                (
                    false,
                    DecisionRecord::failure(RULE_EVALUATION, context.clone(), e.to_string()),
                )
            }
        };

        self.traces
            .log_decision(
                record
                    .with_output(json!({ "match": matched }))
                    .with_rule(rule.id)
                    .with_trigger(event.event_id, event.user_id),
            )
            .await
            .context("Failed to record evaluation trace")?;

        if !matched {
            debug!(rule = %rule.name, event_id = %event.event_id, "Rule did not match");
        }
        Ok(matched)
    }

    /// Resolve and run the rule's action inside its own session. Returns the
    /// action type to trace under along with the outcome.
    async fn dispatch(&self, rule: &Rule, event: &Event) -> (String, Result<(), ActionError>) {
        let Some(action_type) = rule.action_type() else {
            return (
                UNKNOWN_ACTION.to_string(),
                Err(ActionError::Config("action_config has no type".into())),
            );
        };

        let action = match self.actions.get(action_type) {
            Ok(action) => action,
            Err(e) => return (action_type.to_string(), Err(e)),
        };

        let session = match self.sessions.begin().await {
            Ok(session) => session,
            Err(e) => return (action_type.to_string(), Err(e)),
        };
        let ctx = ActionContext::new(rule, event, session);

        let outcome = match action.execute(&rule.action_config, &ctx).await {
            Ok(()) => ctx.session.commit().await,
            Err(e) => {
                if let Err(rollback) = ctx.session.rollback().await {
                    warn!(rule = %rule.name, error = %rollback, "Session rollback failed");
                }
                Err(e)
            }
        };
        (action.type_name().to_string(), outcome)
    }
}

#[async_trait]
impl EventHandler for RuleExecutor {
    async fn handle(&self, event: Event) -> Result<()> {
        if self.is_stopped() {
            anyhow::bail!("rule executor is stopped");
        }
        self.execute(&event).await.map(|_| ())
    }
}

/// The payload's entity id (`id`, then `entity_id`, then `object_id`), if any.
pub fn involved_entity_ids(payload: &JsonMap) -> Vec<String> {
    ENTITY_ID_KEYS
        .iter()
        .find_map(|key| match payload.get(*key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(value: Value) -> JsonMap {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn entity_id_prefers_id_then_entity_id_then_object_id() {
        assert_eq!(
            involved_entity_ids(&payload(json!({"id": "a", "entity_id": "b"}))),
            vec!["a"]
        );
        assert_eq!(
            involved_entity_ids(&payload(json!({"entity_id": "b", "object_id": "c"}))),
            vec!["b"]
        );
        assert_eq!(involved_entity_ids(&payload(json!({"object_id": 42}))), vec!["42"]);
    }

    #[test]
    fn no_entity_id_means_no_snapshot() {
        assert!(involved_entity_ids(&payload(json!({"status": "active"}))).is_empty());
        assert!(involved_entity_ids(&payload(json!({"id": ""}))).is_empty());
        assert!(involved_entity_ids(&payload(json!({"id": {"nested": 1}}))).is_empty());
    }
}
