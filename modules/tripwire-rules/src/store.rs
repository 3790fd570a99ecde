use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use uuid::Uuid;

use tripwire_common::error::Result;
use tripwire_common::{NewRule, Rule, RuleUpdate, TripwireError};

use crate::condition;

const MAX_NAME_LEN: usize = 100;

/// Rule persistence. The executor only needs `list_enabled_by_event_type`;
/// the rest serves administrative callers.
#[async_trait]
pub trait RuleStore: Send + Sync {
    /// Enabled rules whose filter equals `event_type` exactly.
    async fn list_enabled_by_event_type(&self, event_type: &str) -> Result<Vec<Rule>>;

    async fn get(&self, id: Uuid) -> Result<Option<Rule>>;

    /// All rules, newest first.
    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Rule>>;

    async fn create(&self, new: NewRule) -> Result<Rule>;

    /// Partial update. A non-empty update bumps `version` by one; an empty
    /// update returns the stored rule unchanged.
    async fn update(&self, id: Uuid, update: RuleUpdate) -> Result<Rule>;

    /// Returns whether a rule was removed.
    async fn delete(&self, id: Uuid) -> Result<bool>;
}

/// Reject rules the executor could never run.
pub fn validate_new_rule(new: &NewRule) -> Result<()> {
    validate_name(&new.name)?;
    validate_condition(&new.condition)?;
    validate_action_config(&new.action_config)
}

pub(crate) fn validate_update(update: &RuleUpdate) -> Result<()> {
    if let Some(name) = &update.name {
        validate_name(name)?;
    }
    if let Some(condition) = &update.condition {
        validate_condition(condition)?;
    }
    if let Some(action_config) = &update.action_config {
        validate_action_config(action_config)?;
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<()> {
    let len = name.chars().count();
    if len == 0 || len > MAX_NAME_LEN {
        return Err(TripwireError::Validation(format!(
            "rule name must be 1..={MAX_NAME_LEN} characters"
        )));
    }
    Ok(())
}

fn validate_condition(condition: &serde_json::Value) -> Result<()> {
    if !condition.is_object() {
        return Err(TripwireError::Validation(
            "condition must be a JSON object".into(),
        ));
    }
    condition::validate(condition)
        .map_err(|e| TripwireError::Validation(format!("invalid condition: {e}")))
}

fn validate_action_config(action_config: &serde_json::Value) -> Result<()> {
    if !action_config.is_object() {
        return Err(TripwireError::Validation(
            "action_config must be a JSON object".into(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

/// Rule store held in process memory. Used by tests and local runs.
#[derive(Default)]
pub struct MemoryRuleStore {
    rules: RwLock<HashMap<Uuid, Rule>>,
}

impl MemoryRuleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully-formed rule, bypassing validation.
    pub fn insert(&self, rule: Rule) {
        self.write().insert(rule.id, rule);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Uuid, Rule>> {
        self.rules.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Uuid, Rule>> {
        self.rules.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RuleStore for MemoryRuleStore {
    async fn list_enabled_by_event_type(&self, event_type: &str) -> Result<Vec<Rule>> {
        let mut rules: Vec<Rule> = self
            .read()
            .values()
            .filter(|r| r.enabled && r.event_type_filter == event_type)
            .cloned()
            .collect();
        rules.sort_by_key(|r| r.created_at);
        Ok(rules)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Rule>> {
        Ok(self.read().get(&id).cloned())
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Rule>> {
        let mut rules: Vec<Rule> = self.read().values().cloned().collect();
        rules.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rules
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }

    async fn create(&self, new: NewRule) -> Result<Rule> {
        validate_new_rule(&new)?;
        let rule = Rule::from_new(new);
        self.write().insert(rule.id, rule.clone());
        Ok(rule)
    }

    async fn update(&self, id: Uuid, update: RuleUpdate) -> Result<Rule> {
        validate_update(&update)?;
        let mut rules = self.write();
        let rule = rules
            .get_mut(&id)
            .ok_or_else(|| TripwireError::NotFound(format!("rule {id}")))?;
        rule.apply(update);
        Ok(rule.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        Ok(self.write().remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_rule(name: &str, filter: &str) -> NewRule {
        NewRule::new(
            name,
            filter,
            json!({"==": [{"var": "status"}, "active"]}),
            json!({"type": "log"}),
        )
    }

    #[tokio::test]
    async fn lists_only_enabled_rules_for_exact_event_type() {
        let store = MemoryRuleStore::new();
        let active = store.create(new_rule("a", "object.created")).await.unwrap();
        store
            .create(new_rule("b", "object.created").disabled())
            .await
            .unwrap();
        store.create(new_rule("c", "object.updated")).await.unwrap();
        store.create(new_rule("d", "object.created.task")).await.unwrap();

        let rules = store.list_enabled_by_event_type("object.created").await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].id, active.id);
    }

    #[tokio::test]
    async fn update_bumps_version_and_keeps_unset_fields() {
        let store = MemoryRuleStore::new();
        let rule = store.create(new_rule("escalate", "object.updated")).await.unwrap();

        let updated = store
            .update(
                rule.id,
                RuleUpdate {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.version, rule.version + 1);
        assert!(!updated.enabled);
        assert_eq!(updated.condition, rule.condition);
        assert_eq!(updated.name, rule.name);

        let unchanged = store.update(rule.id, RuleUpdate::default()).await.unwrap();
        assert_eq!(unchanged.version, updated.version);
    }

    #[tokio::test]
    async fn update_of_missing_rule_is_not_found() {
        let store = MemoryRuleStore::new();
        let err = store
            .update(Uuid::new_v4(), RuleUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TripwireError::NotFound(_)));
    }

    #[tokio::test]
    async fn invalid_rules_are_rejected() {
        let store = MemoryRuleStore::new();

        let mut bad_op = new_rule("x", "object.created");
        bad_op.condition = json!({"regex": ["a", "b"]});
        assert!(matches!(
            store.create(bad_op).await,
            Err(TripwireError::Validation(_))
        ));

        let mut bad_action = new_rule("x", "object.created");
        bad_action.action_config = json!("log");
        assert!(store.create(bad_action).await.is_err());

        assert!(store.create(new_rule("", "object.created")).await.is_err());
        assert!(store.list(100, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_reports_whether_rule_existed() {
        let store = MemoryRuleStore::new();
        let rule = store.create(new_rule("a", "object.created")).await.unwrap();
        assert!(store.delete(rule.id).await.unwrap());
        assert!(!store.delete(rule.id).await.unwrap());
        assert!(store.get(rule.id).await.unwrap().is_none());
    }
}
