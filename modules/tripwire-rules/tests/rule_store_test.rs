//! Integration tests for PgRuleStore.
//! Requires a Postgres instance. Set DATABASE_TEST_URL or these tests are skipped.

use serde_json::json;
use sqlx::PgPool;

use tripwire_common::{NewRule, RuleUpdate, TripwireError};
use tripwire_rules::{PgRuleStore, RuleStore};

async fn test_pool() -> Option<PgPool> {
    let url = std::env::var("DATABASE_TEST_URL").ok()?;
    let pool = PgPool::connect(&url).await.ok()?;
    sqlx::migrate!("../../migrations").run(&pool).await.ok()?;
    Some(pool)
}

/// Fresh event type per test run so rules left by earlier runs are never matched.
fn unique_event_type(prefix: &str) -> String {
    format!("{prefix}.{}", uuid::Uuid::new_v4().simple())
}

fn active_rule(name: &str, event_type: &str) -> NewRule {
    NewRule::new(
        name,
        event_type,
        json!({"==": [{"var": "status"}, "active"]}),
        json!({"type": "in_app", "title": "New active object"}),
    )
}

#[tokio::test]
async fn create_then_load_by_event_type() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgRuleStore::new(pool);
    let event_type = unique_event_type("object.created");

    let rule = store
        .create(active_rule("notify-active", &event_type))
        .await
        .unwrap();
    let dormant = store
        .create(active_rule("dormant", &event_type).disabled())
        .await
        .unwrap();

    let loaded = store
        .list_enabled_by_event_type(&event_type)
        .await
        .unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded[0].id, rule.id);
    assert_eq!(loaded[0].condition, rule.condition);
    assert_eq!(loaded[0].action_type(), Some("in_app"));
    assert_eq!(loaded[0].version, 1);

    assert!(store.get(dormant.id).await.unwrap().is_some());
    assert!(!store.list(100, 0).await.unwrap().is_empty());
}

#[tokio::test]
async fn update_is_partial_and_versioned() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgRuleStore::new(pool);
    let rule = store
        .create(active_rule("escalate", &unique_event_type("object.updated")))
        .await
        .unwrap();

    let updated = store
        .update(
            rule.id,
            RuleUpdate {
                description: Some("escalate blocked objects".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(updated.version, 2);

    let reloaded = store.get(rule.id).await.unwrap().unwrap();
    assert_eq!(reloaded.version, 2);
    assert_eq!(reloaded.description.as_deref(), Some("escalate blocked objects"));
    assert_eq!(reloaded.action_config, rule.action_config);
    assert_eq!(reloaded.event_type_filter, rule.event_type_filter);
}

#[tokio::test]
async fn update_and_delete_missing_rule() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let store = PgRuleStore::new(pool);
    let id = uuid::Uuid::new_v4();

    let err = store
        .update(
            id,
            RuleUpdate {
                enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TripwireError::NotFound(_)));
    assert!(!store.delete(id).await.unwrap());
}
