//! PgRuleStore: rules in the `rules` table, condition and action config as JSONB.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use tripwire_common::error::Result;
use tripwire_common::{NewRule, Rule, RuleUpdate, TripwireError};

use crate::store::{validate_new_rule, validate_update, RuleStore};

const RULE_COLUMNS: &str = "id, name, description, event_type_filter, condition, action_config, \
                            enabled, version, created_by, created_at, updated_at";

#[derive(Clone)]
pub struct PgRuleStore {
    pool: PgPool,
}

impl PgRuleStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RuleStore for PgRuleStore {
    async fn list_enabled_by_event_type(&self, event_type: &str) -> Result<Vec<Rule>> {
        let rows = sqlx::query_as::<_, RuleRow>(&format!(
            "SELECT {RULE_COLUMNS} FROM rules \
             WHERE enabled AND event_type_filter = $1 \
             ORDER BY created_at ASC"
        ))
        .bind(event_type)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Rule>> {
        let row = sqlx::query_as::<_, RuleRow>(&format!(
            "SELECT {RULE_COLUMNS} FROM rules WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.0))
    }

    async fn list(&self, limit: i64, offset: i64) -> Result<Vec<Rule>> {
        let rows = sqlx::query_as::<_, RuleRow>(&format!(
            "SELECT {RULE_COLUMNS} FROM rules ORDER BY created_at DESC LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    async fn create(&self, new: NewRule) -> Result<Rule> {
        validate_new_rule(&new)?;
        let rule = Rule::from_new(new);

        sqlx::query(
            r#"
            INSERT INTO rules (id, name, description, event_type_filter, condition, action_config,
                               enabled, version, created_by, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(&rule.event_type_filter)
        .bind(&rule.condition)
        .bind(&rule.action_config)
        .bind(rule.enabled)
        .bind(rule.version)
        .bind(&rule.created_by)
        .bind(rule.created_at)
        .bind(rule.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(rule)
    }

    async fn update(&self, id: Uuid, update: RuleUpdate) -> Result<Rule> {
        validate_update(&update)?;

        // Lock the row so concurrent updates each get their own version bump.
        let mut tx = self.pool.begin().await?;
        let mut rule = sqlx::query_as::<_, RuleRow>(&format!(
            "SELECT {RULE_COLUMNS} FROM rules WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .map(|r| r.0)
        .ok_or_else(|| TripwireError::NotFound(format!("rule {id}")))?;

        if !rule.apply(update) {
            return Ok(rule);
        }

        sqlx::query(
            r#"
            UPDATE rules
            SET name = $2, description = $3, event_type_filter = $4, condition = $5,
                action_config = $6, enabled = $7, version = $8, updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(&rule.description)
        .bind(&rule.event_type_filter)
        .bind(&rule.condition)
        .bind(&rule.action_config)
        .bind(rule.enabled)
        .bind(rule.version)
        .bind(rule.updated_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        Ok(rule)
    }

    async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = sqlx::query("DELETE FROM rules WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// sqlx::FromRow for Rule
// ---------------------------------------------------------------------------

struct RuleRow(Rule);

impl<'r> sqlx::FromRow<'r, sqlx::postgres::PgRow> for RuleRow {
    fn from_row(row: &'r sqlx::postgres::PgRow) -> std::result::Result<Self, sqlx::Error> {
        Ok(RuleRow(Rule {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            description: row.try_get("description")?,
            event_type_filter: row.try_get("event_type_filter")?,
            condition: row.try_get("condition")?,
            action_config: row.try_get("action_config")?,
            enabled: row.try_get("enabled")?,
            version: row.try_get("version")?,
            created_by: row.try_get("created_by")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        }))
    }
}
