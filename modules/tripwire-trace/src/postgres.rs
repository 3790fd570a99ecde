//! PgStore: traces, snapshots, entity state and context events in Postgres.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use tripwire_common::error::Result;
use tripwire_common::{
    ContextEvent, ContextLink, ContextSnapshot, DecisionTrace, EntityState, GraphNeighborhood,
    LinkType, TraceStatus, TripwireError,
};

use crate::store::{ContextStore, EntityStore, TraceFilter, TraceStore};

const TRACE_COLUMNS: &str = "id, rule_id, trigger_event_id, user_id, action_type, input_payload, \
                             output_payload, status, error_message, latency_ms, timestamp, snapshot_id";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TraceStore for PgStore {
    async fn insert_snapshot(&self, snapshot: &ContextSnapshot) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO context_snapshots (id, entity_states, graph_neighborhood, timestamp)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(snapshot.id)
        .bind(Json(&snapshot.entity_states))
        .bind(Json(&snapshot.graph_neighborhood))
        .bind(snapshot.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_snapshot(&self, id: Uuid) -> Result<Option<ContextSnapshot>> {
        let row = sqlx::query_as::<
            _,
            (
                Uuid,
                Json<BTreeMap<String, EntityState>>,
                Json<GraphNeighborhood>,
                DateTime<Utc>,
            ),
        >(
            "SELECT id, entity_states, graph_neighborhood, timestamp FROM context_snapshots WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|(id, entity_states, graph_neighborhood, timestamp)| ContextSnapshot {
            id,
            entity_states: entity_states.0,
            graph_neighborhood: graph_neighborhood.0,
            timestamp,
        }))
    }

    async fn insert_trace(&self, trace: &DecisionTrace) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO decision_traces (id, rule_id, trigger_event_id, user_id, action_type, input_payload,
                                         output_payload, status, error_message, latency_ms, timestamp, snapshot_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(trace.id)
        .bind(trace.rule_id)
        .bind(trace.trigger_event_id)
        .bind(trace.user_id)
        .bind(&trace.action_type)
        .bind(&trace.input_payload)
        .bind(&trace.output_payload)
        .bind(trace.status.as_str())
        .bind(&trace.error_message)
        .bind(trace.latency_ms)
        .bind(trace.timestamp)
        .bind(trace.snapshot_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_trace(&self, id: Uuid) -> Result<Option<DecisionTrace>> {
        let row = sqlx::query(&format!(
            "SELECT {TRACE_COLUMNS} FROM decision_traces WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(trace_from_row).transpose()
    }

    async fn traces_since(
        &self,
        since: DateTime<Utc>,
        filter: &TraceFilter,
    ) -> Result<Vec<DecisionTrace>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRACE_COLUMNS} FROM decision_traces
             WHERE timestamp >= $1
               AND ($2::text IS NULL OR status = $2)
               AND ($3::uuid IS NULL OR user_id = $3)
               AND ($4::uuid IS NULL OR rule_id = $4)
             ORDER BY timestamp ASC
             LIMIT $5"
        ))
        .bind(since)
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.user_id)
        .bind(filter.rule_id)
        .bind(filter.limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(trace_from_row).collect()
    }
}

fn trace_from_row(row: &sqlx::postgres::PgRow) -> Result<DecisionTrace> {
    let status: String = row.try_get("status")?;
    Ok(DecisionTrace {
        id: row.try_get("id")?,
        rule_id: row.try_get("rule_id")?,
        trigger_event_id: row.try_get("trigger_event_id")?,
        user_id: row.try_get("user_id")?,
        action_type: row.try_get("action_type")?,
        input_payload: row.try_get("input_payload")?,
        output_payload: row.try_get("output_payload")?,
        status: status.parse::<TraceStatus>().map_err(TripwireError::Storage)?,
        error_message: row.try_get("error_message")?,
        latency_ms: row.try_get("latency_ms")?,
        timestamp: row.try_get("timestamp")?,
        snapshot_id: row.try_get("snapshot_id")?,
    })
}

#[async_trait]
impl EntityStore for PgStore {
    async fn entity_states(&self, ids: &[String]) -> Result<BTreeMap<String, EntityState>> {
        if ids.is_empty() {
            return Ok(BTreeMap::new());
        }
        let rows = sqlx::query_as::<_, (String, String, serde_json::Value, Option<String>, i32)>(
            "SELECT id::text, type_id, data, status, version FROM objects WHERE id::text = ANY($1)",
        )
        .bind(ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(id, entity_type, data, status, version)| {
                (
                    id,
                    EntityState {
                        entity_type,
                        data,
                        status,
                        version,
                    },
                )
            })
            .collect())
    }
}

#[async_trait]
impl ContextStore for PgStore {
    async fn insert_context_event(&self, event: &ContextEvent) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO context_events (id, source, source_id, user_id, session_id, content, timestamp)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(event.id)
        .bind(&event.source)
        .bind(&event.source_id)
        .bind(event.user_id)
        .bind(&event.session_id)
        .bind(&event.content)
        .bind(event.timestamp)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn context_events_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        user_id: Option<Uuid>,
    ) -> Result<Vec<ContextEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source, source_id, user_id, session_id, content, timestamp
            FROM context_events
            WHERE timestamp >= $1 AND timestamp <= $2
              AND ($3::uuid IS NULL OR user_id = $3)
            ORDER BY timestamp ASC
            "#,
        )
        .bind(start)
        .bind(end)
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<ContextEvent> {
                Ok(ContextEvent {
                    id: row.try_get("id")?,
                    source: row.try_get("source")?,
                    source_id: row.try_get("source_id")?,
                    user_id: row.try_get("user_id")?,
                    session_id: row.try_get("session_id")?,
                    content: row.try_get("content")?,
                    timestamp: row.try_get("timestamp")?,
                })
            })
            .collect()
    }

    async fn link_exists(&self, trace_id: Uuid, context_event_id: Uuid) -> Result<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM context_links WHERE trace_id = $1 AND context_event_id = $2)",
        )
        .bind(trace_id)
        .bind(context_event_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn insert_link(&self, link: &ContextLink) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO context_links (id, trace_id, context_event_id, relevance_score, link_type, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (trace_id, context_event_id) DO NOTHING
            "#,
        )
        .bind(link.id)
        .bind(link.trace_id)
        .bind(link.context_event_id)
        .bind(link.relevance_score)
        .bind(link.link_type.as_str())
        .bind(link.created_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn links_for_trace(&self, trace_id: Uuid) -> Result<Vec<ContextLink>> {
        let rows = sqlx::query_as::<_, (Uuid, Uuid, Uuid, f64, String, DateTime<Utc>)>(
            r#"
            SELECT id, trace_id, context_event_id, relevance_score, link_type, created_at
            FROM context_links
            WHERE trace_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(trace_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(
                |(id, trace_id, context_event_id, relevance_score, link_type, created_at)| -> Result<ContextLink> {
                    Ok(ContextLink {
                        id,
                        trace_id,
                        context_event_id,
                        relevance_score,
                        link_type: link_type
                            .parse::<LinkType>()
                            .map_err(TripwireError::Storage)?,
                        created_at,
                    })
                },
            )
            .collect()
    }
}
