//! PgTransport: durable bus stream backed by Postgres.
//!
//! `bus_messages` is the append-only log (deduplicated by `msg_id`).
//! `bus_consumers` registers durable consumers and their patterns; publishing
//! fans a `bus_deliveries` row out to every matching consumer. Consumers claim
//! visible rows with `FOR UPDATE SKIP LOCKED`, so instances sharing a durable
//! name split the work. A claim that is never acked becomes visible again
//! after `ack_wait`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::{debug, warn};

use tripwire_common::BusConfig;

use crate::error::BusError;
use crate::message::{Delivery, OutboundMessage};
use crate::subject::subject_matches;
use crate::transport::{Consumer, Transport};

/// Upper bound on the connectivity check. The pool's acquire timeout is far
/// longer than a health endpoint can wait.
const HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct PgTransport {
    pool: PgPool,
    poll_interval: Duration,
    ack_wait: Duration,
}

impl PgTransport {
    pub fn new(pool: PgPool, config: &BusConfig) -> Self {
        Self {
            pool,
            poll_interval: config.poll_interval,
            ack_wait: config.ack_wait,
        }
    }

    /// Connect a dedicated pool. Failure here is fatal for dependents.
    pub async fn connect(database_url: &str, config: &BusConfig) -> Result<Self, BusError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(|e| BusError::Connect(e.to_string()))?;
        Ok(Self::new(pool, config))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl Transport for PgTransport {
    async fn publish(&self, message: OutboundMessage) -> Result<(), BusError> {
        let subject = message.subject.clone();
        let publish_err = |e: sqlx::Error| BusError::Publish {
            subject: subject.clone(),
            reason: e.to_string(),
        };

        let mut tx = self.pool.begin().await.map_err(publish_err)?;

        let inserted = sqlx::query_as::<_, (i64,)>(
            r#"
            INSERT INTO bus_messages (msg_id, subject, headers, payload)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (msg_id) DO NOTHING
            RETURNING seq
            "#,
        )
        .bind(&message.msg_id)
        .bind(&message.subject)
        .bind(Json(&message.headers))
        .bind(&message.payload)
        .fetch_optional(&mut *tx)
        .await
        .map_err(publish_err)?;

        let Some((seq,)) = inserted else {
            debug!(subject = %message.subject, msg_id = ?message.msg_id, "Duplicate publish dropped");
            tx.commit().await.map_err(publish_err)?;
            return Ok(());
        };

        let consumers = sqlx::query_as::<_, (String, String)>("SELECT name, pattern FROM bus_consumers")
            .fetch_all(&mut *tx)
            .await
            .map_err(publish_err)?;

        for (name, pattern) in consumers {
            if !subject_matches(&pattern, &message.subject) {
                continue;
            }
            sqlx::query("INSERT INTO bus_deliveries (consumer, seq) VALUES ($1, $2)")
                .bind(&name)
                .bind(seq)
                .execute(&mut *tx)
                .await
                .map_err(publish_err)?;
        }

        tx.commit().await.map_err(publish_err)?;

        // Best-effort wakeup, a nudge rather than a delivery guarantee.
        if let Err(e) = sqlx::query("SELECT pg_notify('bus', $1)")
            .bind(&message.subject)
            .execute(&self.pool)
            .await
        {
            warn!(error = %e, seq, "PG NOTIFY failed (non-fatal)");
        }

        Ok(())
    }

    async fn open_consumer(
        &self,
        pattern: &str,
        durable: &str,
    ) -> Result<Box<dyn Consumer>, BusError> {
        sqlx::query(
            r#"
            INSERT INTO bus_consumers (name, pattern)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET pattern = EXCLUDED.pattern
            "#,
        )
        .bind(durable)
        .bind(pattern)
        .execute(&self.pool)
        .await
        .map_err(|e| BusError::Subscribe {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Box::new(PgConsumer {
            pool: self.pool.clone(),
            durable: durable.to_string(),
            poll_interval: self.poll_interval,
            ack_wait: self.ack_wait,
            closed: false,
        }))
    }

    async fn is_connected(&self) -> bool {
        if self.pool.is_closed() {
            return false;
        }
        let ping = sqlx::query("SELECT 1").execute(&self.pool);
        match tokio::time::timeout(HEALTH_TIMEOUT, ping).await {
            Ok(result) => result.is_ok(),
            Err(_) => {
                warn!(timeout_ms = HEALTH_TIMEOUT.as_millis() as u64, "Bus connectivity check timed out");
                false
            }
        }
    }
}

struct PgConsumer {
    pool: PgPool,
    durable: String,
    poll_interval: Duration,
    ack_wait: Duration,
    closed: bool,
}

impl PgConsumer {
    async fn claim(&self) -> Result<Option<Delivery>, BusError> {
        let row = sqlx::query_as::<_, (i64, i32, String, Json<BTreeMap<String, String>>, Vec<u8>)>(
            r#"
            UPDATE bus_deliveries d
            SET delivered = d.delivered + 1,
                visible_at = now() + make_interval(secs => $2)
            FROM bus_messages m
            WHERE m.seq = d.seq
              AND (d.consumer, d.seq) = (
                  SELECT consumer, seq FROM bus_deliveries
                  WHERE consumer = $1 AND acked_at IS NULL AND visible_at <= now()
                  ORDER BY seq ASC
                  LIMIT 1
                  FOR UPDATE SKIP LOCKED
              )
            RETURNING d.seq, d.delivered, m.subject, m.headers, m.payload
            "#,
        )
        .bind(&self.durable)
        .bind(self.ack_wait.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| BusError::Receive(e.to_string()))?;

        Ok(row.map(|(seq, delivered, subject, headers, payload)| Delivery {
            id: seq,
            subject,
            payload,
            headers: headers.0,
            delivered: delivered.max(0) as u32,
        }))
    }
}

#[async_trait]
impl Consumer for PgConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>, BusError> {
        loop {
            if self.closed {
                return Ok(None);
            }
            if let Some(delivery) = self.claim().await? {
                return Ok(Some(delivery));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        sqlx::query(
            "UPDATE bus_deliveries SET acked_at = now() WHERE consumer = $1 AND seq = $2",
        )
        .bind(&self.durable)
        .bind(delivery.id)
        .execute(&self.pool)
        .await
        .map_err(|e| BusError::Ack(e.to_string()))?;
        Ok(())
    }

    async fn nak(&self, delivery: &Delivery, delay: Duration) -> Result<(), BusError> {
        sqlx::query(
            r#"
            UPDATE bus_deliveries
            SET visible_at = now() + make_interval(secs => $3)
            WHERE consumer = $1 AND seq = $2 AND acked_at IS NULL
            "#,
        )
        .bind(&self.durable)
        .bind(delivery.id)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| BusError::Ack(e.to_string()))?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BusError> {
        // The durable consumer row stays; pending deliveries wait for the next
        // instance that opens it.
        self.closed = true;
        Ok(())
    }
}
