//! Request-scoped persistence sessions.
//!
//! The executor opens one session per action dispatch. Writes made through it
//! become visible only on `commit`; dropping an uncommitted session discards
//! them.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tokio::sync::Mutex as AsyncMutex;

use tripwire_common::Notification;

use crate::action::ActionError;

#[async_trait]
pub trait Session: Send + Sync {
    async fn insert_notification(&self, notification: &Notification) -> Result<(), ActionError>;

    async fn commit(&self) -> Result<(), ActionError>;

    async fn rollback(&self) -> Result<(), ActionError>;
}

#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Session>, ActionError>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PgSessionFactory {
    pool: PgPool,
}

impl PgSessionFactory {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SessionFactory for PgSessionFactory {
    async fn begin(&self) -> Result<Box<dyn Session>, ActionError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgSession {
            tx: AsyncMutex::new(Some(tx)),
        }))
    }
}

/// Wraps one transaction. Dropped without commit, sqlx rolls it back.
struct PgSession {
    tx: AsyncMutex<Option<Transaction<'static, Postgres>>>,
}

fn closed() -> ActionError {
    ActionError::Persistence("session already closed".into())
}

#[async_trait]
impl Session for PgSession {
    async fn insert_notification(&self, n: &Notification) -> Result<(), ActionError> {
        let mut guard = self.tx.lock().await;
        let tx = guard.as_mut().ok_or_else(closed)?;
        sqlx::query(
            r#"
            INSERT INTO notifications (id, tenant_id, rule_id, rule_name, event_id, title, message, status, data, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(n.id)
        .bind(n.tenant_id)
        .bind(n.rule_id)
        .bind(&n.rule_name)
        .bind(n.event_id)
        .bind(&n.title)
        .bind(&n.message)
        .bind(&n.status)
        .bind(&n.data)
        .bind(n.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    async fn commit(&self) -> Result<(), ActionError> {
        let tx = self.tx.lock().await.take().ok_or_else(closed)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<(), ActionError> {
        if let Some(tx) = self.tx.lock().await.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// Buffers writes per session and publishes them to a shared list on commit.
#[derive(Clone, Default)]
pub struct MemorySessionFactory {
    committed: Arc<Mutex<Vec<Notification>>>,
}

impl MemorySessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Notifications from committed sessions, in commit order.
    pub fn notifications(&self) -> Vec<Notification> {
        self.committed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl SessionFactory for MemorySessionFactory {
    async fn begin(&self) -> Result<Box<dyn Session>, ActionError> {
        Ok(Box::new(MemorySession {
            pending: Mutex::new(Some(Vec::new())),
            committed: self.committed.clone(),
        }))
    }
}

struct MemorySession {
    pending: Mutex<Option<Vec<Notification>>>,
    committed: Arc<Mutex<Vec<Notification>>>,
}

#[async_trait]
impl Session for MemorySession {
    async fn insert_notification(&self, notification: &Notification) -> Result<(), ActionError> {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        pending
            .as_mut()
            .ok_or_else(closed)?
            .push(notification.clone());
        Ok(())
    }

    async fn commit(&self) -> Result<(), ActionError> {
        let writes = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(closed)?;
        self.committed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(writes);
        Ok(())
    }

    async fn rollback(&self) -> Result<(), ActionError> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).take();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use uuid::Uuid;

    fn notification() -> Notification {
        Notification {
            id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            rule_id: None,
            rule_name: "r".into(),
            event_id: None,
            title: "t".into(),
            message: "m".into(),
            status: "unread".into(),
            data: json!({}),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn writes_are_visible_only_after_commit() {
        let factory = MemorySessionFactory::new();
        let session = factory.begin().await.unwrap();
        session.insert_notification(&notification()).await.unwrap();
        assert!(factory.notifications().is_empty());

        session.commit().await.unwrap();
        assert_eq!(factory.notifications().len(), 1);
        assert!(session.insert_notification(&notification()).await.is_err());
    }

    #[tokio::test]
    async fn dropped_session_discards_writes() {
        let factory = MemorySessionFactory::new();
        {
            let session = factory.begin().await.unwrap();
            session.insert_notification(&notification()).await.unwrap();
        }
        let session = factory.begin().await.unwrap();
        session.insert_notification(&notification()).await.unwrap();
        session.rollback().await.unwrap();

        assert!(factory.notifications().is_empty());
    }
}
