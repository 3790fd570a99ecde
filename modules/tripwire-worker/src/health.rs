//! `GET /health` for the worker process.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use sqlx::PgPool;

use tripwire_bus::EventBus;
use tripwire_trace::GraphClient;

const HEALTHY: &str = "healthy";
const UNHEALTHY: &str = "unhealthy";

/// A probe that has not answered by now counts as unhealthy.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// One dependency the worker reports on.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &'static str;

    async fn healthy(&self) -> bool;
}

pub struct BusProbe(pub Arc<EventBus>);

#[async_trait]
impl HealthProbe for BusProbe {
    fn name(&self) -> &'static str {
        "bus"
    }

    async fn healthy(&self) -> bool {
        self.0.health_check().await
    }
}

pub struct PostgresProbe(pub PgPool);

#[async_trait]
impl HealthProbe for PostgresProbe {
    fn name(&self) -> &'static str {
        "postgres"
    }

    async fn healthy(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.0).await.is_ok()
    }
}

pub struct Neo4jProbe(pub GraphClient);

#[async_trait]
impl HealthProbe for Neo4jProbe {
    fn name(&self) -> &'static str {
        "neo4j"
    }

    async fn healthy(&self) -> bool {
        self.0.ping().await
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub version: &'static str,
    pub checks: BTreeMap<&'static str, &'static str>,
}

/// Probe every dependency concurrently, each bounded by `PROBE_TIMEOUT`. Any
/// unhealthy probe degrades the whole report.
pub async fn check(probes: &[Arc<dyn HealthProbe>]) -> HealthReport {
    let results = futures::future::join_all(probes.iter().map(|p| async move {
        let healthy = match tokio::time::timeout(PROBE_TIMEOUT, p.healthy()).await {
            Ok(healthy) => healthy,
            Err(_) => {
                tracing::warn!(check = p.name(), "Health check timed out");
                false
            }
        };
        if !healthy {
            tracing::warn!(check = p.name(), "Health check failed");
        }
        (p.name(), healthy)
    }))
    .await;

    let all_healthy = results.iter().all(|(_, healthy)| *healthy);
    HealthReport {
        status: if all_healthy { "alive" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        checks: results
            .into_iter()
            .map(|(name, healthy)| (name, if healthy { HEALTHY } else { UNHEALTHY }))
            .collect(),
    }
}

#[derive(Clone)]
struct HealthState {
    probes: Arc<Vec<Arc<dyn HealthProbe>>>,
}

pub fn router(probes: Vec<Arc<dyn HealthProbe>>) -> Router {
    Router::new()
        .route("/health", get(health))
        .with_state(HealthState {
            probes: Arc::new(probes),
        })
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::debug_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        )
}

async fn health(State(state): State<HealthState>) -> Json<HealthReport> {
    Json(check(&state.probes).await)
}
