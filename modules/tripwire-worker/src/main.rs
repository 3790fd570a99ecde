use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tripwire_actions::{ActionRegistry, PgSessionFactory};
use tripwire_bus::{EventBus, PgTransport, RetryPolicy};
use tripwire_common::Config;
use tripwire_engine::RuleExecutor;
use tripwire_rules::PgRuleStore;
use tripwire_trace::{
    ContextSnapshotService, CorrelationEngine, DecisionTraceService, GraphClient, Neo4jGraph,
    PgStore,
};
use tripwire_worker::health::{self, BusProbe, HealthProbe, Neo4jProbe, PostgresProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Component {
    /// Consume events and run rules.
    Executor,
    /// Link decision traces to nearby context events.
    Correlation,
    All,
}

#[derive(Parser)]
#[command(name = "tripwire-worker", about = "Tripwire rule executor and correlation worker")]
struct Cli {
    /// Workers to run. Defaults to all of them.
    #[arg(value_enum)]
    components: Vec<Component>,
}

impl Cli {
    fn runs(&self, component: Component) -> bool {
        self.components.is_empty()
            || self.components.contains(&Component::All)
            || self.components.contains(&component)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    let cli = Cli::parse();
    info!("Starting tripwire-worker");

    let config = Config::from_env()?;
    config.log_redacted();

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to Postgres")?;
    sqlx::migrate!("../../migrations").run(&pool).await?;
    info!("Migrations complete");

    let graph = GraphClient::connect(&config.neo4j_uri, &config.neo4j_user, &config.neo4j_password)
        .await
        .context("Failed to connect to Neo4j")?;

    let store = Arc::new(PgStore::new(pool.clone()));
    let snapshots = ContextSnapshotService::new(
        store.clone(),
        Arc::new(Neo4jGraph::new(graph.clone())),
        store.clone(),
    );
    let decisions = DecisionTraceService::new(store.clone(), snapshots);

    let transport = Arc::new(PgTransport::new(pool.clone(), &config.bus));
    let bus = Arc::new(EventBus::new(
        transport,
        config.namespace.clone(),
        RetryPolicy::from(&config.bus),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let executor = if cli.runs(Component::Executor) {
        let executor = Arc::new(RuleExecutor::new(
            Arc::new(PgRuleStore::new(pool.clone())),
            Arc::new(ActionRegistry::with_builtin()?),
            Arc::new(PgSessionFactory::new(pool.clone())),
            decisions,
        ));
        executor.start(&bus).await?;
        Some(executor)
    } else {
        None
    };

    let correlation = if cli.runs(Component::Correlation) {
        let engine = CorrelationEngine::new(store.clone(), store, config.correlation.clone());
        let shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move { engine.run(shutdown).await }))
    } else {
        None
    };

    let probes: Vec<Arc<dyn HealthProbe>> = vec![
        Arc::new(BusProbe(bus.clone())),
        Arc::new(PostgresProbe(pool.clone())),
        Arc::new(Neo4jProbe(graph)),
    ];
    let addr = format!("0.0.0.0:{}", config.health_port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind health endpoint on {addr}"))?;
    info!(addr = %addr, "Health endpoint listening");

    let mut health_shutdown = shutdown_rx;
    let server = tokio::spawn(async move {
        axum::serve(listener, health::router(probes))
            .with_graceful_shutdown(async move {
                let _ = health_shutdown.changed().await;
            })
            .await
    });

    shutdown_signal().await;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);

    if let Some(executor) = &executor {
        executor.stop(&bus).await;
    }
    bus.shutdown().await;

    if let Some(handle) = correlation {
        if let Err(e) = handle.await {
            warn!(error = %e, "Correlation worker ended abnormally");
        }
    }
    match server.await {
        Ok(Err(e)) => warn!(error = %e, "Health endpoint failed"),
        Err(e) => warn!(error = %e, "Health endpoint task ended abnormally"),
        Ok(Ok(())) => {}
    }

    pool.close().await;
    info!("Worker stopped");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
