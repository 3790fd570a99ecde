use std::time::Duration;

use anyhow::{Context, Result};

/// Delivery tuning for the event bus.
#[derive(Debug, Clone)]
pub struct BusConfig {
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub max_backoff: Duration,
    pub poll_interval: Duration,
    pub ack_wait: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff_base: Duration::from_millis(500),
            max_backoff: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
            ack_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorrelationConfig {
    pub interval: Duration,
    pub lookback: chrono::Duration,
    pub window: chrono::Duration,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            lookback: chrono::Duration::hours(1),
            window: chrono::Duration::minutes(5),
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // Postgres
    pub database_url: String,

    // Neo4j
    pub neo4j_uri: String,
    pub neo4j_user: String,
    pub neo4j_password: String,

    /// Subject prefix, e.g. `tripwire` in `tripwire.object.created`.
    pub namespace: String,

    pub bus: BusConfig,
    pub correlation: CorrelationConfig,

    pub health_port: u16,
}

impl Config {
    /// Load configuration from `.env` (if present) and the process environment.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key).with_context(|| format!("{key} environment variable is required"))
        };
        let bus_defaults = BusConfig::default();
        let correlation_defaults = CorrelationConfig::default();

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            neo4j_uri: required("NEO4J_URI")?,
            neo4j_user: required("NEO4J_USER")?,
            neo4j_password: required("NEO4J_PASSWORD")?,
            namespace: lookup("TRIPWIRE_NAMESPACE").unwrap_or_else(|| "tripwire".to_string()),
            bus: BusConfig {
                max_retries: parse_or(&lookup, "BUS_MAX_RETRIES", bus_defaults.max_retries)?,
                backoff_base: Duration::from_millis(parse_or(&lookup, "BUS_BACKOFF_BASE_MS", 500)?),
                max_backoff: Duration::from_millis(parse_or(&lookup, "BUS_MAX_BACKOFF_MS", 60_000)?),
                poll_interval: Duration::from_millis(parse_or(
                    &lookup,
                    "BUS_POLL_INTERVAL_MS",
                    100,
                )?),
                ack_wait: Duration::from_secs(parse_or(&lookup, "BUS_ACK_WAIT_SECS", 30)?),
            },
            correlation: CorrelationConfig {
                interval: Duration::from_secs(parse_or(
                    &lookup,
                    "CORRELATION_INTERVAL_SECS",
                    correlation_defaults.interval.as_secs(),
                )?),
                lookback: chrono::Duration::minutes(parse_or(
                    &lookup,
                    "CORRELATION_LOOKBACK_MINUTES",
                    60,
                )?),
                window: chrono::Duration::minutes(parse_or(
                    &lookup,
                    "CORRELATION_WINDOW_MINUTES",
                    5,
                )?),
            },
            health_port: parse_or(&lookup, "HEALTH_PORT", 8081)?,
        })
    }

    /// Log the loaded configuration with secrets redacted.
    pub fn log_redacted(&self) {
        fn preview(val: &str) -> String {
            let head: String = val.chars().take(5).collect();
            format!("{head}...({} chars)", val.len())
        }

        tracing::info!("Config loaded:");
        tracing::info!("  DATABASE_URL: {}", preview(&self.database_url));
        tracing::info!("  NEO4J_URI: {}", self.neo4j_uri);
        tracing::info!("  NEO4J_USER: {}", self.neo4j_user);
        tracing::info!("  NEO4J_PASSWORD: {}", preview(&self.neo4j_password));
        tracing::info!("  TRIPWIRE_NAMESPACE: {}", self.namespace);
        tracing::info!(
            max_retries = self.bus.max_retries,
            backoff_base_ms = self.bus.backoff_base.as_millis() as u64,
            "  bus"
        );
        tracing::info!(
            interval_secs = self.correlation.interval.as_secs(),
            window_minutes = self.correlation.window.num_minutes(),
            "  correlation"
        );
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} is invalid ({raw}): {e}")),
        None => Ok(default),
    }
}
