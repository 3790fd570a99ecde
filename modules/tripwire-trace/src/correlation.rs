//! Links recent decision traces to ambient context events that happened close
//! to them in time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use tripwire_common::error::Result;
use tripwire_common::{ContextLink, CorrelationConfig, DecisionTrace};

use crate::store::{ContextStore, TraceFilter, TraceStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorrelationStats {
    pub traces_scanned: usize,
    pub links_created: usize,
    pub failures: usize,
}

pub struct CorrelationEngine {
    traces: Arc<dyn TraceStore>,
    context: Arc<dyn ContextStore>,
    config: CorrelationConfig,
}

impl CorrelationEngine {
    pub fn new(
        traces: Arc<dyn TraceStore>,
        context: Arc<dyn ContextStore>,
        config: CorrelationConfig,
    ) -> Self {
        Self {
            traces,
            context,
            config,
        }
    }

    /// One pass over traces from the lookback window. Safe to repeat: links
    /// that already exist are skipped.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<CorrelationStats> {
        let since = now - self.config.lookback;
        let traces = self.traces.traces_since(since, &TraceFilter::default()).await?;

        let mut stats = CorrelationStats {
            traces_scanned: traces.len(),
            ..Default::default()
        };

        for trace in &traces {
            match self.correlate(trace).await {
                Ok(0) => {}
                Ok(created) => {
                    info!(trace_id = %trace.id, links = created, "Created context links for trace");
                    stats.links_created += created;
                }
                Err(e) => {
                    warn!(trace_id = %trace.id, error = %e, "Failed to correlate trace");
                    stats.failures += 1;
                }
            }
        }

        debug!(
            traces = stats.traces_scanned,
            links = stats.links_created,
            failures = stats.failures,
            "Correlation pass complete"
        );
        Ok(stats)
    }

    async fn correlate(&self, trace: &DecisionTrace) -> Result<usize> {
        let start = trace.timestamp - self.config.window;
        let end = trace.timestamp + self.config.window;
        let events = self
            .context
            .context_events_between(start, end, trace.user_id)
            .await?;

        let mut created = 0;
        for event in events {
            if self.context.link_exists(trace.id, event.id).await? {
                continue;
            }
            if self
                .context
                .insert_link(&ContextLink::temporal(trace.id, event.id))
                .await?
            {
                created += 1;
            }
        }
        Ok(created)
    }

    /// Run a pass every `interval` until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            "Starting correlation worker"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.run_once(Utc::now()).await {
                warn!(error = %e, "Correlation pass failed");
            }
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }

        info!("Correlation worker stopped");
    }
}
