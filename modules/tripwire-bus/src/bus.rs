//! EventBus: publish events, run one sequential consumer loop per subscription.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use tripwire_common::Event;

use crate::error::BusError;
use crate::message::{Delivery, OutboundMessage};
use crate::retry::{Disposition, RetryPolicy};
use crate::subject::validate_pattern;
use crate::transport::{Consumer, Transport};

/// Redelivery delay used when the dead-letter publish itself fails.
const DLQ_FAILURE_DELAY: Duration = Duration::from_secs(60);

/// Backoff after the transport fails to hand out a delivery.
const RECEIVE_ERROR_DELAY: Duration = Duration::from_secs(1);

/// Receives decoded events. Returning an error triggers redelivery.
///
/// Handlers must tolerate seeing the same event more than once.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, event: Event) -> anyhow::Result<()>;
}

#[async_trait]
impl<H: EventHandler + ?Sized> EventHandler for Arc<H> {
    async fn handle(&self, event: Event) -> anyhow::Result<()> {
        (**self).handle(event).await
    }
}

/// Returned by `subscribe`. Pass its pattern to `unsubscribe` to stop it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    pattern: String,
    durable: String,
}

impl SubscriptionHandle {
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn durable(&self) -> &str {
        &self.durable
    }
}

struct Subscription {
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Publish/subscribe front for a `Transport`, applying the retry/DLQ policy.
pub struct EventBus {
    transport: Arc<dyn Transport>,
    namespace: String,
    policy: RetryPolicy,
    subscriptions: Mutex<HashMap<String, Subscription>>,
}

impl EventBus {
    pub fn new(transport: Arc<dyn Transport>, namespace: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            transport,
            namespace: namespace.into(),
            policy,
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Publish an event on `<namespace>.<event_type>`.
    pub async fn publish(&self, event: &Event) -> Result<(), BusError> {
        let message = OutboundMessage::from_event(event, &self.namespace)?;
        let subject = message.subject.clone();
        self.transport.publish(message).await?;
        debug!(event_id = %event.event_id, subject = %subject, "Event published");
        Ok(())
    }

    /// Subscribe with a durable consumer named after the pattern.
    pub async fn subscribe<H>(&self, pattern: &str, handler: H) -> Result<SubscriptionHandle, BusError>
    where
        H: EventHandler,
    {
        let durable = durable_name(pattern);
        self.subscribe_durable(pattern, &durable, handler).await
    }

    /// Subscribe under an explicit consumer group. Instances sharing a group
    /// split the stream between them.
    pub async fn subscribe_durable<H>(
        &self,
        pattern: &str,
        durable: &str,
        handler: H,
    ) -> Result<SubscriptionHandle, BusError>
    where
        H: EventHandler,
    {
        validate_pattern(pattern)?;

        let mut subscriptions = self.subscriptions.lock().await;
        if subscriptions.contains_key(pattern) {
            return Err(BusError::AlreadySubscribed(pattern.to_string()));
        }

        let consumer = self.transport.open_consumer(pattern, durable).await?;
        let (stop_tx, stop_rx) = watch::channel(false);

        let worker = ConsumerLoop {
            pattern: pattern.to_string(),
            consumer,
            transport: self.transport.clone(),
            handler: Arc::new(handler),
            policy: self.policy.clone(),
        };
        let task = tokio::spawn(worker.run(stop_rx));

        subscriptions.insert(
            pattern.to_string(),
            Subscription {
                stop: stop_tx,
                task,
            },
        );

        info!(pattern, durable, "Subscribed to event pattern");
        Ok(SubscriptionHandle {
            pattern: pattern.to_string(),
            durable: durable.to_string(),
        })
    }

    /// Stop a subscription. The in-flight message (if any) is finished and
    /// acknowledged before the consumer closes. Unknown patterns are a no-op.
    pub async fn unsubscribe(&self, pattern: &str) {
        let subscription = self.subscriptions.lock().await.remove(pattern);
        if let Some(subscription) = subscription {
            stop_subscription(pattern, subscription).await;
            info!(pattern, "Unsubscribed from pattern");
        }
    }

    /// Stop every subscription, letting in-flight handlers complete.
    pub async fn shutdown(&self) {
        let drained: Vec<(String, Subscription)> =
            self.subscriptions.lock().await.drain().collect();
        for (pattern, subscription) in drained {
            stop_subscription(&pattern, subscription).await;
        }
        info!("Event bus shut down");
    }

    pub async fn health_check(&self) -> bool {
        self.transport.is_connected().await
    }

    pub async fn active_patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self.subscriptions.lock().await.keys().cloned().collect();
        patterns.sort();
        patterns
    }
}

async fn stop_subscription(pattern: &str, subscription: Subscription) {
    let _ = subscription.stop.send(true);
    if let Err(e) = subscription.task.await {
        error!(pattern, error = %e, "Consumer task ended abnormally");
    }
}

fn durable_name(pattern: &str) -> String {
    pattern
        .chars()
        .map(|c| match c {
            '*' => "star".to_string(),
            '>' => "all".to_string(),
            '.' => "-".to_string(),
            other => other.to_string(),
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Consumer loop
// ---------------------------------------------------------------------------

struct ConsumerLoop {
    pattern: String,
    consumer: Box<dyn Consumer>,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn EventHandler>,
    policy: RetryPolicy,
}

impl ConsumerLoop {
    async fn run(mut self, mut stop: watch::Receiver<bool>) {
        info!(pattern = %self.pattern, "Starting message processor");

        loop {
            if *stop.borrow() {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = stop.changed() => break,
                next = self.consumer.next() => next,
            };

            match next {
                Ok(Some(delivery)) => self.process(delivery).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(pattern = %self.pattern, error = %e, "Failed to receive message");
                    tokio::select! {
                        _ = stop.changed() => break,
                        _ = tokio::time::sleep(RECEIVE_ERROR_DELAY) => {}
                    }
                }
            }
        }

        if let Err(e) = self.consumer.close().await {
            warn!(pattern = %self.pattern, error = %e, "Error closing consumer");
        }
        info!(pattern = %self.pattern, "Message processor stopped");
    }

    async fn process(&self, delivery: Delivery) {
        let outcome = match delivery.decode() {
            Ok(event) => {
                let event_id = event.event_id;
                self.handler
                    .handle(event)
                    .await
                    .map(|_| event_id)
                    .map_err(|e| format!("{e:#}"))
            }
            Err(e) => Err(format!("failed to decode event: {e}")),
        };

        match outcome {
            Ok(event_id) => {
                if let Err(e) = self.consumer.ack(&delivery).await {
                    warn!(subject = %delivery.subject, error = %e, "Failed to ack message");
                }
                debug!(
                    event_id = %event_id,
                    pattern = %self.pattern,
                    subject = %delivery.subject,
                    "Event received and handled"
                );
            }
            Err(error) => self.handle_failure(&delivery, &error).await,
        }
    }

    async fn handle_failure(&self, delivery: &Delivery, error: &str) {
        match self.policy.disposition(delivery.delivered) {
            Disposition::Retry(delay) => {
                warn!(
                    subject = %delivery.subject,
                    attempt = delivery.delivered,
                    delay_ms = delay.as_millis() as u64,
                    error,
                    "Error handling event, retrying"
                );
                if let Err(e) = self.consumer.nak(delivery, delay).await {
                    warn!(subject = %delivery.subject, error = %e, "Failed to nak message");
                }
            }
            Disposition::DeadLetter => {
                error!(
                    subject = %delivery.subject,
                    attempts = delivery.delivered,
                    error,
                    "Max retries exceeded, moving to DLQ"
                );
                let quarantined = OutboundMessage::dead_letter(delivery, error);
                match self.transport.publish(quarantined).await {
                    Ok(()) => {
                        if let Err(e) = self.consumer.ack(delivery).await {
                            warn!(subject = %delivery.subject, error = %e, "Failed to ack dead-lettered message");
                        }
                    }
                    Err(e) => {
                        error!(subject = %delivery.subject, error = %e, "Failed to publish to DLQ");
                        if let Err(e) = self.consumer.nak(delivery, DLQ_FAILURE_DELAY).await {
                            warn!(subject = %delivery.subject, error = %e, "Failed to nak message");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn durable_names_are_subject_safe() {
        assert_eq!(durable_name("tripwire.object.*"), "tripwire-object-star");
        assert_eq!(durable_name("tripwire.>"), "tripwire-all");
    }
}
