//! In-process transport for tests. Same redelivery semantics as the durable
//! transport (delivery counting, delayed NAK, dedup by message id), driven by
//! tokio timers so tests can run with paused time. Records every publish,
//! ack and nak for assertions.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::BusError;
use crate::message::{Delivery, OutboundMessage};
use crate::subject::subject_matches;
use crate::transport::{Consumer, Transport};

#[derive(Debug, Clone, PartialEq)]
pub struct NakRecord {
    pub subject: String,
    pub delivered: u32,
    pub delay: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AckRecord {
    pub subject: String,
    pub delivered: u32,
}

struct Pending {
    id: i64,
    subject: String,
    payload: Vec<u8>,
    headers: std::collections::BTreeMap<String, String>,
    delivered: u32,
    visible_at: Instant,
}

impl Pending {
    fn to_delivery(&self) -> Delivery {
        Delivery {
            id: self.id,
            subject: self.subject.clone(),
            payload: self.payload.clone(),
            headers: self.headers.clone(),
            delivered: self.delivered,
        }
    }
}

struct Group {
    pattern: String,
    queue: Vec<Pending>,
    in_flight: HashMap<i64, Pending>,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct State {
    next_id: i64,
    groups: HashMap<String, Group>,
    seen_msg_ids: HashSet<String>,
    published: Vec<OutboundMessage>,
    acks: Vec<AckRecord>,
    naks: Vec<NakRecord>,
}

struct Inner {
    state: Mutex<State>,
    connected: AtomicBool,
    fail_publish_to: Mutex<Option<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Thread-safe in-memory transport. Clones share state.
#[derive(Clone)]
pub struct MemoryTransport {
    inner: Arc<Inner>,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                connected: AtomicBool::new(true),
                fail_publish_to: Mutex::new(None),
            }),
        }
    }

    /// Every message accepted by `publish` (after dedup), in order.
    pub fn published(&self) -> Vec<OutboundMessage> {
        lock(&self.inner.state).published.clone()
    }

    pub fn published_to(&self, subject: &str) -> Vec<OutboundMessage> {
        self.published()
            .into_iter()
            .filter(|m| m.subject == subject)
            .collect()
    }

    pub fn acks(&self) -> Vec<AckRecord> {
        lock(&self.inner.state).acks.clone()
    }

    pub fn naks(&self) -> Vec<NakRecord> {
        lock(&self.inner.state).naks.clone()
    }

    /// Messages waiting or in flight for a durable consumer.
    pub fn outstanding(&self, durable: &str) -> usize {
        let state = lock(&self.inner.state);
        state
            .groups
            .get(durable)
            .map(|g| g.queue.len() + g.in_flight.len())
            .unwrap_or(0)
    }

    pub fn set_connected(&self, connected: bool) {
        self.inner.connected.store(connected, Ordering::SeqCst);
    }

    /// Make publishes to subjects starting with `prefix` fail.
    pub fn fail_publishes_to(&self, prefix: Option<&str>) {
        *lock(&self.inner.fail_publish_to) = prefix.map(str::to_string);
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn publish(&self, message: OutboundMessage) -> Result<(), BusError> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(BusError::Publish {
                subject: message.subject,
                reason: "not connected".into(),
            });
        }
        if let Some(prefix) = lock(&self.inner.fail_publish_to).as_deref() {
            if message.subject.starts_with(prefix) {
                return Err(BusError::Publish {
                    subject: message.subject,
                    reason: "injected failure".into(),
                });
            }
        }

        let mut state = lock(&self.inner.state);
        if let Some(msg_id) = &message.msg_id {
            if !state.seen_msg_ids.insert(msg_id.clone()) {
                return Ok(());
            }
        }

        state.next_id += 1;
        let id = state.next_id;
        let now = Instant::now();
        for group in state.groups.values_mut() {
            if subject_matches(&group.pattern, &message.subject) {
                group.queue.push(Pending {
                    id,
                    subject: message.subject.clone(),
                    payload: message.payload.clone(),
                    headers: message.headers.clone(),
                    delivered: 0,
                    visible_at: now,
                });
                group.notify.notify_one();
            }
        }
        state.published.push(message);
        Ok(())
    }

    async fn open_consumer(
        &self,
        pattern: &str,
        durable: &str,
    ) -> Result<Box<dyn Consumer>, BusError> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(BusError::Subscribe {
                pattern: pattern.to_string(),
                reason: "not connected".into(),
            });
        }

        let mut state = lock(&self.inner.state);
        let group = state
            .groups
            .entry(durable.to_string())
            .or_insert_with(|| Group {
                pattern: pattern.to_string(),
                queue: Vec::new(),
                in_flight: HashMap::new(),
                notify: Arc::new(Notify::new()),
            });
        group.pattern = pattern.to_string();
        let notify = group.notify.clone();

        Ok(Box::new(MemoryConsumer {
            inner: self.inner.clone(),
            durable: durable.to_string(),
            notify,
            closed: false,
        }))
    }

    async fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }
}

struct MemoryConsumer {
    inner: Arc<Inner>,
    durable: String,
    notify: Arc<Notify>,
    closed: bool,
}

impl MemoryConsumer {
    /// Pop the first visible message, or report when the next one becomes visible.
    fn poll(&self) -> Result<Option<Delivery>, Option<Instant>> {
        let mut state = lock(&self.inner.state);
        let Some(group) = state.groups.get_mut(&self.durable) else {
            return Err(None);
        };

        let now = Instant::now();
        if let Some(pos) = group.queue.iter().position(|p| p.visible_at <= now) {
            let mut pending = group.queue.remove(pos);
            pending.delivered += 1;
            let delivery = pending.to_delivery();
            group.in_flight.insert(pending.id, pending);
            return Ok(Some(delivery));
        }

        Err(group.queue.iter().map(|p| p.visible_at).min())
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Option<Delivery>, BusError> {
        loop {
            if self.closed {
                return Ok(None);
            }
            match self.poll() {
                Ok(delivery) => return Ok(delivery),
                Err(Some(at)) => {
                    tokio::select! {
                        _ = self.notify.notified() => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                Err(None) => self.notify.notified().await,
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError> {
        let mut state = lock(&self.inner.state);
        let group = state
            .groups
            .get_mut(&self.durable)
            .ok_or(BusError::Closed)?;
        group
            .in_flight
            .remove(&delivery.id)
            .ok_or_else(|| BusError::Ack(format!("delivery {} not in flight", delivery.id)))?;
        state.acks.push(AckRecord {
            subject: delivery.subject.clone(),
            delivered: delivery.delivered,
        });
        Ok(())
    }

    async fn nak(&self, delivery: &Delivery, delay: Duration) -> Result<(), BusError> {
        let mut state = lock(&self.inner.state);
        let group = state
            .groups
            .get_mut(&self.durable)
            .ok_or(BusError::Closed)?;
        let mut pending = group
            .in_flight
            .remove(&delivery.id)
            .ok_or_else(|| BusError::Ack(format!("delivery {} not in flight", delivery.id)))?;
        pending.visible_at = Instant::now() + delay;
        group.queue.push(pending);
        group.notify.notify_one();
        state.naks.push(NakRecord {
            subject: delivery.subject.clone(),
            delivered: delivery.delivered,
            delay,
        });
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BusError> {
        self.closed = true;
        // Anything still in flight becomes visible again for the next consumer.
        let mut state = lock(&self.inner.state);
        if let Some(group) = state.groups.get_mut(&self.durable) {
            let in_flight: Vec<Pending> = group.in_flight.drain().map(|(_, p)| p).collect();
            group.queue.extend(in_flight);
        }
        Ok(())
    }
}
