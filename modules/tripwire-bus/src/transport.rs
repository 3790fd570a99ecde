//! Transport seam. The bus owns retry/DLQ policy; the transport owns storage,
//! delivery counting and redelivery timing.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::BusError;
use crate::message::{Delivery, OutboundMessage};

/// Implemented by `PgTransport` (durable) and `MemoryTransport` (tests).
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn publish(&self, message: OutboundMessage) -> Result<(), BusError>;

    /// Open (or resume) a durable consumer for `pattern`. Consumers sharing a
    /// `durable` name share one delivery stream.
    async fn open_consumer(
        &self,
        pattern: &str,
        durable: &str,
    ) -> Result<Box<dyn Consumer>, BusError>;

    /// Non-blocking connectivity probe.
    async fn is_connected(&self) -> bool;
}

/// A single subscription's delivery stream.
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Wait for the next delivery. `None` once the consumer is closed.
    async fn next(&mut self) -> Result<Option<Delivery>, BusError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BusError>;

    /// Negatively acknowledge; redeliver no sooner than `delay`.
    async fn nak(&self, delivery: &Delivery, delay: Duration) -> Result<(), BusError>;

    async fn close(&mut self) -> Result<(), BusError>;
}
