//! Durable publish/subscribe transport with at-least-once delivery.
//!
//! Handlers that fail are redelivered with exponential backoff up to a bound,
//! then the message is quarantined on `dlq.<subject>`. No knowledge of rules.

pub mod bus;
pub mod error;
pub mod memory;
pub mod message;
pub mod postgres;
pub mod retry;
pub mod subject;
pub mod transport;

pub use bus::{EventBus, EventHandler, SubscriptionHandle};
pub use error::BusError;
pub use memory::{AckRecord, MemoryTransport, NakRecord};
pub use message::{Delivery, OutboundMessage};
pub use postgres::PgTransport;
pub use retry::{Disposition, RetryPolicy};
pub use subject::{dlq_subject, subject_matches};
pub use transport::{Consumer, Transport};
