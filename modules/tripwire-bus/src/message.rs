use std::collections::BTreeMap;

use tripwire_common::Event;

use crate::error::BusError;
use crate::subject::dlq_subject;

pub const HEADER_MSG_ID: &str = "msg-id";
pub const HEADER_EVENT_TYPE: &str = "event-type";
pub const HEADER_ENTITY_TYPE: &str = "entity-type";
pub const HEADER_ORIGINAL_SUBJECT: &str = "x-original-subject";
pub const HEADER_ERROR: &str = "x-error";
pub const HEADER_ATTEMPTS: &str = "x-attempts";

/// A message handed to the transport for publishing.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    /// Deduplication id. The transport drops a second publish with the same id.
    pub msg_id: Option<String>,
}

impl OutboundMessage {
    /// Serialize an event onto `<namespace>.<event_type>`.
    pub fn from_event(event: &Event, namespace: &str) -> Result<Self, BusError> {
        let payload = serde_json::to_vec(event)?;
        let msg_id = event.event_id.to_string();

        let mut headers = BTreeMap::new();
        headers.insert(HEADER_MSG_ID.to_string(), msg_id.clone());
        headers.insert(HEADER_EVENT_TYPE.to_string(), event.event_type.clone());
        headers.insert(HEADER_ENTITY_TYPE.to_string(), event.entity_type.clone());

        Ok(Self {
            subject: event.subject(namespace),
            payload,
            headers,
            msg_id: Some(msg_id),
        })
    }

    /// Quarantine copy of a delivery: original payload unchanged, error and
    /// delivered-count recorded in headers.
    pub fn dead_letter(delivery: &Delivery, error: &str) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert(HEADER_ORIGINAL_SUBJECT.to_string(), delivery.subject.clone());
        headers.insert(HEADER_ERROR.to_string(), error.to_string());
        headers.insert(HEADER_ATTEMPTS.to_string(), delivery.delivered.to_string());

        Self {
            subject: dlq_subject(&delivery.subject),
            payload: delivery.payload.clone(),
            headers,
            msg_id: None,
        }
    }
}

/// One delivery attempt of a message to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Transport-assigned id used to ack/nak this message.
    pub id: i64,
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    /// Number of times this message has been delivered, including this one.
    pub delivered: u32,
}

impl Delivery {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    pub fn decode(&self) -> Result<Event, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}
