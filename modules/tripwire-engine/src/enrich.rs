//! Context enrichment. Enrichers add derived subtrees to the evaluation
//! context next to the event payload; they never replace payload keys.

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde_json::json;

use tripwire_common::{Event, JsonMap};

pub trait Enricher: Send + Sync {
    /// Key this enricher owns in the evaluation context.
    fn key(&self) -> &'static str;

    fn value(&self, event: &Event) -> serde_json::Value;

    fn enrich(&self, event: &Event, context: &mut JsonMap) {
        if context.contains_key(self.key()) {
            tracing::debug!(key = self.key(), "Payload already defines enrichment key, keeping payload value");
            return;
        }
        context.insert(self.key().to_string(), self.value(event));
    }
}

/// Adds `event.{type, entity_type, entity_id, tenant_id, user_id, changed_fields}`.
pub struct EventEnricher;

impl Enricher for EventEnricher {
    fn key(&self) -> &'static str {
        "event"
    }

    fn value(&self, event: &Event) -> serde_json::Value {
        json!({
            "type": event.event_type,
            "entity_type": event.entity_type,
            "entity_id": event.entity_id,
            "tenant_id": event.tenant_id,
            "user_id": event.user_id,
            "changed_fields": event.changed_fields(),
        })
    }
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Adds `now.{timestamp, day_of_week, hour, is_weekend}` (UTC).
pub struct CalendarEnricher {
    clock: Box<dyn Clock>,
}

impl CalendarEnricher {
    pub fn new(clock: impl Clock + 'static) -> Self {
        Self {
            clock: Box::new(clock),
        }
    }

    pub fn system() -> Self {
        Self::new(SystemClock)
    }
}

impl Enricher for CalendarEnricher {
    fn key(&self) -> &'static str {
        "now"
    }

    fn value(&self, _event: &Event) -> serde_json::Value {
        let now = self.clock.now();
        let weekday = now.weekday();
        json!({
            "timestamp": now.to_rfc3339(),
            "day_of_week": day_name(weekday),
            "hour": now.hour(),
            "is_weekend": matches!(weekday, Weekday::Sat | Weekday::Sun),
        })
    }
}

fn day_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "monday",
        Weekday::Tue => "tuesday",
        Weekday::Wed => "wednesday",
        Weekday::Thu => "thursday",
        Weekday::Fri => "friday",
        Weekday::Sat => "saturday",
        Weekday::Sun => "sunday",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn event() -> Event {
        Event::new("object.updated", "deal", Uuid::new_v4(), Uuid::new_v4())
            .with_payload(json!({"status": "active"}))
            .with_metadata(json!({"changed_fields": ["status", "amount"]}))
    }

    #[test]
    fn event_enricher_exposes_envelope() {
        let event = event();
        let mut context = event.payload.clone();
        EventEnricher.enrich(&event, &mut context);

        assert_eq!(context["event"]["type"], "object.updated");
        assert_eq!(context["event"]["entity_type"], "deal");
        assert_eq!(context["event"]["changed_fields"], json!(["status", "amount"]));
        assert_eq!(context["status"], "active");
    }

    #[test]
    fn calendar_enricher_uses_injected_clock() {
        // 2026-03-07 is a Saturday.
        let at = Utc.with_ymd_and_hms(2026, 3, 7, 14, 30, 0).unwrap();
        let mut context = JsonMap::new();
        CalendarEnricher::new(FixedClock(at)).enrich(&event(), &mut context);

        assert_eq!(context["now"]["day_of_week"], "saturday");
        assert_eq!(context["now"]["hour"], 14);
        assert_eq!(context["now"]["is_weekend"], true);
        assert_eq!(context["now"]["timestamp"], at.to_rfc3339());
    }

    #[test]
    fn payload_keys_are_not_overwritten() {
        let event = event().with_payload(json!({"event": "keep me"}));
        let mut context = event.payload.clone();
        EventEnricher.enrich(&event, &mut context);
        assert_eq!(context["event"], "keep me");
    }
}
