//! Rule executor: turns bus events into evaluations, action dispatches and
//! decision traces.

pub mod enrich;
pub mod executor;

pub use enrich::{CalendarEnricher, Clock, Enricher, EventEnricher, FixedClock, SystemClock};
pub use executor::{involved_entity_ids, ExecutionReport, RuleExecutor};
