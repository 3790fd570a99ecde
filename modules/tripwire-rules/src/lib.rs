//! Rule definitions: condition evaluation and rule persistence.

pub mod condition;
pub mod postgres;
pub mod store;

pub use condition::{evaluate, try_evaluate, validate, ConditionError};
pub use postgres::PgRuleStore;
pub use store::{validate_new_rule, MemoryRuleStore, RuleStore};
