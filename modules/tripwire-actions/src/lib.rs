//! Rule actions: the `Action` contract, the registry that resolves
//! `action_config.type`, message templating and request-scoped sessions.

pub mod action;
pub mod builtin;
pub mod registry;
pub mod session;
pub mod template;

pub use action::{Action, ActionContext, ActionError};
pub use builtin::{InAppAction, LogAction, SlackAction};
pub use registry::ActionRegistry;
pub use session::{MemorySessionFactory, PgSessionFactory, Session, SessionFactory};
