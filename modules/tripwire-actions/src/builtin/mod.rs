mod in_app;
mod log;
mod slack;

pub use in_app::InAppAction;
pub use log::LogAction;
pub use slack::SlackAction;
