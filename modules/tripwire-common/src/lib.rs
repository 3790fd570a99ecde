pub mod config;
pub mod error;
pub mod types;

pub use config::{BusConfig, Config, CorrelationConfig};
pub use error::TripwireError;
pub use types::*;
