use thiserror::Error;

/// Persistence, graph and configuration failures shared by every crate.
#[derive(Error, Debug)]
pub enum TripwireError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Graph error: {0}")]
    Graph(#[from] neo4rs::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, TripwireError>;
