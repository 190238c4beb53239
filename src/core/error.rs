use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Unknown permission: {0}")]
    UnknownPermission(String),

    #[error("Malformed permission payload: {0}")]
    MalformedPayload(String),

    #[error("Failed to read persisted permissions: {0}")]
    PersistenceRead(String),

    #[error("Failed to persist permissions: {0}")]
    PersistenceWrite(String),

    #[error("Invalid permission schema: {0}")]
    Schema(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<crate::config::ConfigError> for StoreError {
    fn from(err: crate::config::ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}
