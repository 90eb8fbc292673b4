use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("I/O error: {0}")]
    StdIoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(#[from] anyhow::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("Operation already exists: {0}")]
    DuplicateId(String),

    #[error("Operation not found for ID: {0}")]
    OperationNotFound(String),

    #[error("Invalid transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },

    #[error("Failed to subscribe to '{channel}': {message}")]
    SubscriptionFailed { channel: String, message: String },

    #[error("Event transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Command execution error: {0}")]
    CommandExecutionError(String),

    #[error("Command blocked: {0}")]
    CommandBlocked(String),

    #[error("Invalid input argument: {0}")]
    InvalidInputArgument(String),
}
