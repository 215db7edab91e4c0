/// Error types for the StudyHub messaging core
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StudyHubError {
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Malformed message {id}: {reason}")]
    MalformedMessage { id: String, reason: String },

    #[error("Subscription dropped: {0}")]
    SubscriptionDropped(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StudyHubError {
    /// Whether the failure came from the store being unreachable.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, StudyHubError::StoreUnavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, StudyHubError>;
