use thiserror::Error;

#[derive(Debug, Error)]
pub enum JobStateError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid job id: {0:?}")]
    InvalidJobId(String),

    #[error("Queue backend error: {0}")]
    Queue(#[from] QueueError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Errors talking to the task queue's monitoring API.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue API returned status {status}: {message}")]
    Api { status: u16, message: String },

    #[error("failed to parse queue response: {0}")]
    Parse(String),

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("invalid queue URL: {0}")]
    InvalidUrl(String),
}

pub type Result<T, E = JobStateError> = std::result::Result<T, E>;
