use thiserror::Error;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Invalid config: {0}")]
    InvalidConfig(String),
    #[error("Durable store error: {0}")]
    Store(String),
}

impl InfraError {
    // Transport-level durable-store failures are worth retrying; local
    // errors and malformed payloads are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store(message) => {
                let message = message.to_ascii_lowercase();
                message.contains("network error")
                    || message.contains("timeout")
                    || message.contains("timed out")
                    || message.contains("temporarily unavailable")
                    || message.contains("connection reset")
                    || message.contains("http 429")
                    || message.contains("http 5")
            }
            _ => false,
        }
    }
}
