#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Invalid definition time {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },
}
