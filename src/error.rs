use thiserror::Error;

#[derive(Debug, Error)]
pub enum GcnRecError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("{entity} index {index} out of range (table size {size})")]
    IndexOutOfRange {
        entity: &'static str,
        index: usize,
        size: usize,
    },

    #[error("malformed data at {path}:{line}: {message}")]
    Data {
        path: String,
        line: usize,
        message: String,
    },

    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GcnRecError>;

impl GcnRecError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Self::Shape(message.into())
    }
}
