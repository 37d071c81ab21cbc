use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("container not found: {0}")]
    NotFound(String),

    #[error("container already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid container state for {id}: expected {expected}, got {actual}")]
    InvalidState {
        id: String,
        expected: String,
        actual: String,
    },

    #[error("lock for {held} does not cover {requested}")]
    LockMismatch { held: String, requested: String },

    #[error("invalid container id: {0:?}")]
    InvalidId(String),

    #[error("lock error: {0}")]
    Lock(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
