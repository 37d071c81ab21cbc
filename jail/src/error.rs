use thiserror::Error;

#[derive(Error, Debug)]
pub enum JailError {
    #[error("failed to create jail {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to remove jail {jid}: {source}")]
    Remove {
        jid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("jail {jid} still has {attached} attached process(es)")]
    Busy { jid: i32, attached: usize },

    #[error("jail not found: {0}")]
    NotFound(i32),

    #[error("jail parameter {name}: {source}")]
    Param {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("jail {0} must be created with persist set")]
    MissingPersist(String),

    #[error("invalid jail parameter {name}: {reason}")]
    InvalidParam { name: String, reason: String },

    #[error("not supported: {0}")]
    Unsupported(&'static str),
}
