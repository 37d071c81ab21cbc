use thiserror::Error;

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to launch init process for {container_id}: {source}")]
    Launch {
        container_id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    #[error("failed to signal process {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: nix::errno::Errno,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
