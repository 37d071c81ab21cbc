use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MountError {
    #[error("mount of {target} failed: {message}")]
    MountFailed { target: PathBuf, message: String },

    #[error("unmount of {target} failed: {message}")]
    UnmountFailed { target: PathBuf, message: String },

    #[error("invalid mount specification: {0}")]
    InvalidSpec(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("system error: {0}")]
    System(#[from] nix::errno::Errno),
}

impl MountError {
    pub fn target(&self) -> Option<&PathBuf> {
        match self {
            MountError::MountFailed { target, .. } | MountError::UnmountFailed { target, .. } => {
                Some(target)
            }
            _ => None,
        }
    }
}
