use jailrun_jail::JailError;
use jailrun_mount::MountError;
use jailrun_spec::SpecError;
use jailrun_store::StoreError;
use jailrun_supervisor::SupervisorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("invalid container id {id:?}: {reason}")]
    InvalidId { id: String, reason: String },

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

    #[error("container {id} is corrupted: {reason}")]
    Corrupted { id: String, reason: String },

    #[error("spec error: {0}")]
    Spec(#[from] SpecError),

    #[error("jail create error: {0}")]
    JailCreate(#[source] JailError),

    #[error("jail remove error: {0}")]
    JailRemove(#[source] JailError),

    #[error("jail error: {0}")]
    Jail(#[source] JailError),

    #[error("mount error: {0}")]
    Mount(#[from] MountError),

    #[error("failed to launch {id}: {message}")]
    Launch { id: String, message: String },

    #[error("invalid signal: {0}")]
    InvalidSignal(String),

    #[error("supervisor error: {0}")]
    Supervisor(#[source] SupervisorError),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("store error: {0}")]
    Store(StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl LifecycleError {
    /// Stable name of the error class, reported to callers.
    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleError::InvalidId { .. } => "InvalidId",
            LifecycleError::NotFound(_) => "NotFound",
            LifecycleError::AlreadyExists(_) => "AlreadyExists",
            LifecycleError::InvalidState { .. } => "InvalidState",
            LifecycleError::Corrupted { .. } => "Corrupted",
            LifecycleError::Spec(_) => "SpecError",
            LifecycleError::JailCreate(_) => "JailCreateError",
            LifecycleError::JailRemove(_) => "JailRemoveError",
            LifecycleError::Mount(_) => "MountError",
            LifecycleError::Launch { .. } => "LaunchError",
            LifecycleError::InvalidSignal(_) => "InvalidArgument",
            LifecycleError::Jail(_)
            | LifecycleError::Supervisor(_)
            | LifecycleError::Timeout(_)
            | LifecycleError::Store(_)
            | LifecycleError::Io(_) => "Internal",
        }
    }
}

impl From<StoreError> for LifecycleError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => LifecycleError::NotFound(id),
            StoreError::AlreadyExists(id) => LifecycleError::AlreadyExists(id),
            StoreError::InvalidState {
                id,
                expected,
                actual,
            } => LifecycleError::InvalidState {
                id,
                expected,
                actual,
            },
            StoreError::InvalidId(id) => LifecycleError::InvalidId {
                id,
                reason: "not usable as a file name".to_string(),
            },
            other => LifecycleError::Store(other),
        }
    }
}

impl From<SupervisorError> for LifecycleError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::Launch {
                container_id,
                source,
            } => LifecycleError::Launch {
                id: container_id,
                message: source.to_string(),
            },
            SupervisorError::InvalidSignal(raw) => LifecycleError::InvalidSignal(raw),
            other => LifecycleError::Supervisor(other),
        }
    }
}
