use chrono::{DateTime, Utc};
use jailrun_spec::ProcessSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Creating,
    Created,
    Running,
    Stopped,
    Deleted,
}

impl Status {
    /// Whether `self -> to` is a legal lifecycle edge. `Created -> Stopped`
    /// covers an init process that never launched.
    pub fn can_transition_to(self, to: Status) -> bool {
        matches!(
            (self, to),
            (Status::Creating, Status::Created)
                | (Status::Created, Status::Running)
                | (Status::Created, Status::Stopped)
                | (Status::Running, Status::Stopped)
                | (Status::Stopped, Status::Deleted)
                | (Status::Created, Status::Deleted)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Creating => "creating",
            Status::Created => "created",
            Status::Running => "running",
            Status::Stopped => "stopped",
            Status::Deleted => "deleted",
        }
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The persisted record of one container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerState {
    pub id: String,
    pub bundle: PathBuf,
    pub status: Status,
    #[serde(default)]
    pub jail_id: Option<i32>,
    #[serde(default)]
    pub jail_name: Option<String>,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub monitor_pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub corrupted: Option<String>,
    #[serde(default)]
    pub pid_file: Option<PathBuf>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub process: Option<ProcessSpec>,
    /// Host paths mounted for the container, in mount order.
    #[serde(default)]
    pub mount_targets: Vec<PathBuf>,
    /// Descriptors past stderr handed on to the init process.
    #[serde(default)]
    pub preserve_fds: u32,
    /// Set by `start` for the monitor waiting on a created container.
    #[serde(default)]
    pub start_requested: bool,
}

impl ContainerState {
    pub fn new(id: &str, bundle: PathBuf) -> Self {
        Self {
            id: id.to_string(),
            bundle,
            status: Status::Creating,
            jail_id: None,
            jail_name: None,
            pid: None,
            monitor_pid: None,
            created_at: Utc::now(),
            started_at: None,
            exited_at: None,
            exit_code: None,
            error: None,
            corrupted: None,
            pid_file: None,
            annotations: BTreeMap::new(),
            process: None,
            mount_targets: Vec::new(),
            preserve_fds: 0,
            start_requested: false,
        }
    }

    pub fn is_corrupted(&self) -> bool {
        self.corrupted.is_some()
    }
}
