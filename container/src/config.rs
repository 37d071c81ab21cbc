use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_ROOT: &str = "/var/run/jailrun";
pub const DEFAULT_DEVFS_RULESET_VNET: u32 = 5;
pub const DEFAULT_DEVFS_RULESET_VMM: u32 = 25;

/// Settings shared by every operation of one invocation.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// State directory holding records and lock files.
    pub root: PathBuf,
    /// Reject unknown `org.freebsd.jail.*` annotations.
    pub strict: bool,
    /// How long a forced delete waits after SIGTERM before sending SIGKILL.
    pub stop_grace: Duration,
    /// How long to wait for processes to go away after SIGKILL.
    pub kill_timeout: Duration,
    /// How long `start` waits for the monitor to leave `created`.
    pub start_timeout: Duration,
    pub poll_interval: Duration,
    /// devfs ruleset forced onto devfs mounts of jails with their own vnet.
    pub devfs_ruleset_vnet: u32,
    /// devfs ruleset forced onto devfs mounts of jails allowed to use vmm.
    pub devfs_ruleset_vmm: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            strict: false,
            stop_grace: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(5),
            start_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(50),
            devfs_ruleset_vnet: DEFAULT_DEVFS_RULESET_VNET,
            devfs_ruleset_vmm: DEFAULT_DEVFS_RULESET_VMM,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub pid_file: Option<PathBuf>,
    /// Descriptors from fd 3 upwards handed on to the init process.
    pub preserve_fds: u32,
}
