mod error;
mod pidfile;
mod process;
mod rlimit;
mod signal;

pub use error::SupervisorError;
pub use nix::sys::signal::Signal;
pub use pidfile::write_pid_file;
pub use process::{ExitOutcome, InitProcess, LaunchRequest, ProcessRecord, Supervisor};
pub use signal::{
    group_alive, is_alive, parse_signal, signal_all, signal_group, signal_process,
};
