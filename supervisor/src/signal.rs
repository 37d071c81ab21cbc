use crate::error::SupervisorError;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use std::str::FromStr;

/// Accepts `TERM`, `SIGTERM`, `sigterm` or `15`.
pub fn parse_signal(raw: &str) -> Result<Signal, SupervisorError> {
    let raw = raw.trim();
    if let Ok(number) = raw.parse::<i32>() {
        return Signal::try_from(number).map_err(|_| SupervisorError::InvalidSignal(raw.to_string()));
    }

    let upper = raw.to_ascii_uppercase();
    let name = if upper.starts_with("SIG") {
        upper
    } else {
        format!("SIG{}", upper)
    };
    Signal::from_str(&name).map_err(|_| SupervisorError::InvalidSignal(raw.to_string()))
}

/// Signals `pid` and, with `group`, its whole process group. A group that is
/// already empty is not an error; a missing process is.
pub fn signal_process(pid: u32, signal: Signal, group: bool) -> Result<(), SupervisorError> {
    let target = Pid::from_raw(pid as i32);

    kill(target, signal).map_err(|source| SupervisorError::Signal { pid, source })?;

    if group {
        signal_group(pid, signal)?;
    }

    tracing::debug!(pid, signal = ?signal, group, "Delivered signal");
    Ok(())
}

/// Signals every process in the group led by `pgid`, even after the leader
/// itself is gone.
pub fn signal_group(pgid: u32, signal: Signal) -> Result<(), SupervisorError> {
    match killpg(Pid::from_raw(pgid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(source) => Err(SupervisorError::Signal { pid: pgid, source }),
    }
}

/// Signals each of `pids`, skipping those that are already gone. Returns how
/// many were signalled.
pub fn signal_all(pids: &[u32], signal: Signal) -> Result<usize, SupervisorError> {
    let mut delivered = 0;
    for &pid in pids {
        match kill(Pid::from_raw(pid as i32), signal) {
            Ok(()) => delivered += 1,
            Err(Errno::ESRCH) => {}
            Err(source) => return Err(SupervisorError::Signal { pid, source }),
        }
    }
    tracing::debug!(count = delivered, signal = ?signal, "Signalled processes");
    Ok(delivered)
}

pub fn is_alive(pid: u32) -> bool {
    !matches!(kill(Pid::from_raw(pid as i32), None), Err(Errno::ESRCH))
}

/// Whether any process is left in the process group led by `pgid`.
pub fn group_alive(pgid: u32) -> bool {
    !matches!(killpg(Pid::from_raw(pgid as i32), None), Err(Errno::ESRCH))
}
