use crate::error::SupervisorError;
use crate::rlimit::{self, RawRlimit};
use chrono::{DateTime, Utc};
use jailrun_jail::Attacher;
use jailrun_spec::ProcessSpec;
use serde::{Deserialize, Serialize};
use std::ffi::CString;
use std::future::Future;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

pub struct LaunchRequest<'a> {
    pub container_id: &'a str,
    pub jid: i32,
    pub process: &'a ProcessSpec,
    pub attacher: Attacher,
    /// Number of descriptors from fd 3 upwards the process inherits.
    pub preserve_fds: u32,
}

const FIRST_EXTRA_FD: i32 = 3;
const MAX_SCANNED_FD: u64 = 65536;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub pid: u32,
    pub started_at: DateTime<Utc>,
}

/// How the init process ended. `code` follows shell convention, so a death
/// by signal N reads as `128 + N`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitOutcome {
    pub code: i32,
    pub signal: Option<i32>,
    pub finished_at: DateTime<Utc>,
}

/// A started init process that has not been reaped yet.
pub struct InitProcess {
    container_id: String,
    child: Child,
    record: ProcessRecord,
}

impl InitProcess {
    pub fn record(&self) -> ProcessRecord {
        self.record
    }

    pub fn pid(&self) -> u32 {
        self.record.pid
    }

    pub async fn wait(mut self) -> Result<ExitOutcome, SupervisorError> {
        let status = self.child.wait().await?;
        let signal = status.signal();
        let code = match (status.code(), signal) {
            (Some(code), _) => code,
            (None, Some(signal)) => 128 + signal,
            (None, None) => -1,
        };

        tracing::info!(
            container_id = %self.container_id,
            pid = self.record.pid,
            code,
            ?signal,
            "Init process exited"
        );

        Ok(ExitOutcome {
            code,
            signal,
            finished_at: Utc::now(),
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Supervisor;

impl Supervisor {
    pub fn new() -> Self {
        Self
    }

    /// Starts the process inside jail `jid` as leader of a new process group.
    ///
    /// Between fork and exec the child attaches to the jail, changes into
    /// the working directory, applies resource limits and drops to the
    /// configured user, in that order. Any failure there surfaces as
    /// [`SupervisorError::Launch`]; once this returns `Ok` the program is
    /// running.
    pub fn launch(&self, req: LaunchRequest<'_>) -> Result<InitProcess, SupervisorError> {
        let container_id = req.container_id.to_string();
        let launch_err = |source: io::Error| SupervisorError::Launch {
            container_id: container_id.clone(),
            source,
        };

        let (program, args) = req
            .process
            .args
            .split_first()
            .ok_or_else(|| launch_err(io::Error::new(io::ErrorKind::InvalidInput, "empty argv")))?;

        let cwd = CString::new(req.process.cwd.as_os_str().as_bytes())
            .map_err(|e| launch_err(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let limits: Vec<RawRlimit> = rlimit::resolve(&req.process.rlimits);
        let (uid, gid) = (req.process.uid, req.process.gid);
        let jid = req.jid;
        let attach = req.attacher;
        let preserved = open_fds(req.preserve_fds);
        let scan_limit = fd_scan_limit();

        let mut cmd = Command::new(program);
        cmd.args(args)
            .env_clear()
            .envs(req.process.env_pairs())
            .stdin(Stdio::inherit())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .process_group(0);

        // SAFETY: the hook only makes async-signal-safe calls and does not
        // allocate; everything it needs was prepared above.
        unsafe {
            cmd.pre_exec(move || {
                attach(jid)?;
                if libc::chdir(cwd.as_ptr()) != 0 {
                    return Err(io::Error::last_os_error());
                }
                pass_fds(&preserved, scan_limit)?;
                rlimit::apply_raw(&limits).map_err(io::Error::from_raw_os_error)?;
                drop_privileges(uid, gid)
            });
        }

        let child = cmd.spawn().map_err(launch_err)?;
        let pid = child
            .id()
            .ok_or_else(|| launch_err(io::Error::other("init process exited before it was observed")))?;

        let record = ProcessRecord {
            pid,
            started_at: Utc::now(),
        };

        tracing::info!(container_id = %container_id, pid, jid, "Launched init process");

        Ok(InitProcess {
            container_id,
            child,
            record,
        })
    }

    /// Reaps `process` in the background and hands the outcome to `on_exit`.
    pub fn watch<F, Fut>(&self, process: InitProcess, on_exit: F) -> JoinHandle<()>
    where
        F: FnOnce(Result<ExitOutcome, SupervisorError>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let outcome = process.wait().await;
            on_exit(outcome).await;
        })
    }
}

/// The descriptors among `3..3 + count` that are open right now. Taken
/// before spawning so descriptors created by the spawn itself are never
/// mistaken for preserved ones.
fn open_fds(count: u32) -> Vec<i32> {
    let end = FIRST_EXTRA_FD.saturating_add(i32::try_from(count).unwrap_or(i32::MAX));
    (FIRST_EXTRA_FD..end)
        // SAFETY: F_GETFD only reads the descriptor flags.
        .filter(|fd| unsafe { libc::fcntl(*fd, libc::F_GETFD) } >= 0)
        .collect()
}

fn fd_scan_limit() -> i32 {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: getrlimit only writes the struct it is given.
    let soft = if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } == 0 {
        limit.rlim_cur as u64
    } else {
        MAX_SCANNED_FD
    };
    soft.min(MAX_SCANNED_FD) as i32
}

/// Async-signal-safe. Clears close-on-exec on the preserved descriptors and
/// sets it on every other one above stderr.
fn pass_fds(preserved: &[i32], limit: i32) -> io::Result<()> {
    for fd in FIRST_EXTRA_FD..limit {
        // SAFETY: fcntl on a plain integer; closed descriptors fail with EBADF.
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        if flags < 0 {
            continue;
        }
        let wanted = if preserved.contains(&fd) {
            flags & !libc::FD_CLOEXEC
        } else {
            flags | libc::FD_CLOEXEC
        };
        // SAFETY: as above.
        if wanted != flags && unsafe { libc::fcntl(fd, libc::F_SETFD, wanted) } < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Async-signal-safe. Only touches credentials that differ from ours.
fn drop_privileges(uid: u32, gid: u32) -> io::Result<()> {
    // SAFETY: plain credential syscalls on stack data.
    unsafe {
        if gid != libc::getegid() {
            let groups = [gid as libc::gid_t];
            if libc::setgroups(1 as _, groups.as_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setgid(gid as libc::gid_t) != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        if uid != libc::geteuid() && libc::setuid(uid as libc::uid_t) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
