use crate::GlobalOpts;
use crate::output::state_json;
use crate::utils::absolute;
use jailrun_container::{CreateOptions, LifecycleController, LifecycleError, monitor_alive};
use nix::unistd::setsid;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;

pub async fn state(controller: &LifecycleController, id: &str) -> Result<(), LifecycleError> {
    let state = controller.state(id).await?;
    let json = state_json(&state).map_err(|e| LifecycleError::Io(e.into()))?;
    println!("{}", json);
    Ok(())
}

pub struct CreateArgs {
    pub bundle: PathBuf,
    pub pid_file: Option<PathBuf>,
    pub preserve_fds: u32,
}

/// Creates the container and leaves a detached monitor behind. The monitor
/// holds on to this invocation's stdio and preserved descriptors until
/// `start` asks it to launch the init process with them.
pub async fn create(
    controller: &LifecycleController,
    global: &GlobalOpts,
    id: &str,
    args: CreateArgs,
) -> Result<(), LifecycleError> {
    let pid_file = args.pid_file.map(|p| absolute(&p)).transpose()?;
    controller
        .create(
            id,
            &args.bundle,
            CreateOptions {
                pid_file,
                preserve_fds: args.preserve_fds,
            },
        )
        .await?;

    let pid = spawn_monitor(global, id)?;
    controller.record_monitor(id, pid).await?;
    tracing::debug!(container_id = %id, monitor_pid = pid, "Spawned monitor");
    Ok(())
}

/// Hands the start to the container's monitor and waits for the outcome.
/// A monitor that went away is replaced by one running on this invocation's
/// stdio.
pub async fn start(
    controller: &LifecycleController,
    global: &GlobalOpts,
    id: &str,
) -> Result<(), LifecycleError> {
    let state = controller.request_start(id).await?;

    if !monitor_alive(&state) {
        tracing::warn!(container_id = %id, monitor_pid = ?state.monitor_pid, "Monitor gone, spawning another");
        let pid = spawn_monitor(global, id)?;
        tracing::debug!(container_id = %id, monitor_pid = pid, "Spawned monitor");
    }

    controller.await_started(id).await?;
    Ok(())
}

fn spawn_monitor(global: &GlobalOpts, id: &str) -> Result<u32, LifecycleError> {
    let exe = std::env::current_exe()?;
    let mut cmd = Command::new(exe);
    cmd.args(global.to_args())
        .arg("monitor")
        .arg(id)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    // SAFETY: setsid is async-signal-safe.
    unsafe {
        cmd.pre_exec(|| setsid().map(|_| ()).map_err(std::io::Error::from));
    }

    let child = cmd.spawn()?;
    Ok(child.id())
}

pub async fn kill(
    controller: &LifecycleController,
    id: &str,
    signal: &str,
    all: bool,
) -> Result<(), LifecycleError> {
    controller.kill(id, signal, all).await
}

pub async fn delete(
    controller: &LifecycleController,
    id: &str,
    force: bool,
    timeout: Option<u64>,
) -> Result<(), LifecycleError> {
    match timeout {
        Some(secs) => {
            controller
                .delete_with_grace(id, force, Duration::from_secs(secs))
                .await
        }
        None => controller.delete(id, force).await,
    }
}
