use crate::config::{CreateOptions, RuntimeConfig};
use crate::error::LifecycleError;
use crate::id::validate_id;
use chrono::Utc;
use jailrun_jail::{JailBinding, JailError, JailParams, KernelJails, jail_name};
use jailrun_mount::{MountSpec, Mounter, NmountMounter, check_devfs_rulesets};
use jailrun_spec::{ContainerSpec, SpecLoader, VnetMode};
use jailrun_store::{ContainerState, FileStateStore, IdLock, Status, StoreError};
use jailrun_supervisor::{
    ExitOutcome, LaunchRequest, Signal, Supervisor, SupervisorError, group_alive, is_alive,
    parse_signal, signal_all, signal_group, signal_process, write_pid_file,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Side effects of a create in progress, undone in reverse on failure.
#[derive(Default)]
struct Progress {
    jid: Option<i32>,
    mounted: Vec<PathBuf>,
}

/// Drives containers through their lifecycle.
///
/// Every operation on an id runs under that id's lock, and every mutating
/// operation first reconciles the stored record with the kernel's view.
pub struct LifecycleController {
    pub(crate) config: RuntimeConfig,
    pub(crate) store: Arc<FileStateStore>,
    pub(crate) jails: Arc<dyn JailBinding>,
    pub(crate) mounter: Arc<dyn Mounter>,
    supervisor: Supervisor,
    loader: SpecLoader,
    watchers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl LifecycleController {
    pub fn new(
        config: RuntimeConfig,
        store: Arc<FileStateStore>,
        jails: Arc<dyn JailBinding>,
        mounter: Arc<dyn Mounter>,
    ) -> Self {
        let loader = SpecLoader::new(config.strict);
        Self {
            config,
            store,
            jails,
            mounter,
            supervisor: Supervisor::new(),
            loader,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Controller backed by the kernel's jails and mount table.
    pub async fn open(config: RuntimeConfig) -> Result<Self, LifecycleError> {
        let store = Arc::new(FileStateStore::new(&config.root).await?);
        Ok(Self::new(
            config,
            store,
            Arc::new(KernelJails::new()),
            Arc::new(NmountMounter::new()),
        ))
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<FileStateStore> {
        &self.store
    }

    fn watchers(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.watchers.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn create(
        &self,
        id: &str,
        bundle: &Path,
        opts: CreateOptions,
    ) -> Result<ContainerState, LifecycleError> {
        validate_id(id)?;
        let lock = self.store.lock(id).await?;

        if self.reconcile(&lock).await?.is_some() {
            return Err(LifecycleError::AlreadyExists(id.to_string()));
        }

        let spec = self.loader.load(id, bundle)?;

        let mut record = ContainerState::new(id, spec.bundle.clone());
        record.jail_name = Some(jail_name(id));
        record.annotations = spec.annotations.clone();
        record.pid_file = opts.pid_file;
        record.preserve_fds = opts.preserve_fds;
        record.process = Some(spec.process.clone());
        self.store.insert(&lock, &record).await?;

        tracing::info!(container_id = %id, bundle = %spec.bundle.display(), "Creating container");

        let mut progress = Progress::default();
        match self.provision(&lock, &spec, &mut progress).await {
            Ok(state) => {
                tracing::info!(container_id = %id, jid = ?state.jail_id, "Container created");
                Ok(state)
            }
            Err(err) => {
                tracing::warn!(container_id = %id, error = %err, "Create failed, rolling back");
                self.rollback(&lock, progress).await;
                Err(err)
            }
        }
    }

    async fn provision(
        &self,
        lock: &IdLock,
        spec: &ContainerSpec,
        progress: &mut Progress,
    ) -> Result<ContainerState, LifecycleError> {
        let mut mounts = Vec::with_capacity(spec.mounts.len() + 1);
        if spec.readonly_root {
            mounts.push(MountSpec::readonly_root(&spec.root));
        }
        for entry in &spec.mounts {
            mounts.push(MountSpec::from_entry(&spec.root, entry)?);
        }
        if let Some(ruleset) = self.devfs_ruleset_for(spec) {
            for mount in &mut mounts {
                mount.rewrite_devfs_ruleset(ruleset);
            }
        }
        if let Some(available) = self.mounter.devfs_rulesets()? {
            check_devfs_rulesets(&mounts, &available)?;
        }

        let params = JailParams::for_spec(spec);
        let handle = self
            .jails
            .create(&params)
            .await
            .map_err(LifecycleError::JailCreate)?;
        progress.jid = Some(handle.jid);
        self.store
            .update(lock, |s| s.jail_id = Some(handle.jid))
            .await?;

        for mount in &mounts {
            self.mounter.mount(mount)?;
            progress.mounted.push(mount.target.clone());
            self.store
                .update(lock, |s| s.mount_targets.push(mount.target.clone()))
                .await?;
        }

        let state = self
            .store
            .transition(lock, &[Status::Creating], Status::Created, |_| {})
            .await?;
        Ok(state)
    }

    /// Jails that may use vmm, or that get their own vnet, need devfs nodes
    /// the default rulesets hide.
    fn devfs_ruleset_for(&self, spec: &ContainerSpec) -> Option<u32> {
        if spec.jail.allow.get("allow.vmm") == Some(&true) {
            Some(self.config.devfs_ruleset_vmm)
        } else if spec.jail.vnet == Some(VnetMode::New) {
            Some(self.config.devfs_ruleset_vnet)
        } else {
            None
        }
    }

    async fn rollback(&self, lock: &IdLock, progress: Progress) {
        let id = lock.id();

        for target in progress.mounted.iter().rev() {
            if let Err(err) = self.mounter.unmount(target, true) {
                tracing::warn!(container_id = %id, target = %target.display(), error = %err, "Rollback unmount failed");
            }
        }

        if let Some(jid) = progress.jid
            && let Err(err) = self.jails.remove(jid).await
        {
            tracing::warn!(container_id = %id, jid, error = %err, "Rollback jail removal failed");
        }

        match self.store.remove(lock).await {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(err) => {
                tracing::warn!(container_id = %id, error = %err, "Rollback record removal failed")
            }
        }
    }

    /// Launches the init process inside the container's jail.
    ///
    /// The exit watcher runs as a task of the calling process; see
    /// [`LifecycleController::run_monitor`] for keeping it alive.
    pub async fn start(&self, id: &str) -> Result<ContainerState, LifecycleError> {
        validate_id(id)?;
        let lock = self.store.lock(id).await?;
        let state = self.reconcile_checked(&lock).await?;

        if state.status != Status::Created {
            return Err(invalid_state(&state, &[Status::Created]));
        }

        let (jid, process) = match (state.jail_id, state.process.as_ref()) {
            (Some(jid), Some(process)) => (jid, process),
            _ => {
                return Err(self
                    .mark_corrupted(&lock, "record lacks jail id or process".to_string())
                    .await);
            }
        };

        let launched = self.supervisor.launch(LaunchRequest {
            container_id: id,
            jid,
            process,
            attacher: self.jails.attacher(),
            preserve_fds: state.preserve_fds,
        });

        let init = match launched {
            Ok(init) => init,
            Err(err) => {
                let message = err.to_string();
                tracing::error!(container_id = %id, error = %message, "Init process failed to launch");
                self.store
                    .transition(&lock, &[Status::Created], Status::Stopped, |s| {
                        s.error = Some(message.clone());
                        s.exited_at = Some(Utc::now());
                    })
                    .await?;
                return Err(err.into());
            }
        };

        let record = init.record();

        if let Some(pid_file) = &state.pid_file
            && let Err(err) = write_pid_file(pid_file, record.pid).await
        {
            let message = err.to_string();
            tracing::error!(container_id = %id, pid = record.pid, error = %message, "Cannot write pid file, killing init process");
            let _ = signal_process(record.pid, Signal::SIGKILL, true);
            let _ = init.wait().await;
            self.store
                .transition(&lock, &[Status::Created], Status::Stopped, |s| {
                    s.error = Some(message.clone());
                    s.exited_at = Some(Utc::now());
                })
                .await?;
            return Err(LifecycleError::Launch {
                id: id.to_string(),
                message,
            });
        }

        let monitor_pid = std::process::id();
        let state = match self
            .store
            .transition(&lock, &[Status::Created], Status::Running, |s| {
                s.pid = Some(record.pid);
                s.started_at = Some(record.started_at);
                s.monitor_pid = Some(monitor_pid);
            })
            .await
        {
            Ok(state) => state,
            Err(err) => {
                let _ = signal_process(record.pid, Signal::SIGKILL, true);
                let _ = init.wait().await;
                return Err(err.into());
            }
        };

        let store = self.store.clone();
        let watched_id = id.to_string();
        let handle = self.supervisor.watch(init, move |outcome| async move {
            record_exit(&store, &watched_id, outcome).await;
        });
        self.watchers().insert(id.to_string(), handle);

        tracing::info!(container_id = %id, pid = record.pid, "Container started");
        Ok(state)
    }

    /// Records the process that will run `start` for a created container.
    pub async fn record_monitor(&self, id: &str, pid: u32) -> Result<ContainerState, LifecycleError> {
        validate_id(id)?;
        let lock = self.store.lock(id).await?;
        let state = self.reconcile_checked(&lock).await?;
        if state.status != Status::Created {
            return Err(invalid_state(&state, &[Status::Created]));
        }
        Ok(self.store.update(&lock, |s| s.monitor_pid = Some(pid)).await?)
    }

    /// Asks the monitor of a created container to start it. Fails unless
    /// `start` could run right now.
    pub async fn request_start(&self, id: &str) -> Result<ContainerState, LifecycleError> {
        validate_id(id)?;
        let lock = self.store.lock(id).await?;
        let state = self.reconcile_checked(&lock).await?;
        if state.status != Status::Created {
            return Err(invalid_state(&state, &[Status::Created]));
        }
        Ok(self.store.update(&lock, |s| s.start_requested = true).await?)
    }

    /// Waits for a start request, starts the container and stays around
    /// until its init process has exited and the exit has been recorded.
    /// Returns the final record, or `None` if the container was deleted in
    /// the meantime.
    pub async fn run_monitor(&self, id: &str) -> Result<Option<ContainerState>, LifecycleError> {
        validate_id(id)?;
        loop {
            let Some(state) = self.store.try_get(id).await? else {
                return Ok(None);
            };
            match state.status {
                Status::Created if state.start_requested => break,
                Status::Created => {}
                _ => {
                    tracing::debug!(container_id = %id, status = %state.status, "Nothing left to monitor");
                    return Ok(Some(state));
                }
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }

        self.start(id).await?;

        let handle = self.watchers().remove(id);
        if let Some(handle) = handle {
            handle.await.map_err(|e| LifecycleError::Io(std::io::Error::other(e)))?;
        }

        Ok(self.store.try_get(id).await?)
    }

    /// Waits for a `start` running elsewhere to leave `created`.
    pub async fn await_started(&self, id: &str) -> Result<ContainerState, LifecycleError> {
        validate_id(id)?;
        let deadline = Instant::now() + self.config.start_timeout;

        loop {
            let state = self.store.get(id).await?;
            match state.status {
                Status::Created => {}
                Status::Stopped if state.pid.is_none() => {
                    return Err(LifecycleError::Launch {
                        id: id.to_string(),
                        message: state
                            .error
                            .unwrap_or_else(|| "init process did not start".to_string()),
                    });
                }
                _ => return Ok(state),
            }

            if Instant::now() >= deadline {
                return Err(LifecycleError::Timeout(format!(
                    "{} still created after {:?}",
                    id, self.config.start_timeout
                )));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Sends `signal` to the init process and its process group, and with
    /// `all` to every other process in the jail as well.
    pub async fn kill(&self, id: &str, signal: &str, all: bool) -> Result<(), LifecycleError> {
        validate_id(id)?;
        let signal = parse_signal(signal)?;
        let lock = self.store.lock(id).await?;
        let state = self.reconcile_checked(&lock).await?;

        if state.status != Status::Running {
            return Err(invalid_state(&state, &[Status::Running]));
        }
        let Some(pid) = state.pid else {
            return Err(self
                .mark_corrupted(&lock, "running without an init pid".to_string())
                .await);
        };

        signal_process(pid, signal, true)?;
        if all {
            let pids = self.jail_processes(&state).await?;
            signal_all(&pids, signal)?;
        }
        tracing::info!(container_id = %id, pid, signal = ?signal, all, "Signalled container");
        Ok(())
    }

    pub async fn delete(&self, id: &str, force: bool) -> Result<(), LifecycleError> {
        self.delete_with_grace(id, force, self.config.stop_grace).await
    }

    /// Deletes the container. With `force` a running container is sent
    /// SIGTERM, and SIGKILL once `grace` has passed.
    pub async fn delete_with_grace(
        &self,
        id: &str,
        force: bool,
        grace: Duration,
    ) -> Result<(), LifecycleError> {
        validate_id(id)?;
        let lock = self.store.lock(id).await?;
        let Some(mut state) = self.reconcile(&lock).await? else {
            return Err(LifecycleError::NotFound(id.to_string()));
        };

        if let Some(reason) = &state.corrupted
            && !force
        {
            return Err(LifecycleError::Corrupted {
                id: id.to_string(),
                reason: reason.clone(),
            });
        }

        let status = state.status;
        match status {
            Status::Created | Status::Stopped => {}
            Status::Running if force => state = self.stop_forcefully(&lock, &state, grace).await?,
            _ => return Err(invalid_state(&state, &[Status::Created, Status::Stopped])),
        }

        // Nothing is torn down while the container is busy.
        let init_group = state.pid.filter(|pid| group_alive(*pid));
        let attached = self.jail_processes(&state).await?;
        if init_group.is_some() || !attached.is_empty() {
            if !force {
                return Err(LifecycleError::JailRemove(JailError::Busy {
                    jid: state.jail_id.unwrap_or_default(),
                    attached: attached.len().max(1),
                }));
            }
            if let Some(pgid) = init_group {
                self.kill_group(id, pgid).await?;
            }
            self.kill_attached(id, &state).await?;
        }

        self.remove_jail(&state, force).await?;

        // From here on the record only tracks mounts left to release; the
        // next reconcile finishes an interrupted delete.
        let state = self
            .store
            .transition(
                &lock,
                &[Status::Created, Status::Stopped],
                Status::Deleted,
                |_| {},
            )
            .await?;
        self.unmount_recorded(&lock, &state, force).await?;
        self.store.remove(&lock).await?;
        self.watchers().remove(id);

        tracing::info!(container_id = %id, "Container deleted");
        Ok(())
    }

    async fn stop_forcefully(
        &self,
        lock: &IdLock,
        state: &ContainerState,
        grace: Duration,
    ) -> Result<ContainerState, LifecycleError> {
        let id = lock.id();

        if let Some(pid) = state.pid {
            tracing::info!(container_id = %id, pid, "Stopping container");
            if let Err(err) = signal_process(pid, Signal::SIGTERM, true) {
                tracing::debug!(container_id = %id, error = %err, "SIGTERM not delivered");
            }

            if !self.wait_gone(pid, grace).await {
                tracing::warn!(container_id = %id, pid, "Grace period expired, sending SIGKILL");
                if let Err(err) = signal_process(pid, Signal::SIGKILL, true) {
                    tracing::debug!(container_id = %id, error = %err, "SIGKILL not delivered");
                }
                if !self.wait_gone(pid, self.config.kill_timeout).await {
                    return Err(LifecycleError::Timeout(format!(
                        "init process {} of {} survived SIGKILL",
                        pid, id
                    )));
                }
            }
        }

        let state = self
            .store
            .transition(lock, &[Status::Running], Status::Stopped, |s| {
                s.exited_at = Some(Utc::now());
            })
            .await?;
        Ok(state)
    }

    async fn wait_gone(&self, pid: u32, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while is_alive(pid) {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        true
    }

    async fn kill_group(&self, id: &str, pgid: u32) -> Result<(), LifecycleError> {
        signal_group(pgid, Signal::SIGKILL)?;
        let deadline = Instant::now() + self.config.kill_timeout;
        while group_alive(pgid) {
            if Instant::now() >= deadline {
                return Err(LifecycleError::Timeout(format!(
                    "process group {} of {} survived SIGKILL",
                    pgid, id
                )));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        Ok(())
    }

    /// Pids attached to the container's jail. A jail that is already gone has
    /// none.
    async fn jail_processes(&self, state: &ContainerState) -> Result<Vec<u32>, LifecycleError> {
        let Some(jid) = state.jail_id else {
            return Ok(Vec::new());
        };
        match self.jails.processes(jid).await {
            Ok(pids) => Ok(pids),
            Err(JailError::NotFound(_)) => Ok(Vec::new()),
            Err(err) => Err(LifecycleError::Jail(err)),
        }
    }

    async fn kill_attached(&self, id: &str, state: &ContainerState) -> Result<(), LifecycleError> {
        let deadline = Instant::now() + self.config.kill_timeout;
        loop {
            let pids = self.jail_processes(state).await?;
            if pids.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(LifecycleError::Timeout(format!(
                    "{} process(es) in the jail of {} survived SIGKILL",
                    pids.len(),
                    id
                )));
            }
            signal_all(&pids, Signal::SIGKILL)?;
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Unmounts in reverse mount order. On failure the record keeps the
    /// targets still mounted so a later delete can pick up from there.
    async fn unmount_recorded(
        &self,
        lock: &IdLock,
        state: &ContainerState,
        force: bool,
    ) -> Result<(), LifecycleError> {
        let mut remaining = state.mount_targets.clone();
        let mut failure = None;
        while let Some(target) = remaining.last() {
            if let Err(err) = self.unmount_one(target, force) {
                failure = Some(err);
                break;
            }
            remaining.pop();
        }

        if remaining != state.mount_targets {
            self.store
                .update(lock, |s| s.mount_targets = remaining)
                .await?;
        }
        failure.map_or(Ok(()), Err)
    }

    pub(crate) fn unmount_one(&self, target: &Path, force: bool) -> Result<(), LifecycleError> {
        let Err(first) = self.mounter.unmount(target, false) else {
            return Ok(());
        };
        match self.mounter.unmount(target, true) {
            Ok(()) => Ok(()),
            Err(err) if force => {
                tracing::warn!(target = %target.display(), error = %err, "Leaving mount behind");
                Ok(())
            }
            Err(_) => Err(first.into()),
        }
    }

    async fn remove_jail(&self, state: &ContainerState, force: bool) -> Result<(), LifecycleError> {
        if let Some(jid) = state.jail_id {
            match self.jails.remove(jid).await {
                Ok(()) | Err(JailError::NotFound(_)) => {}
                Err(err) => return Err(LifecycleError::JailRemove(err)),
            }
        }

        // A corrupted record may point at a stale jid while a jail with our
        // name lives on.
        if force
            && state.is_corrupted()
            && let Some(name) = &state.jail_name
            && let Some(handle) = self.find_jail(name).await?
            && Some(handle.jid) != state.jail_id
        {
            match self.jails.remove(handle.jid).await {
                Ok(()) | Err(JailError::NotFound(_)) => {}
                Err(err) => return Err(LifecycleError::JailRemove(err)),
            }
        }
        Ok(())
    }

    /// Read-only snapshot of a container record.
    pub async fn state(&self, id: &str) -> Result<ContainerState, LifecycleError> {
        validate_id(id)?;
        Ok(self.store.get(id).await?)
    }

    pub async fn list(&self) -> Result<Vec<ContainerState>, LifecycleError> {
        Ok(self.store.list().await?)
    }

    /// Resolves once the container is stopped.
    pub async fn wait(
        &self,
        id: &str,
        timeout: Option<Duration>,
    ) -> Result<ContainerState, LifecycleError> {
        validate_id(id)?;
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            let state = self.store.get(id).await?;
            match state.status {
                Status::Stopped => return Ok(state),
                Status::Deleted => return Err(LifecycleError::NotFound(id.to_string())),
                Status::Running if init_lost(&state) => {
                    let lock = self.store.lock(id).await?;
                    if let Some(state) = self.reconcile(&lock).await?
                        && state.status == Status::Stopped
                    {
                        return Ok(state);
                    }
                }
                _ => {}
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(LifecycleError::Timeout(format!("{} did not stop", id)));
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    /// Force-removes a jail given by name or jid. A jail that belongs to a
    /// container goes through a forced delete of that container.
    pub async fn cleanup(&self, target: &str) -> Result<(), LifecycleError> {
        let jails = self.jails.list().await.map_err(LifecycleError::Jail)?;
        let handle = match target.parse::<i32>() {
            Ok(jid) => jails.into_iter().find(|h| h.jid == jid),
            Err(_) => jails.into_iter().find(|h| h.name == target),
        }
        .ok_or_else(|| LifecycleError::NotFound(target.to_string()))?;

        let owner = self.store.list().await?.into_iter().find(|s| {
            s.jail_id == Some(handle.jid) || s.jail_name.as_deref() == Some(handle.name.as_str())
        });
        if let Some(owner) = owner {
            tracing::info!(container_id = %owner.id, jid = handle.jid, "Cleaning up container jail");
            return self.delete(&owner.id, true).await;
        }

        self.jails
            .remove(handle.jid)
            .await
            .map_err(LifecycleError::JailRemove)?;
        tracing::info!(jid = handle.jid, name = %handle.name, "Removed unowned jail");
        Ok(())
    }
}

pub(crate) fn invalid_state(state: &ContainerState, expected: &[Status]) -> LifecycleError {
    LifecycleError::InvalidState {
        id: state.id.clone(),
        expected: expected
            .iter()
            .map(|s| s.as_str())
            .collect::<Vec<_>>()
            .join("|"),
        actual: state.status.to_string(),
    }
}

/// Whether the process recorded as the container's monitor is still around.
pub fn monitor_alive(state: &ContainerState) -> bool {
    state.monitor_pid.is_some_and(is_alive)
}

/// Neither the init process nor the process watching it is alive.
pub(crate) fn init_lost(state: &ContainerState) -> bool {
    !state.pid.is_some_and(is_alive) && !state.monitor_pid.is_some_and(is_alive)
}

async fn record_exit(
    store: &FileStateStore,
    id: &str,
    outcome: Result<ExitOutcome, SupervisorError>,
) {
    let (exit_code, exited_at) = match outcome {
        Ok(outcome) => (Some(outcome.code), outcome.finished_at),
        Err(err) => {
            tracing::warn!(container_id = %id, error = %err, "Lost track of init process");
            (None, Utc::now())
        }
    };

    let lock = match store.lock(id).await {
        Ok(lock) => lock,
        Err(err) => {
            tracing::error!(container_id = %id, error = %err, "Cannot record exit");
            return;
        }
    };

    match store
        .transition(&lock, &[Status::Running], Status::Stopped, |s| {
            s.exit_code = exit_code;
            s.exited_at = Some(exited_at);
        })
        .await
    {
        Ok(_) => tracing::info!(container_id = %id, exit_code = ?exit_code, "Container stopped"),
        Err(StoreError::InvalidState { .. }) | Err(StoreError::NotFound(_)) => {
            tracing::debug!(container_id = %id, "Exit already recorded elsewhere")
        }
        Err(err) => tracing::error!(container_id = %id, error = %err, "Cannot record exit"),
    }
}
