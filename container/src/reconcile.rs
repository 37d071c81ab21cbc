//! Brings a stored record back in line with the kernel before an operation
//! acts on it.
//!
//! A record can drift when a previous invocation died half way: a `create`
//! that never reached `created`, a `delete` that removed the jail but not the
//! record, or an init process whose monitor was killed before it could write
//! the exit status.

use crate::controller::{LifecycleController, init_lost};
use crate::error::LifecycleError;
use chrono::Utc;
use jailrun_jail::{JailError, JailHandle, ParamValue};
use jailrun_store::{ContainerState, IdLock, Status, StoreError};
use std::time::Duration;

const LOOKUP_ATTEMPTS: u32 = 3;
const LOOKUP_BACKOFF: Duration = Duration::from_millis(20);

impl LifecycleController {
    /// Reconciles `id` under its lock and returns what is left of it.
    pub async fn reconcile_id(&self, id: &str) -> Result<Option<ContainerState>, LifecycleError> {
        crate::id::validate_id(id)?;
        let lock = self.store.lock(id).await?;
        self.reconcile(&lock).await
    }

    /// Reconciles the record guarded by `lock`. `None` means no container
    /// exists under that id any more.
    pub(crate) async fn reconcile(
        &self,
        lock: &IdLock,
    ) -> Result<Option<ContainerState>, LifecycleError> {
        let Some(state) = self.store.try_get(lock.id()).await? else {
            return Ok(None);
        };

        match state.status {
            Status::Creating => self.reconcile_creating(lock, state).await,
            Status::Deleted => {
                self.finish_delete(lock, &state).await?;
                Ok(None)
            }
            Status::Created | Status::Running | Status::Stopped => {
                self.reconcile_live(lock, state).await.map(Some)
            }
        }
    }

    /// Like [`LifecycleController::reconcile`], but a missing or corrupted
    /// container is an error.
    pub(crate) async fn reconcile_checked(
        &self,
        lock: &IdLock,
    ) -> Result<ContainerState, LifecycleError> {
        let state = self
            .reconcile(lock)
            .await?
            .ok_or_else(|| LifecycleError::NotFound(lock.id().to_string()))?;

        if let Some(reason) = &state.corrupted {
            return Err(LifecycleError::Corrupted {
                id: state.id.clone(),
                reason: reason.clone(),
            });
        }
        Ok(state)
    }

    /// A `creating` record is either finished off, when the jail made it all
    /// the way, or thrown away together with whatever it left behind.
    async fn reconcile_creating(
        &self,
        lock: &IdLock,
        state: ContainerState,
    ) -> Result<Option<ContainerState>, LifecycleError> {
        let id = lock.id();
        let jail = match &state.jail_name {
            Some(name) => self.find_jail(name).await?,
            None => None,
        };

        if let Some(handle) = &jail
            && state.jail_id.is_none_or(|jid| jid == handle.jid)
            && self.is_persistent(handle.jid).await
        {
            let jid = handle.jid;
            tracing::info!(container_id = %id, jid, "Completing interrupted create");
            let state = self
                .store
                .transition(lock, &[Status::Creating], Status::Created, |s| {
                    s.jail_id = Some(jid);
                })
                .await?;
            return Ok(Some(state));
        }

        tracing::warn!(container_id = %id, "Discarding interrupted create");
        for target in state.mount_targets.iter().rev() {
            if let Err(err) = self.mounter.unmount(target, true) {
                tracing::warn!(container_id = %id, target = %target.display(), error = %err, "Stale mount left behind");
            }
        }

        // Only a jail we know we created may go; a jail that merely shares
        // the name could belong to someone else.
        if let (Some(handle), Some(jid)) = (&jail, state.jail_id)
            && handle.jid == jid
        {
            match self.jails.remove(jid).await {
                Ok(()) | Err(JailError::NotFound(_)) => {}
                Err(err) => return Err(LifecycleError::JailRemove(err)),
            }
        }

        match self.store.remove(lock).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn finish_delete(
        &self,
        lock: &IdLock,
        state: &ContainerState,
    ) -> Result<(), LifecycleError> {
        let id = lock.id();
        tracing::info!(container_id = %id, "Finishing interrupted delete");

        for target in state.mount_targets.iter().rev() {
            if let Err(err) = self.unmount_one(target, true) {
                tracing::warn!(container_id = %id, target = %target.display(), error = %err, "Stale mount left behind");
            }
        }
        if let Some(jid) = state.jail_id {
            match self.jails.remove(jid).await {
                Ok(()) | Err(JailError::NotFound(_)) => {}
                Err(err) => return Err(LifecycleError::JailRemove(err)),
            }
        }

        match self.store.remove(lock).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn reconcile_live(
        &self,
        lock: &IdLock,
        mut state: ContainerState,
    ) -> Result<ContainerState, LifecycleError> {
        let id = lock.id();

        let jail = match &state.jail_name {
            Some(name) => self.find_jail(name).await?,
            None => None,
        };
        let reason = match (state.jail_id, &jail) {
            (None, _) => Some("record has no jail id".to_string()),
            (Some(jid), None) => Some(format!("jail {} no longer exists", jid)),
            (Some(jid), Some(handle)) if handle.jid != jid => Some(format!(
                "jail {} was replaced by jail {}",
                jid, handle.jid
            )),
            _ => None,
        };

        if reason != state.corrupted {
            if let Some(reason) = &reason {
                tracing::warn!(container_id = %id, reason = %reason, "Container is corrupted");
            }
            let corrupted = reason.clone();
            state = self.store.update(lock, |s| s.corrupted = corrupted).await?;
        }

        if state.status == Status::Running && init_lost(&state) {
            tracing::warn!(container_id = %id, pid = ?state.pid, "Init process lost");
            state = self
                .store
                .transition(lock, &[Status::Running], Status::Stopped, |s| {
                    s.error = Some("init process lost".to_string());
                    s.exited_at = Some(Utc::now());
                })
                .await?;
        }

        Ok(state)
    }

    /// Looks a jail up by name, retrying briefly since the kernel can report
    /// a jail as missing while it is still being set up or torn down.
    pub(crate) async fn find_jail(&self, name: &str) -> Result<Option<JailHandle>, LifecycleError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.jails.find(name).await {
                Ok(Some(handle)) => return Ok(Some(handle)),
                Ok(None) if attempt >= LOOKUP_ATTEMPTS => return Ok(None),
                Ok(None) => {}
                Err(err @ JailError::Unsupported(_)) => return Err(LifecycleError::Jail(err)),
                Err(err) if attempt >= LOOKUP_ATTEMPTS => return Err(LifecycleError::Jail(err)),
                Err(err) => {
                    tracing::debug!(name, attempt, error = %err, "Jail lookup failed, retrying");
                }
            }
            tokio::time::sleep(LOOKUP_BACKOFF * attempt).await;
        }
    }

    async fn is_persistent(&self, jid: i32) -> bool {
        matches!(
            self.jails.get_param(jid, "persist").await,
            Ok(ParamValue::Bool(true))
        )
    }

    /// Flags the record as corrupted and returns the matching error.
    pub(crate) async fn mark_corrupted(&self, lock: &IdLock, reason: String) -> LifecycleError {
        let stored = reason.clone();
        if let Err(err) = self.store.update(lock, |s| s.corrupted = Some(stored)).await {
            tracing::error!(container_id = %lock.id(), error = %err, "Cannot flag record as corrupted");
        }
        LifecycleError::Corrupted {
            id: lock.id().to_string(),
            reason,
        }
    }
}
