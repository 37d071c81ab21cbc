use crate::error::StoreError;
use crate::lock::IdLock;
use crate::state::{ContainerState, Status};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;

const CONTAINERS_DIR: &str = "containers";
const LOCKS_DIR: &str = "locks";

/// Container records on disk, one JSON document per id.
///
/// Reads need no lock since every write replaces the record atomically.
/// Writes require the id's [`IdLock`].
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    pub async fn new(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let root = root.as_ref().to_path_buf();

        fs::create_dir_all(root.join(CONTAINERS_DIR)).await?;
        fs::create_dir_all(root.join(LOCKS_DIR)).await?;

        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn check_id(id: &str) -> Result<(), StoreError> {
        if id.is_empty() || id == "." || id == ".." || id.contains('/') || id.contains('\0') {
            return Err(StoreError::InvalidId(id.to_string()));
        }
        Ok(())
    }

    fn record_path(&self, id: &str) -> PathBuf {
        self.root.join(CONTAINERS_DIR).join(format!("{}.json", id))
    }

    fn tmp_path(&self, id: &str) -> PathBuf {
        self.root.join(CONTAINERS_DIR).join(format!(".{}.json.tmp", id))
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.root.join(LOCKS_DIR).join(format!("{}.lock", id))
    }

    fn check_lock(lock: &IdLock, id: &str) -> Result<(), StoreError> {
        if lock.id() != id {
            return Err(StoreError::LockMismatch {
                held: lock.id().to_string(),
                requested: id.to_string(),
            });
        }
        Ok(())
    }

    /// Acquires the per-id lock, blocking a worker thread rather than the
    /// runtime while another process holds it.
    pub async fn lock(&self, id: &str) -> Result<IdLock, StoreError> {
        Self::check_id(id)?;
        let id = id.to_string();
        let path = self.lock_path(&id);
        tokio::task::spawn_blocking(move || IdLock::acquire(id, path))
            .await
            .map_err(|e| StoreError::Lock(e.to_string()))?
    }

    pub async fn get(&self, id: &str) -> Result<ContainerState, StoreError> {
        self.try_get(id)
            .await?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub async fn try_get(&self, id: &str) -> Result<Option<ContainerState>, StoreError> {
        Self::check_id(id)?;
        match fs::read(self.record_path(id)).await {
            Ok(content) => Ok(Some(serde_json::from_slice(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn insert(&self, lock: &IdLock, state: &ContainerState) -> Result<(), StoreError> {
        Self::check_lock(lock, &state.id)?;
        if fs::try_exists(self.record_path(&state.id)).await? {
            return Err(StoreError::AlreadyExists(state.id.clone()));
        }
        self.write(state).await?;
        tracing::debug!(container_id = %state.id, status = %state.status, "Inserted record");
        Ok(())
    }

    /// Moves the record to `to` if its current status is one of `allowed`,
    /// applying `mutator` in the same write.
    pub async fn transition<F>(
        &self,
        lock: &IdLock,
        allowed: &[Status],
        to: Status,
        mutator: F,
    ) -> Result<ContainerState, StoreError>
    where
        F: FnOnce(&mut ContainerState),
    {
        let mut state = self.get(lock.id()).await?;

        if !allowed.contains(&state.status) || !state.status.can_transition_to(to) {
            return Err(StoreError::InvalidState {
                id: state.id,
                expected: allowed
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join("|"),
                actual: state.status.to_string(),
            });
        }

        let from = state.status;
        state.status = to;
        mutator(&mut state);
        state.status = to;
        self.write(&state).await?;

        tracing::info!(container_id = %state.id, from = %from, to = %to, "State transition");
        Ok(state)
    }

    /// Rewrites non-status fields of the record.
    pub async fn update<F>(&self, lock: &IdLock, mutator: F) -> Result<ContainerState, StoreError>
    where
        F: FnOnce(&mut ContainerState),
    {
        let mut state = self.get(lock.id()).await?;
        let status = state.status;
        mutator(&mut state);
        state.status = status;
        self.write(&state).await?;
        Ok(state)
    }

    pub async fn remove(&self, lock: &IdLock) -> Result<(), StoreError> {
        match fs::remove_file(self.record_path(lock.id())).await {
            Ok(()) => {
                tracing::debug!(container_id = %lock.id(), "Removed record");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(lock.id().to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All readable records, oldest first.
    pub async fn list(&self) -> Result<Vec<ContainerState>, StoreError> {
        let mut states = Vec::new();
        let mut entries = fs::read_dir(self.root.join(CONTAINERS_DIR)).await?;

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with('.') || !name.ends_with(".json") {
                continue;
            }

            let parsed = match fs::read(&path).await {
                Ok(content) => serde_json::from_slice::<ContainerState>(&content)
                    .map_err(StoreError::from),
                Err(e) => Err(e.into()),
            };
            match parsed {
                Ok(state) => states.push(state),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable record"),
            }
        }

        states.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(states)
    }

    async fn write(&self, state: &ContainerState) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(state)?;
        let tmp = self.tmp_path(&state.id);

        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, self.record_path(&state.id)).await?;
        Ok(())
    }
}
