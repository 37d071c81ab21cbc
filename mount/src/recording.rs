use crate::error::MountError;
use crate::{MountSpec, Mounter};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountCall {
    Mount(MountSpec),
    Unmount { target: PathBuf, force: bool },
}

#[derive(Default)]
struct Inner {
    calls: Vec<MountCall>,
    mounted: Vec<PathBuf>,
    fail_on: HashSet<PathBuf>,
    fail_unmount: HashSet<PathBuf>,
    devfs_rulesets: Option<BTreeSet<u32>>,
}

/// Records mount calls instead of touching the kernel's mount table.
#[derive(Default)]
pub struct RecordingMounter {
    inner: Mutex<Inner>,
}

impl RecordingMounter {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Makes every mount onto `target` fail.
    pub fn fail_on(&self, target: impl Into<PathBuf>) {
        self.inner().fail_on.insert(target.into());
    }

    /// Makes every unmount of `target` fail, forced or not.
    pub fn fail_unmount(&self, target: impl Into<PathBuf>) {
        self.inner().fail_unmount.insert(target.into());
    }

    /// Reports these devfs rulesets as installed.
    pub fn set_devfs_rulesets(&self, rulesets: impl IntoIterator<Item = u32>) {
        self.inner().devfs_rulesets = Some(rulesets.into_iter().collect());
    }

    pub fn calls(&self) -> Vec<MountCall> {
        self.inner().calls.clone()
    }

    /// Targets currently mounted, in mount order.
    pub fn mounted(&self) -> Vec<PathBuf> {
        self.inner().mounted.clone()
    }
}

impl Mounter for RecordingMounter {
    fn mount(&self, spec: &MountSpec) -> Result<(), MountError> {
        let mut inner = self.inner();
        inner.calls.push(MountCall::Mount(spec.clone()));
        if inner.fail_on.contains(&spec.target) {
            return Err(MountError::MountFailed {
                target: spec.target.clone(),
                message: "injected failure".to_string(),
            });
        }
        inner.mounted.push(spec.target.clone());
        Ok(())
    }

    fn unmount(&self, target: &Path, force: bool) -> Result<(), MountError> {
        let mut inner = self.inner();
        inner.calls.push(MountCall::Unmount {
            target: target.to_path_buf(),
            force,
        });
        if inner.fail_unmount.contains(target) {
            return Err(MountError::UnmountFailed {
                target: target.to_path_buf(),
                message: "injected failure".to_string(),
            });
        }
        match inner.mounted.iter().rposition(|t| t == target) {
            Some(index) => {
                inner.mounted.remove(index);
                Ok(())
            }
            None => Err(MountError::UnmountFailed {
                target: target.to_path_buf(),
                message: "not mounted".to_string(),
            }),
        }
    }

    fn devfs_rulesets(&self) -> Result<Option<BTreeSet<u32>>, MountError> {
        Ok(self.inner().devfs_rulesets.clone())
    }
}
