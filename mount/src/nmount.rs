use crate::error::MountError;
use crate::{MountSpec, Mounter};
use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::path::Path;

/// Mounts through FreeBSD's `nmount(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NmountMounter;

impl NmountMounter {
    pub fn new() -> Self {
        Self
    }
}

impl Mounter for NmountMounter {
    fn mount(&self, spec: &MountSpec) -> Result<(), MountError> {
        prepare_target(spec)?;

        tracing::info!(
            "Mounting {} at {:?} with options: {:?}",
            spec.fstype,
            spec.target,
            spec.options
        );

        nmount(spec)?;

        tracing::info!("Mounted {} filesystem at {:?}", spec.fstype, spec.target);
        Ok(())
    }

    fn unmount(&self, target: &Path, force: bool) -> Result<(), MountError> {
        tracing::debug!("Unmounting {:?}", target);

        unmount(target, force).map_err(|e| MountError::UnmountFailed {
            target: target.to_path_buf(),
            message: e.to_string(),
        })?;

        tracing::info!("Unmounted {:?}", target);
        Ok(())
    }

    fn devfs_rulesets(&self) -> Result<Option<BTreeSet<u32>>, MountError> {
        devfs_rulesets()
    }
}

#[cfg(target_os = "freebsd")]
fn devfs_rulesets() -> Result<Option<BTreeSet<u32>>, MountError> {
    let output = std::process::Command::new("devfs")
        .args(["rule", "showsets"])
        .stdin(std::process::Stdio::null())
        .output()?;
    if !output.status.success() {
        return Err(MountError::NotSupported(format!(
            "devfs rule showsets exited with {}",
            output.status
        )));
    }
    let rulesets = crate::parse_rulesets(&String::from_utf8_lossy(&output.stdout));
    tracing::debug!(?rulesets, "Installed devfs rulesets");
    Ok(Some(rulesets))
}

#[cfg(not(target_os = "freebsd"))]
fn devfs_rulesets() -> Result<Option<BTreeSet<u32>>, MountError> {
    Ok(None)
}

/// Creates the mount point. A nullfs mount of a single file needs a file to
/// cover, everything else a directory.
fn prepare_target(spec: &MountSpec) -> Result<(), MountError> {
    let file_source = spec.fstype == "nullfs"
        && spec.source.as_ref().is_some_and(|source| source.is_file());

    if file_source {
        if let Some(parent) = spec.target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !spec.target.exists() {
            OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&spec.target)?;
        }
    } else {
        std::fs::create_dir_all(&spec.target)?;
    }
    Ok(())
}

#[cfg(target_os = "freebsd")]
fn nmount(spec: &MountSpec) -> Result<(), MountError> {
    use nix::mount::{MntFlags, Nmount};

    let mut flags = MntFlags::empty();
    if spec.read_only() {
        flags |= MntFlags::MNT_RDONLY;
    }

    let args = spec.nmount_args();
    let mut request = Nmount::new();
    for (key, value) in &args {
        match value {
            Some(value) => request.str_opt_owned(key.as_str(), value.as_str()),
            None => request.null_opt_owned(key.as_str()),
        };
    }

    request.nmount(flags).map_err(|e| MountError::MountFailed {
        target: spec.target.clone(),
        message: match e.errmsg() {
            Some(msg) => format!("{} ({})", msg, e.error()),
            None => e.error().to_string(),
        },
    })
}

#[cfg(target_os = "freebsd")]
fn unmount(target: &Path, force: bool) -> Result<(), MountError> {
    use nix::mount::MntFlags;

    let flags = if force {
        MntFlags::MNT_FORCE
    } else {
        MntFlags::empty()
    };
    nix::mount::unmount(target, flags)?;
    Ok(())
}

#[cfg(not(target_os = "freebsd"))]
fn nmount(spec: &MountSpec) -> Result<(), MountError> {
    Err(MountError::NotSupported(format!(
        "{} mounts need nmount(2), which is FreeBSD only",
        spec.fstype
    )))
}

#[cfg(not(target_os = "freebsd"))]
fn unmount(_target: &Path, _force: bool) -> Result<(), MountError> {
    Err(MountError::NotSupported(
        "unmount(2) with FreeBSD semantics".to_string(),
    ))
}
