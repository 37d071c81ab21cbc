mod error;
mod nmount;
mod recording;

pub use error::MountError;
pub use nmount::NmountMounter;
pub use recording::{MountCall, RecordingMounter};

use jailrun_spec::MountEntry;
use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

const RULESET_OPTION: &str = "ruleset=";

/// A mount resolved against a jail root, ready to hand to a [`Mounter`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSpec {
    pub fstype: String,
    pub source: Option<PathBuf>,
    pub target: PathBuf,
    pub options: Vec<String>,
}

impl MountSpec {
    pub fn new(fstype: &str, source: Option<PathBuf>, target: PathBuf, options: Vec<String>) -> Self {
        Self {
            fstype: fstype.to_string(),
            source,
            target,
            options,
        }
    }

    pub fn from_entry(root: &Path, entry: &MountEntry) -> Result<Self, MountError> {
        Ok(Self {
            fstype: entry.fstype.clone(),
            source: entry.source.clone(),
            target: resolve_target(root, &entry.destination)?,
            options: entry.options.clone(),
        })
    }

    /// Read-only nullfs mount of the root onto itself.
    pub fn readonly_root(root: &Path) -> Self {
        Self::new(
            "nullfs",
            Some(root.to_path_buf()),
            root.to_path_buf(),
            vec!["ro".to_string()],
        )
    }

    pub fn read_only(&self) -> bool {
        self.options.iter().any(|o| o == "ro")
    }

    pub fn is_devfs(&self) -> bool {
        self.fstype == "devfs"
    }

    /// Points every `ruleset=` option of a devfs mount at `ruleset`. Other
    /// mounts, and devfs mounts without a ruleset, are left alone.
    pub fn rewrite_devfs_ruleset(&mut self, ruleset: u32) {
        if !self.is_devfs() {
            return;
        }
        for option in &mut self.options {
            if option.starts_with(RULESET_OPTION) {
                *option = format!("{}{}", RULESET_OPTION, ruleset);
            }
        }
    }

    /// The ruleset a devfs mount asks for; the last `ruleset=` option wins.
    pub fn devfs_ruleset(&self) -> Result<Option<u32>, MountError> {
        if !self.is_devfs() {
            return Ok(None);
        }
        let Some(raw) = self
            .options
            .iter()
            .rev()
            .find_map(|o| o.strip_prefix(RULESET_OPTION))
        else {
            return Ok(None);
        };
        raw.parse().map(Some).map_err(|_| {
            MountError::InvalidSpec(format!("invalid devfs ruleset {}{}", RULESET_OPTION, raw))
        })
    }

    /// Name/value pairs for `nmount(2)`. `ro`/`rw` travel as mount flags
    /// rather than options.
    pub fn nmount_args(&self) -> Vec<(String, Option<String>)> {
        let source_key = if self.fstype == "nullfs" { "target" } else { "from" };
        let source = self
            .source
            .as_ref()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.fstype.clone());

        let mut args = vec![
            ("fstype".to_string(), Some(self.fstype.clone())),
            (
                "fspath".to_string(),
                Some(self.target.to_string_lossy().into_owned()),
            ),
            (source_key.to_string(), Some(source)),
        ];

        for option in &self.options {
            match option.as_str() {
                "ro" | "rw" => {}
                other => match other.split_once('=') {
                    Some((key, value)) => args.push((key.to_string(), Some(value.to_string()))),
                    None => args.push((other.to_string(), None)),
                },
            }
        }
        args
    }
}

/// Maps a container path onto the host below `root`. Destinations that
/// would leave the root are rejected.
pub fn resolve_target(root: &Path, destination: &Path) -> Result<PathBuf, MountError> {
    let mut target = root.to_path_buf();
    for component in destination.components() {
        match component {
            Component::RootDir | Component::CurDir => {}
            Component::Normal(part) => target.push(part),
            Component::ParentDir | Component::Prefix(_) => {
                return Err(MountError::InvalidSpec(format!(
                    "destination {} escapes the container root",
                    destination.display()
                )));
            }
        }
    }
    Ok(target)
}

/// Mounts and unmounts filesystems for a container.
pub trait Mounter: Send + Sync {
    fn mount(&self, spec: &MountSpec) -> Result<(), MountError>;

    fn unmount(&self, target: &Path, force: bool) -> Result<(), MountError>;

    /// devfs rulesets installed on the host, or `None` when they cannot be
    /// listed and requested rulesets go unchecked.
    fn devfs_rulesets(&self) -> Result<Option<BTreeSet<u32>>, MountError> {
        Ok(None)
    }
}

/// Fails for the first devfs mount whose ruleset is not in `available`.
pub fn check_devfs_rulesets(
    mounts: &[MountSpec],
    available: &BTreeSet<u32>,
) -> Result<(), MountError> {
    for mount in mounts {
        if let Some(ruleset) = mount.devfs_ruleset()?
            && !available.contains(&ruleset)
        {
            return Err(MountError::InvalidSpec(format!(
                "requested devfs ruleset not available: {}{}",
                RULESET_OPTION, ruleset
            )));
        }
    }
    Ok(())
}

/// Parses `devfs rule showsets` output, one ruleset number per line.
pub fn parse_rulesets(output: &str) -> BTreeSet<u32> {
    output
        .lines()
        .filter_map(|line| line.trim().parse().ok())
        .collect()
}
