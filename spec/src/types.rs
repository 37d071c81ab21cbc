use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;

/// Annotation prefix for the jail extension block.
pub const JAIL_ANNOTATION_PREFIX: &str = "org.freebsd.jail.";

/// A validated container description, built once at create time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub id: String,
    pub bundle: PathBuf,
    pub root: PathBuf,
    pub readonly_root: bool,
    pub hostname: Option<String>,
    pub process: ProcessSpec,
    pub mounts: Vec<MountEntry>,
    pub annotations: BTreeMap<String, String>,
    pub jail: JailExtension,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: PathBuf,
    pub uid: u32,
    pub gid: u32,
    pub rlimits: Vec<Rlimit>,
}

impl ProcessSpec {
    /// Environment entries split into key/value pairs. Entries without `=`
    /// are dropped.
    pub fn env_pairs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.env.iter().filter_map(|entry| entry.split_once('='))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RlimitKind {
    RlimitCpu,
    RlimitFsize,
    RlimitData,
    RlimitStack,
    RlimitCore,
    RlimitRss,
    RlimitMemlock,
    RlimitNproc,
    RlimitNofile,
    RlimitSbsize,
    RlimitAs,
    RlimitNpts,
    RlimitSwap,
    RlimitKqueues,
    RlimitUmtxp,
}

impl RlimitKind {
    pub fn from_name(name: &str) -> Option<Self> {
        let kind = match name {
            "RLIMIT_CPU" => RlimitKind::RlimitCpu,
            "RLIMIT_FSIZE" => RlimitKind::RlimitFsize,
            "RLIMIT_DATA" => RlimitKind::RlimitData,
            "RLIMIT_STACK" => RlimitKind::RlimitStack,
            "RLIMIT_CORE" => RlimitKind::RlimitCore,
            "RLIMIT_RSS" => RlimitKind::RlimitRss,
            "RLIMIT_MEMLOCK" => RlimitKind::RlimitMemlock,
            "RLIMIT_NPROC" => RlimitKind::RlimitNproc,
            "RLIMIT_NOFILE" => RlimitKind::RlimitNofile,
            "RLIMIT_SBSIZE" => RlimitKind::RlimitSbsize,
            "RLIMIT_AS" | "RLIMIT_VMEM" => RlimitKind::RlimitAs,
            "RLIMIT_NPTS" => RlimitKind::RlimitNpts,
            "RLIMIT_SWAP" => RlimitKind::RlimitSwap,
            "RLIMIT_KQUEUES" => RlimitKind::RlimitKqueues,
            "RLIMIT_UMTXP" => RlimitKind::RlimitUmtxp,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rlimit {
    pub kind: RlimitKind,
    pub soft: u64,
    pub hard: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    pub destination: PathBuf,
    pub fstype: String,
    pub source: Option<PathBuf>,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VnetMode {
    New,
    Inherit,
}

/// Jail parameters requested through `org.freebsd.jail.*` annotations.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JailExtension {
    pub vnet: Option<VnetMode>,
    pub ip4_addrs: Vec<Ipv4Addr>,
    pub ip6_addrs: Vec<Ipv6Addr>,
    pub allow: BTreeMap<String, bool>,
    pub securelevel: Option<i32>,
    pub enforce_statfs: Option<i32>,
    pub children_max: Option<i32>,
    pub devfs_ruleset: Option<i32>,
}
