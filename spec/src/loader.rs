use crate::error::SpecError;
use crate::types::*;
use oci_spec::runtime::{Mount, Process, Root, Spec, User};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::ops::RangeInclusive;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;

const CONFIG_FILE: &str = "config.json";
const MAX_HOSTNAME_LEN: usize = 255;

/// Reads a bundle's `config.json` and turns it into a [`ContainerSpec`].
///
/// In strict mode unknown `org.freebsd.jail.*` annotations are rejected,
/// otherwise they are logged and ignored. Loading never touches anything
/// outside the bundle.
#[derive(Debug, Clone, Copy, Default)]
pub struct SpecLoader {
    strict: bool,
}

impl SpecLoader {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    pub fn strict(&self) -> bool {
        self.strict
    }

    pub fn load(&self, id: &str, bundle: &Path) -> Result<ContainerSpec, SpecError> {
        let bundle = bundle
            .canonicalize()
            .map_err(|_| SpecError::BundleNotFound(bundle.to_path_buf()))?;
        if !bundle.is_dir() {
            return Err(SpecError::BundleNotFound(bundle));
        }

        let config_path = bundle.join(CONFIG_FILE);
        if !config_path.is_file() {
            return Err(SpecError::Parse {
                path: config_path,
                message: "file not found".to_string(),
            });
        }

        let bytes = std::fs::read(&config_path).map_err(|e| SpecError::Parse {
            path: config_path.clone(),
            message: e.to_string(),
        })?;
        let mut config: Value = serde_json::from_slice(&bytes).map_err(|e| SpecError::Parse {
            path: config_path.clone(),
            message: e.to_string(),
        })?;

        // oci-spec only knows the Linux rlimit names, so they are decoded
        // here before the typed pass sees them.
        let rlimits = take_rlimits(&mut config)?;
        let spec = decode_spec(config)?;

        tracing::debug!(container_id = %id, config = ?config_path, "Loaded OCI config");

        self.build(id, bundle, &spec, rlimits)
    }

    pub fn from_oci(
        &self,
        id: &str,
        bundle: PathBuf,
        spec: &Spec,
    ) -> Result<ContainerSpec, SpecError> {
        let rlimits = match spec.process().as_ref().and_then(|p| p.rlimits().as_ref()) {
            Some(raw) => {
                let raw = serde_json::to_value(raw)
                    .map_err(|e| SpecError::invalid("process.rlimits", e.to_string()))?;
                rlimits_from_value(raw)?
            }
            None => Vec::new(),
        };
        self.build(id, bundle, spec, rlimits)
    }

    fn build(
        &self,
        id: &str,
        bundle: PathBuf,
        spec: &Spec,
        rlimits: Vec<Rlimit>,
    ) -> Result<ContainerSpec, SpecError> {
        let root = resolve_root(&bundle, spec)?;
        let readonly_root = spec
            .root()
            .as_ref()
            .and_then(|r| r.readonly())
            .unwrap_or(false);
        let process = convert_process(spec, rlimits)?;
        let mounts = convert_mounts(spec)?;

        let hostname = spec.hostname().clone().filter(|h| !h.is_empty());
        if let Some(hostname) = &hostname
            && hostname.len() > MAX_HOSTNAME_LEN
        {
            return Err(SpecError::invalid(
                "hostname",
                format!("longer than {} bytes", MAX_HOSTNAME_LEN),
            ));
        }

        let annotations: BTreeMap<String, String> = spec
            .annotations()
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();

        let jail = self.parse_extension(&annotations)?;

        Ok(ContainerSpec {
            id: id.to_string(),
            bundle,
            root,
            readonly_root,
            hostname,
            process,
            mounts,
            annotations,
            jail,
        })
    }

    fn parse_extension(
        &self,
        annotations: &BTreeMap<String, String>,
    ) -> Result<JailExtension, SpecError> {
        let mut ext = JailExtension::default();

        for (key, value) in annotations {
            let Some(field) = key.strip_prefix(JAIL_ANNOTATION_PREFIX) else {
                continue;
            };

            match field {
                "vnet" => {
                    ext.vnet = Some(match value.as_str() {
                        "new" => VnetMode::New,
                        "inherit" => VnetMode::Inherit,
                        other => {
                            return Err(SpecError::invalid(
                                key,
                                format!("expected \"new\" or \"inherit\", got {:?}", other),
                            ));
                        }
                    });
                }
                "ip4.addr" => ext.ip4_addrs = parse_list(key, value)?,
                "ip6.addr" => ext.ip6_addrs = parse_list(key, value)?,
                "securelevel" => ext.securelevel = Some(parse_int(key, value, -1..=3)?),
                "enforce_statfs" => ext.enforce_statfs = Some(parse_int(key, value, 0..=2)?),
                "children.max" => ext.children_max = Some(parse_int(key, value, 0..=i32::MAX)?),
                "devfs_ruleset" => ext.devfs_ruleset = Some(parse_int(key, value, 0..=65535)?),
                flag if flag.starts_with("allow.") && flag.len() > "allow.".len() => {
                    ext.allow.insert(flag.to_string(), parse_bool(key, value)?);
                }
                _ if self.strict => return Err(SpecError::UnknownExtension(key.clone())),
                _ => {
                    tracing::warn!(annotation = %key, "Ignoring unknown jail extension field");
                }
            }
        }

        if ext.vnet == Some(VnetMode::New)
            && (!ext.ip4_addrs.is_empty() || !ext.ip6_addrs.is_empty())
        {
            return Err(SpecError::invalid(
                format!("{}vnet", JAIL_ANNOTATION_PREFIX),
                "ip addresses cannot be combined with a new vnet",
            ));
        }

        Ok(ext)
    }
}

fn resolve_root(bundle: &Path, spec: &Spec) -> Result<PathBuf, SpecError> {
    let root = spec
        .root()
        .as_ref()
        .ok_or_else(|| SpecError::MissingField("root.path".to_string()))?;

    if root.path().as_os_str().is_empty() {
        return Err(SpecError::MissingField("root.path".to_string()));
    }

    let path = if root.path().is_absolute() {
        root.path().clone()
    } else {
        bundle.join(root.path())
    };

    if !path.is_dir() {
        return Err(SpecError::invalid(
            "root.path",
            format!("{} is not a directory", path.display()),
        ));
    }

    Ok(path)
}

fn convert_process(spec: &Spec, rlimits: Vec<Rlimit>) -> Result<ProcessSpec, SpecError> {
    let process = spec
        .process()
        .as_ref()
        .ok_or_else(|| SpecError::MissingField("process".to_string()))?;

    let args = process
        .args()
        .clone()
        .filter(|args| !args.is_empty())
        .ok_or_else(|| SpecError::MissingField("process.args".to_string()))?;
    if args[0].is_empty() {
        return Err(SpecError::invalid("process.args[0]", "empty executable"));
    }

    if !process.cwd().is_absolute() {
        return Err(SpecError::invalid("process.cwd", "must be an absolute path"));
    }

    let env = process.env().clone().unwrap_or_default();
    if let Some(index) = env.iter().position(|entry| !entry.contains('=')) {
        return Err(SpecError::invalid(
            format!("process.env[{}]", index),
            "expected KEY=VALUE",
        ));
    }

    Ok(ProcessSpec {
        args,
        env,
        cwd: process.cwd().clone(),
        uid: process.user().uid(),
        gid: process.user().gid(),
        rlimits,
    })
}

#[derive(Deserialize)]
struct RawRlimit {
    #[serde(rename = "type")]
    typ: String,
    soft: u64,
    hard: u64,
}

fn take_rlimits(config: &mut Value) -> Result<Vec<Rlimit>, SpecError> {
    let raw = config
        .get_mut("process")
        .and_then(Value::as_object_mut)
        .and_then(|process| process.remove("rlimits"));
    match raw {
        Some(raw) => rlimits_from_value(raw),
        None => Ok(Vec::new()),
    }
}

fn rlimits_from_value(raw: Value) -> Result<Vec<Rlimit>, SpecError> {
    match raw {
        Value::Null => Ok(Vec::new()),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| convert_rlimit(index, item))
            .collect(),
        _ => Err(SpecError::invalid("process.rlimits", "expected an array")),
    }
}

fn convert_rlimit(index: usize, raw: &Value) -> Result<Rlimit, SpecError> {
    let field = format!("process.rlimits[{}]", index);
    let raw = RawRlimit::deserialize(raw).map_err(|e| SpecError::invalid(&field, e.to_string()))?;

    let kind = RlimitKind::from_name(&raw.typ)
        .ok_or_else(|| SpecError::invalid(&field, format!("unknown resource {}", raw.typ)))?;

    if raw.soft > raw.hard {
        return Err(SpecError::invalid(&field, "soft limit exceeds hard limit"));
    }

    Ok(Rlimit {
        kind,
        soft: raw.soft,
        hard: raw.hard,
    })
}

fn decode_spec(config: Value) -> Result<Spec, SpecError> {
    Spec::deserialize(&config).map_err(|e| {
        let field = locate_decode_error(&config).unwrap_or_else(|| "config".to_string());
        SpecError::invalid(field, e.to_string())
    })
}

fn fails<T: DeserializeOwned>(value: &Value) -> bool {
    T::deserialize(value).is_err()
}

const PROCESS_FIELDS: &[(&str, fn(&Value) -> bool)] = &[
    ("args", fails::<Option<Vec<String>>>),
    ("env", fails::<Option<Vec<String>>>),
    ("cwd", fails::<PathBuf>),
    ("user", fails::<User>),
    ("terminal", fails::<Option<bool>>),
    ("noNewPrivileges", fails::<Option<bool>>),
];

/// Narrows a failed typed decode down to the field that caused it.
fn locate_decode_error(config: &Value) -> Option<String> {
    let object = config.as_object()?;

    if let Some(process) = object.get("process")
        && fails::<Process>(process)
    {
        let field = process.as_object().and_then(|fields| {
            PROCESS_FIELDS
                .iter()
                .find(|(key, fails)| fields.get(*key).is_some_and(|v| fails(v)))
                .map(|(key, _)| format!("process.{}", key))
        });
        return Some(field.unwrap_or_else(|| "process".to_string()));
    }

    if let Some(root) = object.get("root")
        && fails::<Root>(root)
    {
        let path_invalid = root.get("path").is_some_and(fails::<PathBuf>);
        return Some(if path_invalid { "root.path" } else { "root" }.to_string());
    }

    match object.get("mounts") {
        Some(Value::Array(mounts)) => {
            if let Some(index) = mounts.iter().position(fails::<Mount>) {
                return Some(format!("mounts[{}]", index));
            }
        }
        Some(Value::Null) | None => {}
        Some(_) => return Some("mounts".to_string()),
    }

    for key in ["ociVersion", "hostname"] {
        if object.get(key).is_some_and(fails::<Option<String>>) {
            return Some(key.to_string());
        }
    }
    if object
        .get("annotations")
        .is_some_and(fails::<Option<HashMap<String, String>>>)
    {
        return Some("annotations".to_string());
    }

    None
}

fn convert_mounts(spec: &Spec) -> Result<Vec<MountEntry>, SpecError> {
    let mut mounts = Vec::new();

    for (index, mount) in spec.mounts().iter().flatten().enumerate() {
        let destination = mount.destination();
        if !destination.is_absolute() {
            return Err(SpecError::invalid(
                format!("mounts[{}].destination", index),
                "must be an absolute path",
            ));
        }
        if destination
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(SpecError::invalid(
                format!("mounts[{}].destination", index),
                "must not contain '..'",
            ));
        }

        let mut options = mount.options().clone().unwrap_or_default();
        let fstype = match mount.typ().as_deref() {
            None | Some("") | Some("bind") | Some("rbind") => {
                options.retain(|o| o != "bind" && o != "rbind");
                "nullfs".to_string()
            }
            Some(other) => other.to_string(),
        };

        if fstype == "nullfs" && mount.source().is_none() {
            return Err(SpecError::MissingField(format!("mounts[{}].source", index)));
        }

        mounts.push(MountEntry {
            destination: destination.clone(),
            fstype,
            source: mount.source().clone(),
            options,
        });
    }

    Ok(mounts)
}

fn parse_list<T: FromStr>(key: &str, value: &str) -> Result<Vec<T>, SpecError> {
    value
        .split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(|item| {
            item.parse::<T>()
                .map_err(|_| SpecError::invalid(key, format!("invalid address {:?}", item)))
        })
        .collect()
}

fn parse_int(key: &str, value: &str, range: RangeInclusive<i32>) -> Result<i32, SpecError> {
    let parsed: i32 = value
        .trim()
        .parse()
        .map_err(|_| SpecError::invalid(key, format!("expected an integer, got {:?}", value)))?;
    if !range.contains(&parsed) {
        return Err(SpecError::invalid(
            key,
            format!("{} is outside {}..={}", parsed, range.start(), range.end()),
        ));
    }
    Ok(parsed)
}

fn parse_bool(key: &str, value: &str) -> Result<bool, SpecError> {
    match value.trim() {
        "1" | "true" | "yes" => Ok(true),
        "0" | "false" | "no" => Ok(false),
        other => Err(SpecError::invalid(
            key,
            format!("expected a boolean, got {:?}", other),
        )),
    }
}
