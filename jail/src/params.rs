use crate::error::JailError;
use jailrun_spec::{ContainerSpec, VnetMode};
use sha2::{Digest, Sha256};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Value of a `jailsys` parameter such as `vnet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JailSys {
    Disable = 0,
    New = 1,
    Inherit = 2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    Bool,
    Int,
    ULong,
    Str,
    Ip4,
    Ip6,
    JailSys,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Bool(bool),
    Int(i32),
    ULong(u64),
    Str(String),
    Ip4(Vec<Ipv4Addr>),
    Ip6(Vec<Ipv6Addr>),
    JailSys(JailSys),
}

impl ParamValue {
    pub fn kind(&self) -> ParamKind {
        match self {
            ParamValue::Bool(_) => ParamKind::Bool,
            ParamValue::Int(_) => ParamKind::Int,
            ParamValue::ULong(_) => ParamKind::ULong,
            ParamValue::Str(_) => ParamKind::Str,
            ParamValue::Ip4(_) => ParamKind::Ip4,
            ParamValue::Ip6(_) => ParamKind::Ip6,
            ParamValue::JailSys(_) => ParamKind::JailSys,
        }
    }

    /// Raw bytes as passed to `jail_set(2)`. Booleans carry no value; their
    /// state is encoded in the parameter name instead.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ParamValue::Bool(_) => Vec::new(),
            ParamValue::Int(v) => v.to_ne_bytes().to_vec(),
            ParamValue::ULong(v) => v.to_ne_bytes().to_vec(),
            ParamValue::Str(s) => {
                let mut bytes = s.as_bytes().to_vec();
                bytes.push(0);
                bytes
            }
            ParamValue::Ip4(addrs) => addrs.iter().flat_map(|a| a.octets()).collect(),
            ParamValue::Ip6(addrs) => addrs.iter().flat_map(|a| a.octets()).collect(),
            ParamValue::JailSys(v) => (*v as i32).to_ne_bytes().to_vec(),
        }
    }

    /// Decodes a buffer filled by `jail_get(2)`.
    pub fn decode(kind: ParamKind, bytes: &[u8]) -> Option<ParamValue> {
        let value = match kind {
            ParamKind::Bool => ParamValue::Bool(i32::from_ne_bytes(bytes.get(..4)?.try_into().ok()?) != 0),
            ParamKind::Int => ParamValue::Int(i32::from_ne_bytes(bytes.get(..4)?.try_into().ok()?)),
            ParamKind::ULong => ParamValue::ULong(u64::from_ne_bytes(bytes.get(..8)?.try_into().ok()?)),
            ParamKind::Str => {
                let end = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
                ParamValue::Str(String::from_utf8_lossy(&bytes[..end]).into_owned())
            }
            ParamKind::Ip4 => ParamValue::Ip4(
                bytes
                    .chunks_exact(4)
                    .filter_map(|c| <[u8; 4]>::try_from(c).ok())
                    .map(Ipv4Addr::from)
                    .collect(),
            ),
            ParamKind::Ip6 => ParamValue::Ip6(
                bytes
                    .chunks_exact(16)
                    .filter_map(|c| <[u8; 16]>::try_from(c).ok())
                    .map(Ipv6Addr::from)
                    .collect(),
            ),
            ParamKind::JailSys => {
                match i32::from_ne_bytes(bytes.get(..4)?.try_into().ok()?) {
                    0 => ParamValue::JailSys(JailSys::Disable),
                    1 => ParamValue::JailSys(JailSys::New),
                    2 => ParamValue::JailSys(JailSys::Inherit),
                    _ => return None,
                }
            }
        };
        Some(value)
    }
}

/// Type of a known jail parameter, used to size `jail_get(2)` buffers.
pub fn param_kind(name: &str) -> Option<ParamKind> {
    let kind = match name {
        "jid" | "parent" | "securelevel" | "enforce_statfs" | "children.max"
        | "children.cur" | "devfs_ruleset" => ParamKind::Int,
        "name" | "path" | "host.hostname" | "host.hostuuid" | "host.domainname" => ParamKind::Str,
        "host.hostid" => ParamKind::ULong,
        "ip4.addr" => ParamKind::Ip4,
        "ip6.addr" => ParamKind::Ip6,
        "vnet" | "host" | "ip4" | "ip6" => ParamKind::JailSys,
        "persist" | "dying" => ParamKind::Bool,
        other if other.starts_with("allow.") => ParamKind::Bool,
        _ => return None,
    };
    Some(kind)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailParam {
    pub name: String,
    pub value: ParamValue,
}

impl JailParam {
    pub fn new(name: impl Into<String>, value: ParamValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    /// Name as understood by the kernel: a false boolean gets `no` inserted
    /// after the last dot (`allow.mount` -> `allow.nomount`).
    pub fn wire_name(&self) -> String {
        match self.value {
            ParamValue::Bool(false) => match self.name.rsplit_once('.') {
                Some((prefix, leaf)) => format!("{}.no{}", prefix, leaf),
                None => format!("no{}", self.name),
            },
            _ => self.name.clone(),
        }
    }

    pub fn validate(&self) -> Result<(), JailError> {
        if self.name.is_empty() || self.name.contains('\0') {
            return Err(JailError::InvalidParam {
                name: self.name.clone(),
                reason: "empty name or interior NUL".to_string(),
            });
        }
        if let Some(expected) = param_kind(&self.name)
            && expected != self.value.kind()
        {
            return Err(JailError::InvalidParam {
                name: self.name.clone(),
                reason: format!("expected {:?} value, got {:?}", expected, self.value.kind()),
            });
        }
        if let ParamValue::Str(s) = &self.value
            && s.contains('\0')
        {
            return Err(JailError::InvalidParam {
                name: self.name.clone(),
                reason: "interior NUL".to_string(),
            });
        }
        Ok(())
    }
}

/// Ordered parameter list; setting a name twice replaces the earlier value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JailParams {
    params: Vec<JailParam>,
}

impl JailParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: impl Into<String>, value: ParamValue) -> &mut Self {
        let name = name.into();
        match self.params.iter_mut().find(|p| p.name == name) {
            Some(existing) => existing.value = value,
            None => self.params.push(JailParam::new(name, value)),
        }
        self
    }

    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.params.iter().find(|p| p.name == name).map(|p| &p.value)
    }

    pub fn name(&self) -> Option<&str> {
        match self.get("name") {
            Some(ParamValue::Str(name)) => Some(name),
            _ => None,
        }
    }

    pub fn is_persistent(&self) -> bool {
        matches!(self.get("persist"), Some(ParamValue::Bool(true)))
    }

    pub fn iter(&self) -> impl Iterator<Item = &JailParam> {
        self.params.iter()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    /// Parameters for a container's jail. Always includes `persist` so the
    /// jail survives until its init process attaches.
    pub fn for_spec(spec: &ContainerSpec) -> Self {
        let mut params = JailParams::new();
        params
            .set("name", ParamValue::Str(jail_name(&spec.id)))
            .set("path", ParamValue::Str(spec.root.to_string_lossy().into_owned()));

        if let Some(hostname) = &spec.hostname {
            params.set("host.hostname", ParamValue::Str(hostname.clone()));
        }

        if let Some(uuid) = host_uuid(&spec.id) {
            params
                .set("host.hostid", ParamValue::ULong(host_id(&uuid)))
                .set("host.hostuuid", ParamValue::Str(uuid));
        }

        let ext = &spec.jail;
        match ext.vnet {
            Some(VnetMode::New) => {
                params.set("vnet", ParamValue::JailSys(JailSys::New));
            }
            Some(VnetMode::Inherit) => {
                params.set("vnet", ParamValue::JailSys(JailSys::Inherit));
            }
            None => {}
        }
        if !ext.ip4_addrs.is_empty() {
            params.set("ip4.addr", ParamValue::Ip4(ext.ip4_addrs.clone()));
        }
        if !ext.ip6_addrs.is_empty() {
            params.set("ip6.addr", ParamValue::Ip6(ext.ip6_addrs.clone()));
        }
        for (flag, enabled) in &ext.allow {
            params.set(flag.clone(), ParamValue::Bool(*enabled));
        }
        for (name, value) in [
            ("securelevel", ext.securelevel),
            ("enforce_statfs", ext.enforce_statfs),
            ("children.max", ext.children_max),
            ("devfs_ruleset", ext.devfs_ruleset),
        ] {
            if let Some(value) = value {
                params.set(name, ParamValue::Int(value));
            }
        }

        params.set("persist", ParamValue::Bool(true));
        params
    }
}

/// Jail name for a container id. Dots separate jail hierarchy levels and an
/// all-digit name would be taken for a jid, so both are escaped. `_` starts
/// every escape, which keeps distinct ids on distinct names.
pub fn jail_name(id: &str) -> String {
    if !id.is_empty() && id.bytes().all(|b| b.is_ascii_digit()) {
        return format!("_n{}", id);
    }
    let mut name = String::with_capacity(id.len());
    for c in id.chars() {
        match c {
            '_' => name.push_str("_5f"),
            '.' => name.push_str("_2e"),
            c => name.push(c),
        }
    }
    name
}

/// `host.hostuuid` for ids that start with 32 hex digits, as engine-generated
/// ids do.
pub fn host_uuid(id: &str) -> Option<String> {
    let hex = id.get(..32)?;
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    Some(format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))
}

pub fn host_id(uuid: &str) -> u64 {
    let digest = Sha256::digest(format!("{}\n", uuid).as_bytes());
    u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as u64
}
