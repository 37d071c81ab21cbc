use crate::binding::{Attacher, JailBinding, JailHandle, check_create};
use crate::error::JailError;
use crate::params::{JailParam, JailParams, ParamKind, ParamValue, param_kind};
use async_trait::async_trait;
use std::io;

pub const JAIL_CREATE: i32 = 0x01;
pub const JAIL_UPDATE: i32 = 0x02;

const ERRMSG_LEN: usize = 1024;
const MAXPATHLEN: usize = 1024;
const MAXHOSTNAMELEN: usize = 256;
const MAX_ADDRS: usize = 64;
const PROC_TABLE_ATTEMPTS: usize = 4;

#[cfg(target_os = "freebsd")]
mod sys {
    use libc::{c_int, c_uint, iovec};

    unsafe extern "C" {
        pub fn jail_set(iov: *mut iovec, niov: c_uint, flags: c_int) -> c_int;
        pub fn jail_get(iov: *mut iovec, niov: c_uint, flags: c_int) -> c_int;
        pub fn jail_attach(jid: c_int) -> c_int;
        pub fn jail_remove(jid: c_int) -> c_int;
    }
}

/// Name/value buffers laid out the way `jail_set(2)` and `jail_get(2)` expect
/// them: alternating iovecs, names NUL-terminated, with an `errmsg` slot for
/// the kernel's explanation.
pub(crate) struct JailIov {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl JailIov {
    pub(crate) fn new() -> Self {
        let mut iov = Self {
            entries: Vec::new(),
        };
        iov.push("errmsg", vec![0; ERRMSG_LEN]);
        iov
    }

    pub(crate) fn push(&mut self, name: &str, value: Vec<u8>) -> usize {
        let mut key = name.as_bytes().to_vec();
        key.push(0);
        self.entries.push((key, value));
        self.entries.len() - 1
    }

    pub(crate) fn push_param(&mut self, param: &JailParam) -> usize {
        self.push(&param.wire_name(), param.value.encode())
    }

    pub(crate) fn value(&self, index: usize) -> &[u8] {
        &self.entries[index].1
    }

    pub(crate) fn errmsg(&self) -> Option<String> {
        let raw = self.value(0);
        let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
        if end == 0 {
            return None;
        }
        Some(String::from_utf8_lossy(&raw[..end]).into_owned())
    }

    pub(crate) fn iovecs(&mut self) -> Vec<libc::iovec> {
        let mut out = Vec::with_capacity(self.entries.len() * 2);
        for (key, value) in self.entries.iter_mut() {
            out.push(libc::iovec {
                iov_base: key.as_mut_ptr().cast(),
                iov_len: key.len(),
            });
            out.push(if value.is_empty() {
                libc::iovec {
                    iov_base: std::ptr::null_mut(),
                    iov_len: 0,
                }
            } else {
                libc::iovec {
                    iov_base: value.as_mut_ptr().cast(),
                    iov_len: value.len(),
                }
            });
        }
        out
    }

    /// Folds the kernel's errmsg into the OS error.
    fn error(&self, err: io::Error) -> io::Error {
        match self.errmsg() {
            Some(msg) => io::Error::new(err.kind(), format!("{} ({})", msg, err)),
            None => err,
        }
    }
}

#[cfg(target_os = "freebsd")]
fn jail_set(iov: &mut JailIov, flags: i32) -> io::Result<i32> {
    let mut vecs = iov.iovecs();
    // SAFETY: every iovec points into a buffer owned by `iov`, which outlives
    // the call and is not touched until it returns.
    let jid = unsafe { sys::jail_set(vecs.as_mut_ptr(), vecs.len() as libc::c_uint, flags) };
    if jid < 0 {
        return Err(iov.error(io::Error::last_os_error()));
    }
    Ok(jid)
}

#[cfg(target_os = "freebsd")]
fn jail_get(iov: &mut JailIov, flags: i32) -> io::Result<i32> {
    let mut vecs = iov.iovecs();
    // SAFETY: as in `jail_set`; the kernel writes at most `iov_len` bytes.
    let jid = unsafe { sys::jail_get(vecs.as_mut_ptr(), vecs.len() as libc::c_uint, flags) };
    if jid < 0 {
        return Err(iov.error(io::Error::last_os_error()));
    }
    Ok(jid)
}

#[cfg(target_os = "freebsd")]
fn jail_remove(jid: i32) -> io::Result<()> {
    // SAFETY: plain syscall on an integer argument.
    if unsafe { sys::jail_remove(jid) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "freebsd")]
fn attach(jid: i32) -> io::Result<()> {
    // SAFETY: plain syscall; async-signal-safe.
    if unsafe { sys::jail_attach(jid) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Walks the process table through `kern.proc.proc` and keeps the entries
/// whose `ki_jid` matches.
#[cfg(target_os = "freebsd")]
fn jail_processes(jid: i32) -> io::Result<Vec<u32>> {
    let mib = [libc::CTL_KERN, libc::KERN_PROC, libc::KERN_PROC_PROC];
    let entry = std::mem::size_of::<libc::kinfo_proc>();

    for _ in 0..PROC_TABLE_ATTEMPTS {
        let mut len: libc::size_t = 0;
        // SAFETY: size query, no buffer is passed.
        let rc = unsafe {
            libc::sysctl(
                mib.as_ptr(),
                mib.len() as libc::c_uint,
                std::ptr::null_mut(),
                &mut len,
                std::ptr::null(),
                0,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        // Leave room for processes forked since the size query.
        let mut buf: Vec<libc::kinfo_proc> = Vec::with_capacity(len / entry + 16);
        let mut size = buf.capacity() * entry;
        // SAFETY: `buf` has room for `size` bytes and the kernel writes at
        // most that many.
        let rc = unsafe {
            libc::sysctl(
                mib.as_ptr(),
                mib.len() as libc::c_uint,
                buf.as_mut_ptr().cast(),
                &mut size,
                std::ptr::null(),
                0,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOMEM) {
                continue;
            }
            return Err(err);
        }
        // SAFETY: the kernel filled `size` bytes with whole entries.
        unsafe { buf.set_len(size / entry) };

        return Ok(buf
            .iter()
            .filter(|proc| proc.ki_jid == jid)
            .map(|proc| proc.ki_pid as u32)
            .collect());
    }
    Err(io::Error::from_raw_os_error(libc::ENOMEM))
}

#[cfg(not(target_os = "freebsd"))]
fn jail_processes(_jid: i32) -> io::Result<Vec<u32>> {
    Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

#[cfg(not(target_os = "freebsd"))]
fn jail_set(_iov: &mut JailIov, _flags: i32) -> io::Result<i32> {
    Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

#[cfg(not(target_os = "freebsd"))]
fn jail_get(_iov: &mut JailIov, _flags: i32) -> io::Result<i32> {
    Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

#[cfg(not(target_os = "freebsd"))]
fn jail_remove(_jid: i32) -> io::Result<()> {
    Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

#[cfg(not(target_os = "freebsd"))]
fn attach(_jid: i32) -> io::Result<()> {
    Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

fn buffer_for(kind: ParamKind, name: &str) -> Vec<u8> {
    let len = match kind {
        ParamKind::Bool | ParamKind::Int | ParamKind::JailSys => 4,
        ParamKind::ULong => 8,
        ParamKind::Str if name == "path" => MAXPATHLEN,
        ParamKind::Str => MAXHOSTNAMELEN,
        ParamKind::Ip4 => 4 * MAX_ADDRS,
        ParamKind::Ip6 => 16 * MAX_ADDRS,
    };
    vec![0; len]
}

fn is_missing(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ENOENT) | Some(libc::EINVAL))
}

/// Jails backed by the FreeBSD kernel.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelJails;

impl KernelJails {
    pub fn new() -> Self {
        Self
    }

    pub fn supported() -> bool {
        cfg!(target_os = "freebsd")
    }

    fn ensure_supported() -> Result<(), JailError> {
        if Self::supported() {
            Ok(())
        } else {
            Err(JailError::Unsupported("jail(2) is only available on FreeBSD"))
        }
    }

    /// Reads name and path of a jail selected by the `key` entries.
    fn lookup(key: &[(&str, Vec<u8>)]) -> io::Result<JailHandle> {
        let mut iov = JailIov::new();
        for (name, value) in key {
            iov.push(name, value.clone());
        }
        let name_idx = iov.push("name", buffer_for(ParamKind::Str, "name"));
        let path_idx = iov.push("path", buffer_for(ParamKind::Str, "path"));

        let jid = jail_get(&mut iov, 0)?;

        let mut params = JailParams::new();
        for (idx, param) in [(name_idx, "name"), (path_idx, "path")] {
            if let Some(value) = ParamValue::decode(ParamKind::Str, iov.value(idx)) {
                params.set(param, value);
            }
        }
        Ok(JailHandle {
            jid,
            name: params.name().unwrap_or_default().to_string(),
            params,
        })
    }
}

#[async_trait]
impl JailBinding for KernelJails {
    async fn create(&self, params: &JailParams) -> Result<JailHandle, JailError> {
        let name = check_create(params)?;
        Self::ensure_supported()?;

        let mut iov = JailIov::new();
        for param in params.iter() {
            iov.push_param(param);
        }

        let jid = jail_set(&mut iov, JAIL_CREATE)
            .map_err(|source| JailError::Create {
                name: name.clone(),
                source,
            })?;

        tracing::info!(jid, name = %name, "Created jail");
        Ok(JailHandle {
            jid,
            name,
            params: params.clone(),
        })
    }

    async fn set_param(&self, jid: i32, param: &JailParam) -> Result<(), JailError> {
        param.validate()?;
        Self::ensure_supported()?;

        let mut iov = JailIov::new();
        iov.push_param(&JailParam::new("jid", ParamValue::Int(jid)));
        iov.push_param(param);

        jail_set(&mut iov, JAIL_UPDATE).map_err(|source| {
            if source.raw_os_error() == Some(libc::ENOENT) {
                JailError::NotFound(jid)
            } else {
                JailError::Param {
                    name: param.name.clone(),
                    source,
                }
            }
        })?;
        Ok(())
    }

    async fn get_param(&self, jid: i32, name: &str) -> Result<ParamValue, JailError> {
        Self::ensure_supported()?;
        let kind = param_kind(name).ok_or_else(|| JailError::InvalidParam {
            name: name.to_string(),
            reason: "unknown parameter type".to_string(),
        })?;

        let mut iov = JailIov::new();
        iov.push_param(&JailParam::new("jid", ParamValue::Int(jid)));
        let idx = iov.push(name, buffer_for(kind, name));

        jail_get(&mut iov, 0).map_err(|source| {
            if source.raw_os_error() == Some(libc::ENOENT) {
                JailError::NotFound(jid)
            } else {
                JailError::Param {
                    name: name.to_string(),
                    source,
                }
            }
        })?;

        ParamValue::decode(kind, iov.value(idx)).ok_or_else(|| JailError::InvalidParam {
            name: name.to_string(),
            reason: "kernel returned an undecodable value".to_string(),
        })
    }

    async fn find(&self, name: &str) -> Result<Option<JailHandle>, JailError> {
        Self::ensure_supported()?;
        let key = [("name", ParamValue::Str(name.to_string()).encode())];
        match Self::lookup(&key) {
            Ok(handle) => Ok(Some(handle)),
            Err(err) if is_missing(&err) => Ok(None),
            Err(source) => Err(JailError::Param {
                name: "name".to_string(),
                source,
            }),
        }
    }

    async fn list(&self) -> Result<Vec<JailHandle>, JailError> {
        Self::ensure_supported()?;
        let mut jails = Vec::new();
        let mut last = 0;
        loop {
            let key = [("lastjid", ParamValue::Int(last).encode())];
            match Self::lookup(&key) {
                Ok(handle) => {
                    last = handle.jid;
                    jails.push(handle);
                }
                Err(err) if is_missing(&err) => break,
                Err(source) => {
                    return Err(JailError::Param {
                        name: "lastjid".to_string(),
                        source,
                    });
                }
            }
        }
        Ok(jails)
    }

    async fn processes(&self, jid: i32) -> Result<Vec<u32>, JailError> {
        Self::ensure_supported()?;
        jail_processes(jid).map_err(|source| JailError::Param {
            name: "kern.proc".to_string(),
            source,
        })
    }

    async fn remove(&self, jid: i32) -> Result<(), JailError> {
        Self::ensure_supported()?;
        // jail_remove(2) kills whatever is still inside; refuse instead.
        let attached = self.processes(jid).await?.len();
        if attached > 0 {
            return Err(JailError::Busy { jid, attached });
        }
        jail_remove(jid).map_err(|source| {
            if is_missing(&source) {
                JailError::NotFound(jid)
            } else {
                JailError::Remove { jid, source }
            }
        })?;
        tracing::info!(jid, "Removed jail");
        Ok(())
    }

    fn attacher(&self) -> Attacher {
        attach
    }
}
