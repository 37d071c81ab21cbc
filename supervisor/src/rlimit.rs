//! Resource limits for the init process.
//!
//! Limits are resolved to raw `(resource, rlimit)` pairs before fork so the
//! child only has to call `setrlimit(2)`.

use jailrun_spec::{Rlimit, RlimitKind};

#[cfg(target_os = "linux")]
pub(crate) type RlimitResource = libc::__rlimit_resource_t;
#[cfg(not(target_os = "linux"))]
pub(crate) type RlimitResource = libc::c_int;

#[derive(Clone, Copy)]
pub(crate) struct RawRlimit {
    pub resource: RlimitResource,
    pub limit: libc::rlimit,
}

/// The platform's resource number, if it has one.
pub(crate) fn resource(kind: RlimitKind) -> Option<RlimitResource> {
    let resource = match kind {
        RlimitKind::RlimitCpu => libc::RLIMIT_CPU,
        RlimitKind::RlimitFsize => libc::RLIMIT_FSIZE,
        RlimitKind::RlimitData => libc::RLIMIT_DATA,
        RlimitKind::RlimitStack => libc::RLIMIT_STACK,
        RlimitKind::RlimitCore => libc::RLIMIT_CORE,
        RlimitKind::RlimitRss => libc::RLIMIT_RSS,
        RlimitKind::RlimitMemlock => libc::RLIMIT_MEMLOCK,
        RlimitKind::RlimitNproc => libc::RLIMIT_NPROC,
        RlimitKind::RlimitNofile => libc::RLIMIT_NOFILE,
        RlimitKind::RlimitAs => libc::RLIMIT_AS,
        #[cfg(target_os = "freebsd")]
        RlimitKind::RlimitSbsize => libc::RLIMIT_SBSIZE,
        #[cfg(target_os = "freebsd")]
        RlimitKind::RlimitNpts => libc::RLIMIT_NPTS,
        #[cfg(target_os = "freebsd")]
        RlimitKind::RlimitSwap => libc::RLIMIT_SWAP,
        #[cfg(target_os = "freebsd")]
        RlimitKind::RlimitKqueues => libc::RLIMIT_KQUEUES,
        #[cfg(target_os = "freebsd")]
        RlimitKind::RlimitUmtxp => libc::RLIMIT_UMTXP,
        #[allow(unreachable_patterns)]
        _ => return None,
    };
    Some(resource)
}

pub(crate) fn resolve(limits: &[Rlimit]) -> Vec<RawRlimit> {
    limits
        .iter()
        .filter_map(|limit| match resource(limit.kind) {
            Some(resource) => Some(RawRlimit {
                resource,
                limit: libc::rlimit {
                    rlim_cur: limit.soft as libc::rlim_t,
                    rlim_max: limit.hard as libc::rlim_t,
                },
            }),
            None => {
                tracing::warn!(kind = ?limit.kind, "Resource limit not available on this platform");
                None
            }
        })
        .collect()
}

/// Applies resolved limits. Async-signal-safe; returns the raw errno.
pub(crate) fn apply_raw(limits: &[RawRlimit]) -> Result<(), i32> {
    for raw in limits {
        // SAFETY: setrlimit only reads the struct we pass.
        if unsafe { libc::setrlimit(raw.resource, &raw.limit) } != 0 {
            return Err(std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EINVAL));
        }
    }
    Ok(())
}
