use crate::binding::{Attacher, JailBinding, JailHandle, check_create};
use crate::error::JailError;
use crate::params::{JailParam, JailParams, ParamValue};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

struct MemJail {
    name: String,
    params: JailParams,
    attached: BTreeSet<u32>,
}

#[derive(Default)]
struct Inner {
    next_jid: i32,
    jails: BTreeMap<i32, MemJail>,
    create_calls: usize,
    fail_next_create: Option<i32>,
}

/// Process-local jail table. Behaves like the kernel for everything the
/// lifecycle relies on, and lets callers simulate attached processes and
/// create failures.
#[derive(Default)]
pub struct InMemoryJails {
    inner: Mutex<Inner>,
}

impl InMemoryJails {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Number of `create` invocations so far, failed ones included.
    pub fn create_calls(&self) -> usize {
        self.inner().create_calls
    }

    pub fn jail_count(&self) -> usize {
        self.inner().jails.len()
    }

    /// Makes the next `create` fail with the given errno.
    pub fn fail_next_create(&self, errno: i32) {
        self.inner().fail_next_create = Some(errno);
    }

    /// Treats `pid` as attached to the jail for as long as it lives.
    pub fn hold(&self, jid: i32, pid: u32) -> Result<(), JailError> {
        let mut inner = self.inner();
        let jail = inner.jails.get_mut(&jid).ok_or(JailError::NotFound(jid))?;
        jail.attached.insert(pid);
        Ok(())
    }

    pub fn release(&self, jid: i32, pid: u32) -> Result<(), JailError> {
        let mut inner = self.inner();
        let jail = inner.jails.get_mut(&jid).ok_or(JailError::NotFound(jid))?;
        jail.attached.remove(&pid);
        Ok(())
    }

    /// Drops a jail behind the caller's back, as an operator running
    /// `jail -r` would.
    pub fn forget(&self, jid: i32) -> bool {
        self.inner().jails.remove(&jid).is_some()
    }
}

// Held processes that have exited (and been reaped) leave the jail, as
// they would in the kernel.
fn live(attached: &mut BTreeSet<u32>) -> Vec<u32> {
    attached.retain(|pid| {
        // SAFETY: signal 0 only checks that the pid exists.
        let rc = unsafe { libc::kill(*pid as libc::pid_t, 0) };
        rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
    });
    attached.iter().copied().collect()
}

fn handle(jid: i32, jail: &MemJail) -> JailHandle {
    JailHandle {
        jid,
        name: jail.name.clone(),
        params: jail.params.clone(),
    }
}

#[async_trait]
impl JailBinding for InMemoryJails {
    async fn create(&self, params: &JailParams) -> Result<JailHandle, JailError> {
        let mut inner = self.inner();
        inner.create_calls += 1;

        let name = check_create(params)?;

        if let Some(errno) = inner.fail_next_create.take() {
            return Err(JailError::Create {
                name,
                source: std::io::Error::from_raw_os_error(errno),
            });
        }

        if inner.jails.values().any(|j| j.name == name) {
            return Err(JailError::Create {
                name,
                source: std::io::Error::from_raw_os_error(libc::EEXIST),
            });
        }

        inner.next_jid += 1;
        let jid = inner.next_jid;
        let jail = MemJail {
            name,
            params: params.clone(),
            attached: BTreeSet::new(),
        };
        let created = handle(jid, &jail);
        inner.jails.insert(jid, jail);

        tracing::debug!(jid, name = %created.name, "Created in-memory jail");
        Ok(created)
    }

    async fn set_param(&self, jid: i32, param: &JailParam) -> Result<(), JailError> {
        param.validate()?;
        if param.name == "name" {
            return Err(JailError::InvalidParam {
                name: param.name.clone(),
                reason: "cannot rename a jail".to_string(),
            });
        }
        let mut inner = self.inner();
        let jail = inner.jails.get_mut(&jid).ok_or(JailError::NotFound(jid))?;
        jail.params.set(param.name.clone(), param.value.clone());
        Ok(())
    }

    async fn get_param(&self, jid: i32, name: &str) -> Result<ParamValue, JailError> {
        let inner = self.inner();
        let jail = inner.jails.get(&jid).ok_or(JailError::NotFound(jid))?;
        if name == "jid" {
            return Ok(ParamValue::Int(jid));
        }
        jail.params.get(name).cloned().ok_or_else(|| JailError::Param {
            name: name.to_string(),
            source: std::io::Error::from_raw_os_error(libc::ENOENT),
        })
    }

    async fn find(&self, name: &str) -> Result<Option<JailHandle>, JailError> {
        let inner = self.inner();
        Ok(inner
            .jails
            .iter()
            .find(|(_, jail)| jail.name == name)
            .map(|(jid, jail)| handle(*jid, jail)))
    }

    async fn list(&self) -> Result<Vec<JailHandle>, JailError> {
        let inner = self.inner();
        Ok(inner
            .jails
            .iter()
            .map(|(jid, jail)| handle(*jid, jail))
            .collect())
    }

    async fn processes(&self, jid: i32) -> Result<Vec<u32>, JailError> {
        let mut inner = self.inner();
        let jail = inner.jails.get_mut(&jid).ok_or(JailError::NotFound(jid))?;
        Ok(live(&mut jail.attached))
    }

    async fn remove(&self, jid: i32) -> Result<(), JailError> {
        let mut inner = self.inner();
        let jail = inner.jails.get_mut(&jid).ok_or(JailError::NotFound(jid))?;
        let attached = live(&mut jail.attached).len();
        if attached > 0 {
            return Err(JailError::Busy { jid, attached });
        }
        inner.jails.remove(&jid);
        tracing::debug!(jid, "Removed in-memory jail");
        Ok(())
    }

    fn attacher(&self) -> Attacher {
        |_jid| Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(name: &str) -> JailParams {
        let mut params = JailParams::new();
        params
            .set("name", ParamValue::Str(name.to_string()))
            .set("path", ParamValue::Str("/".to_string()))
            .set("persist", ParamValue::Bool(true));
        params
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let jails = InMemoryJails::new();
        let handle = jails.create(&params("web")).await.unwrap();
        assert_eq!(handle.name, "web");
        assert!(handle.jid > 0);

        let found = jails.find("web").await.unwrap().unwrap();
        assert_eq!(found.jid, handle.jid);
        assert!(jails.find("db").await.unwrap().is_none());
        assert_eq!(jails.list().await.unwrap().len(), 1);
        assert_eq!(jails.create_calls(), 1);
    }

    #[tokio::test]
    async fn test_create_requires_persist() {
        let jails = InMemoryJails::new();
        let mut p = params("web");
        p.set("persist", ParamValue::Bool(false));

        let err = jails.create(&p).await.unwrap_err();
        assert!(matches!(err, JailError::MissingPersist(_)));
        assert_eq!(jails.jail_count(), 0);
    }

    #[tokio::test]
    async fn test_name_collision() {
        let jails = InMemoryJails::new();
        jails.create(&params("web")).await.unwrap();

        let err = jails.create(&params("web")).await.unwrap_err();
        match err {
            JailError::Create { source, .. } => {
                assert_eq!(source.raw_os_error(), Some(libc::EEXIST))
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(jails.jail_count(), 1);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let jails = InMemoryJails::new();
        jails.fail_next_create(libc::EPERM);

        assert!(jails.create(&params("web")).await.is_err());
        assert!(jails.create(&params("web")).await.is_ok());
        assert_eq!(jails.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_remove_busy() {
        let jails = InMemoryJails::new();
        let handle = jails.create(&params("web")).await.unwrap();
        let pid = std::process::id();
        jails.hold(handle.jid, pid).unwrap();
        assert_eq!(jails.processes(handle.jid).await.unwrap(), vec![pid]);

        let err = jails.remove(handle.jid).await.unwrap_err();
        assert!(matches!(err, JailError::Busy { attached: 1, .. }));

        jails.release(handle.jid, pid).unwrap();
        assert!(jails.processes(handle.jid).await.unwrap().is_empty());
        jails.remove(handle.jid).await.unwrap();
        assert!(matches!(
            jails.remove(handle.jid).await,
            Err(JailError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_exited_processes_leave_the_jail() {
        let jails = InMemoryJails::new();
        let handle = jails.create(&params("web")).await.unwrap();

        let mut child = std::process::Command::new("true").spawn().unwrap();
        jails.hold(handle.jid, child.id()).unwrap();
        child.wait().unwrap();

        assert!(jails.processes(handle.jid).await.unwrap().is_empty());
        jails.remove(handle.jid).await.unwrap();
    }

    #[tokio::test]
    async fn test_params() {
        let jails = InMemoryJails::new();
        let handle = jails.create(&params("web")).await.unwrap();

        let param = JailParam::new("securelevel", ParamValue::Int(3));
        jails.set_param(handle.jid, &param).await.unwrap();
        assert_eq!(
            jails.get_param(handle.jid, "securelevel").await.unwrap(),
            ParamValue::Int(3)
        );
        assert!(matches!(
            jails.get_param(handle.jid, "devfs_ruleset").await,
            Err(JailError::Param { .. })
        ));
        assert!(jails.set_param(99, &param).await.is_err());
    }
}
