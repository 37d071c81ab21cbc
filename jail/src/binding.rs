use crate::error::JailError;
use crate::params::{JailParam, JailParams, ParamValue};
use async_trait::async_trait;

/// Joins the calling process to a jail. Runs in a forked child before exec,
/// so implementations must stick to async-signal-safe calls.
pub type Attacher = fn(i32) -> std::io::Result<()>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JailHandle {
    pub jid: i32,
    pub name: String,
    pub params: JailParams,
}

#[async_trait]
pub trait JailBinding: Send + Sync {
    /// Creates a jail. The parameter list must carry `persist`, otherwise the
    /// kernel would destroy the jail before anything attaches to it.
    async fn create(&self, params: &JailParams) -> Result<JailHandle, JailError>;

    async fn set_param(&self, jid: i32, param: &JailParam) -> Result<(), JailError>;

    async fn get_param(&self, jid: i32, name: &str) -> Result<ParamValue, JailError>;

    async fn find(&self, name: &str) -> Result<Option<JailHandle>, JailError>;

    async fn list(&self) -> Result<Vec<JailHandle>, JailError>;

    /// Pids of every process attached to the jail.
    async fn processes(&self, jid: i32) -> Result<Vec<u32>, JailError>;

    /// Removes a jail. Fails with [`JailError::Busy`] while processes are
    /// still attached.
    async fn remove(&self, jid: i32) -> Result<(), JailError>;

    fn attacher(&self) -> Attacher;
}

pub(crate) fn check_create(params: &JailParams) -> Result<String, JailError> {
    let name = params
        .name()
        .ok_or_else(|| JailError::InvalidParam {
            name: "name".to_string(),
            reason: "missing".to_string(),
        })?
        .to_string();

    if !params.is_persistent() {
        return Err(JailError::MissingPersist(name));
    }

    for param in params.iter() {
        param.validate()?;
    }

    Ok(name)
}
