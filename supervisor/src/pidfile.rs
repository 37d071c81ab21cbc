use crate::error::SupervisorError;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Writes `pid` to `path` through a temporary file in the same directory, so
/// readers never see a partial file.
pub async fn write_pid_file(path: &Path, pid: u32) -> Result<(), SupervisorError> {
    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::other(format!("invalid pid file path {:?}", path)))?;
    let tmp = path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy()));

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).await?;
    }

    let mut file = fs::File::create(&tmp).await?;
    file.write_all(pid.to_string().as_bytes()).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&tmp, path).await?;

    tracing::debug!(pid, path = %path.display(), "Wrote pid file");
    Ok(())
}
