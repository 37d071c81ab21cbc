use crate::error::LifecycleError;

const MAX_ID_LEN: usize = 1024;

/// Container ids are used as file names and, lightly rewritten, as jail
/// names, so they are restricted to `[A-Za-z0-9_.-]`.
pub fn validate_id(id: &str) -> Result<(), LifecycleError> {
    let invalid = |reason: &str| LifecycleError::InvalidId {
        id: id.to_string(),
        reason: reason.to_string(),
    };

    if id.is_empty() {
        return Err(invalid("empty"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(invalid("longer than 1024 bytes"));
    }
    if id == "." || id == ".." {
        return Err(invalid("reserved name"));
    }
    if let Some(c) = id
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-')))
    {
        return Err(invalid(&format!("character {:?} not allowed", c)));
    }
    Ok(())
}
