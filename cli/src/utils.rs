use chrono::{DateTime, SecondsFormat, Utc};
use std::path::{Path, PathBuf};

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Anchors a relative path at the current directory. Engines hand us paths
/// relative to where they invoked us, and the monitor runs elsewhere.
pub fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_format_timestamp() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        assert_eq!(format_timestamp(&ts), "2024-05-01T12:30:00Z");
    }

    #[test]
    fn test_absolute() {
        assert_eq!(absolute(Path::new("/a/b")).unwrap(), PathBuf::from("/a/b"));
        let rel = absolute(Path::new("x.pid")).unwrap();
        assert!(rel.is_absolute());
        assert!(rel.ends_with("x.pid"));
    }
}
