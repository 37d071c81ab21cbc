use crate::utils::format_timestamp;
use jailrun_container::{ContainerState, Status};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;

pub const OCI_VERSION: &str = "1.0.2";
pub const CORRUPTED_ANNOTATION: &str = "org.jailrun.corrupted";

/// Container state in the shape defined by the OCI runtime spec.
#[derive(Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OciState {
    pub oci_version: &'static str,
    pub id: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub bundle: PathBuf,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl From<&ContainerState> for OciState {
    fn from(state: &ContainerState) -> Self {
        let mut annotations = state.annotations.clone();
        if let Some(reason) = &state.corrupted {
            annotations.insert(CORRUPTED_ANNOTATION.to_string(), reason.clone());
        }

        Self {
            oci_version: OCI_VERSION,
            id: state.id.clone(),
            status: state.status.as_str(),
            pid: match state.status {
                Status::Running => state.pid,
                _ => None,
            },
            bundle: state.bundle.clone(),
            annotations,
        }
    }
}

#[derive(Serialize)]
struct ErrorReport<'a> {
    kind: &'a str,
    message: &'a str,
}

pub fn state_json(state: &ContainerState) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(&OciState::from(state))
}

pub fn list_json(states: &[ContainerState]) -> Result<String, serde_json::Error> {
    let states: Vec<OciState> = states.iter().map(OciState::from).collect();
    serde_json::to_string_pretty(&states)
}

pub fn print_list_table(states: &[ContainerState]) {
    println!(
        "{:<20} {:<8} {:<10} {:<40} {:<30}",
        "ID", "PID", "STATUS", "BUNDLE", "CREATED"
    );

    for state in states {
        let pid = match (state.status, state.pid) {
            (Status::Running, Some(pid)) => pid.to_string(),
            _ => "0".to_string(),
        };
        let status = if state.is_corrupted() {
            "corrupted"
        } else {
            state.status.as_str()
        };

        println!(
            "{:<20} {:<8} {:<10} {:<40} {:<30}",
            state.id,
            pid,
            status,
            state.bundle.display(),
            format_timestamp(&state.created_at)
        );
    }
}

/// Writes `{"kind": ..., "message": ...}` to stderr.
pub fn print_error(kind: &str, message: &str) {
    let report = ErrorReport { kind, message };
    match serde_json::to_string(&report) {
        Ok(line) => eprintln!("{}", line),
        Err(_) => eprintln!("{}: {}", kind, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};

    #[test]
    fn test_oci_state_shape() {
        let mut state = ContainerState::new("c1", PathBuf::from("/bundles/c1"));
        state.status = Status::Running;
        state.pid = Some(42);
        state
            .annotations
            .insert("org.example".to_string(), "x".to_string());

        let value: Value = serde_json::from_str(&state_json(&state).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "ociVersion": "1.0.2",
                "id": "c1",
                "status": "running",
                "pid": 42,
                "bundle": "/bundles/c1",
                "annotations": { "org.example": "x" }
            })
        );
    }

    #[test]
    fn test_stopped_state_hides_pid_and_reports_corruption() {
        let mut state = ContainerState::new("c1", PathBuf::from("/b"));
        state.status = Status::Stopped;
        state.pid = Some(42);
        state.corrupted = Some("jail 3 no longer exists".to_string());

        let oci = OciState::from(&state);
        assert_eq!(oci.pid, None);
        assert_eq!(oci.status, "stopped");
        assert_eq!(
            oci.annotations.get(CORRUPTED_ANNOTATION).map(String::as_str),
            Some("jail 3 no longer exists")
        );
    }
}
