use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;

use crate::error::DebugError;
use crate::error::Result;

/// Everything needed to start a fresh target under the debugger.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub executable: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Leave the target halted at its entry point instead of resuming it.
    #[serde(default)]
    pub stop_at_entry: bool,
    /// Symbolic name to register for the launched pid.
    #[serde(default)]
    pub bundle_id: Option<String>,
    /// Overrides the startup deadline for the launch commands.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl LaunchRequest {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DebugTarget {
    Attach {
        pid: u32,
        #[serde(default)]
        bundle_id: Option<String>,
    },
    Launch(LaunchRequest),
}

impl DebugTarget {
    pub fn bundle_id(&self) -> Option<&str> {
        match self {
            DebugTarget::Attach { bundle_id, .. } => bundle_id.as_deref(),
            DebugTarget::Launch(request) => request.bundle_id.as_deref(),
        }
    }
}

/// Fails with `AttachFailure` when no process with `pid` exists.
#[cfg(unix)]
pub(crate) fn ensure_process_exists(pid: u32) -> Result<()> {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return Err(DebugError::attach(pid, "pid is out of range"));
    };
    if raw <= 0 {
        return Err(DebugError::attach(pid, "pid must be positive"));
    }
    // SAFETY: signal 0 performs the existence and permission checks only.
    let rc = unsafe { libc::kill(raw, 0) };
    if rc == 0 {
        return Ok(());
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        // The process exists but belongs to someone else; the debugger
        // reports the permission problem itself.
        Some(libc::EPERM) => Ok(()),
        Some(libc::ESRCH) => Err(DebugError::attach(pid, "no such process")),
        _ => Err(DebugError::attach(pid, err.to_string())),
    }
}

#[cfg(not(unix))]
pub(crate) fn ensure_process_exists(pid: u32) -> Result<()> {
    if pid == 0 {
        return Err(DebugError::attach(pid, "pid must be positive"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    #[test]
    fn current_process_exists() {
        assert!(ensure_process_exists(std::process::id()).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn huge_pid_is_rejected() {
        assert_matches!(
            ensure_process_exists(999_999_999),
            Err(DebugError::AttachFailure { pid: 999_999_999, .. })
        );
        assert_matches!(
            ensure_process_exists(0),
            Err(DebugError::AttachFailure { pid: 0, .. })
        );
    }

    #[test]
    fn launch_request_deserializes_with_defaults() {
        let target: DebugTarget = serde_json::from_str(
            r#"{"mode":"launch","executable":"/tmp/app","bundle_id":"com.example.app"}"#,
        )
        .expect("deserialize");
        let DebugTarget::Launch(request) = &target else {
            panic!("expected launch target");
        };
        assert_eq!(request.executable, PathBuf::from("/tmp/app"));
        assert!(!request.stop_at_entry);
        assert_eq!(target.bundle_id(), Some("com.example.app"));
    }
}
