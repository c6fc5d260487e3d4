use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DebugError>;

/// Failures surfaced to callers of the bridge.
///
/// Every variant names the target it pertains to so the caller can report it
/// without extra bookkeeping. Timeouts and exits carry whatever output was
/// captured before the failure, which is usually the only clue to what the
/// debugger was doing.
#[derive(Debug, Error)]
pub enum DebugError {
    #[error("failed to launch {executable}: {reason}")]
    LaunchFailure { executable: String, reason: String },

    #[error("failed to attach to pid {pid}: {reason}")]
    AttachFailure { pid: u32, reason: String },

    #[error("session for {target} is busy with another command")]
    SessionBusy { target: String },

    #[error(
        "command `{command}` on {target} timed out after {}ms; the session is no longer usable",
        .timeout.as_millis()
    )]
    CommandTimeout {
        target: String,
        command: String,
        timeout: Duration,
        partial_output: String,
    },

    #[error("debugger for {target} exited")]
    ProcessExited {
        target: String,
        partial_output: String,
    },

    #[error("session for {target} was poisoned by an earlier command that never completed")]
    SessionPoisoned { target: String },

    #[error("unknown identifier `{identifier}`")]
    UnknownIdentifier { identifier: String },

    #[error("invalid command: {reason}")]
    InvalidCommand { reason: String },

    #[error("i/o error while talking to the debugger for {target}: {source}")]
    Io {
        target: String,
        #[source]
        source: std::io::Error,
    },
}

impl DebugError {
    pub(crate) fn launch(executable: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LaunchFailure {
            executable: executable.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn attach(pid: u32, reason: impl Into<String>) -> Self {
        Self::AttachFailure {
            pid,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_command(reason: impl Into<String>) -> Self {
        Self::InvalidCommand {
            reason: reason.into(),
        }
    }

    /// Output captured before a timeout or an unexpected exit.
    pub fn partial_output(&self) -> Option<&str> {
        match self {
            Self::CommandTimeout { partial_output, .. }
            | Self::ProcessExited { partial_output, .. } => Some(partial_output),
            _ => None,
        }
    }

    /// Whether the session that produced this error can still take commands.
    pub fn session_unusable(&self) -> bool {
        matches!(
            self,
            Self::CommandTimeout { .. } | Self::ProcessExited { .. } | Self::SessionPoisoned { .. }
        )
    }
}
