//! The caller-facing operation set and its translation to debugger commands.

use std::borrow::Cow;

use serde::Deserialize;
use serde::Serialize;

use crate::error::DebugError;
use crate::error::Result;
use crate::session::transcript::has_error_line;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BreakpointLocation {
    Symbol { name: String },
    FileLine { file: String, line: u32 },
    Address { address: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchAccess {
    Read,
    #[default]
    Write,
    ReadWrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    In,
    Over,
    Out,
    Instruction,
    InstructionOver,
}

/// An operation against an attached or launched target. Attach, launch and
/// detach go through [`crate::DebugBridge`] directly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum DebugOperation {
    AddBreakpoint {
        location: BreakpointLocation,
    },
    RemoveBreakpoint {
        id: u32,
    },
    AddWatchpoint {
        expression: String,
        #[serde(default)]
        access: WatchAccess,
    },
    RemoveWatchpoint {
        id: u32,
    },
    /// Resumes the target without waiting for it to stop again.
    Continue,
    /// Halts a running target.
    Interrupt,
    Step {
        kind: StepKind,
    },
    Evaluate {
        expression: String,
    },
    ListThreads,
    SelectThread {
        index: u32,
    },
    ReadMemory {
        address: u64,
        count: usize,
    },
    LookupSymbol {
        query: String,
    },
    LookupAddress {
        address: u64,
    },
    ProcessStatus,
    /// Passes a command line through untouched.
    Raw {
        command: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Wait for the response.
    Wait,
    /// Write and return; the response arrives as unsolicited output.
    FireAndForget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OperationResult {
    /// `false` when the debugger answered with an `error:` line.
    pub success: bool,
    pub output: String,
}

impl OperationResult {
    pub fn from_output(output: String) -> Self {
        Self {
            success: !has_error_line(&output),
            output,
        }
    }

    /// Result of a command whose output was not awaited.
    pub fn dispatched() -> Self {
        Self {
            success: true,
            output: String::new(),
        }
    }
}

impl DebugOperation {
    pub fn dispatch(&self) -> Dispatch {
        match self {
            DebugOperation::Continue => Dispatch::FireAndForget,
            _ => Dispatch::Wait,
        }
    }

    /// Renders the debugger command line for this operation.
    pub fn to_command(&self) -> Result<String> {
        let command = match self {
            DebugOperation::AddBreakpoint { location } => match location {
                BreakpointLocation::Symbol { name } => {
                    format!("breakpoint set --name {}", word(name, "symbol name")?)
                }
                BreakpointLocation::FileLine { file, line } => format!(
                    "breakpoint set --file {} --line {line}",
                    word(file, "file name")?
                ),
                BreakpointLocation::Address { address } => {
                    format!("breakpoint set --address {address:#x}")
                }
            },
            DebugOperation::RemoveBreakpoint { id } => format!("breakpoint delete {id}"),
            DebugOperation::AddWatchpoint { expression, access } => {
                let access = match access {
                    WatchAccess::Read => "read",
                    WatchAccess::Write => "write",
                    WatchAccess::ReadWrite => "read_write",
                };
                format!(
                    "watchpoint set expression --watch {access} -- {}",
                    single_line(expression, "watch expression")?
                )
            }
            DebugOperation::RemoveWatchpoint { id } => format!("watchpoint delete {id}"),
            DebugOperation::Continue => "process continue".to_string(),
            DebugOperation::Interrupt => "process interrupt".to_string(),
            DebugOperation::Step { kind } => match kind {
                StepKind::In => "thread step-in",
                StepKind::Over => "thread step-over",
                StepKind::Out => "thread step-out",
                StepKind::Instruction => "thread step-inst",
                StepKind::InstructionOver => "thread step-inst-over",
            }
            .to_string(),
            DebugOperation::Evaluate { expression } => {
                format!("expression -- {}", single_line(expression, "expression")?)
            }
            DebugOperation::ListThreads => "thread list".to_string(),
            DebugOperation::SelectThread { index } => format!("thread select {index}"),
            DebugOperation::ReadMemory { address, count } => {
                if *count == 0 {
                    return Err(DebugError::invalid_command(
                        "memory read needs a positive byte count",
                    ));
                }
                format!("memory read --count {count} {address:#x}")
            }
            DebugOperation::LookupSymbol { query } => format!(
                "image lookup --regex --symbol {}",
                word(query, "symbol query")?
            ),
            DebugOperation::LookupAddress { address } => {
                format!("image lookup --address {address:#x}")
            }
            DebugOperation::ProcessStatus => "process status".to_string(),
            DebugOperation::Raw { command } => single_line(command, "command")?.to_string(),
        };
        Ok(command)
    }
}

/// A non-empty single-line fragment, passed through as written.
fn single_line<'a>(value: &'a str, what: &str) -> Result<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(DebugError::invalid_command(format!("{what} is empty")));
    }
    if trimmed.contains(['\n', '\r']) {
        return Err(DebugError::invalid_command(format!(
            "{what} must be a single line"
        )));
    }
    Ok(trimmed)
}

/// A single shell-style word, quoted when it contains separators.
fn word(value: &str, what: &str) -> Result<String> {
    let value = single_line(value, what)?;
    shlex::try_quote(value)
        .map(Cow::into_owned)
        .map_err(|err| DebugError::invalid_command(format!("{what} cannot be quoted: {err}")))
}
