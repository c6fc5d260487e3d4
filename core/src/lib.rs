//! Keeps interactive debugger subprocesses alive between requests and
//! exchanges commands with them over their standard streams.
//!
//! [`DebugBridge`] is the entry point. It owns a [`SessionRegistry`] that
//! maps target pids (and symbolic names resolved to pids) to one
//! [`DebugSession`] each. A session frames every command by the prompt the
//! debugger prints when it is ready, bounds each wait with a deadline, and
//! refuses further commands once a deadline has been missed.

mod bridge;
pub mod config;
pub mod defaults;
pub mod error;
pub mod ops;
pub mod registry;
pub mod session;

pub use bridge::DebugBridge;
pub use config::Config;
pub use error::DebugError;
pub use error::Result;
pub use ops::DebugOperation;
pub use ops::OperationResult;
pub use registry::SessionKey;
pub use registry::SessionRegistry;
pub use session::DebugSession;
pub use session::SessionInfo;
pub use session::SessionState;
pub use session::events::SessionEvent;
pub use session::events::SessionEventKind;
pub use session::target::DebugTarget;
pub use session::target::LaunchRequest;
