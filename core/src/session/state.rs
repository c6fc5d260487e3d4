use std::fmt;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// No command outstanding; ready for the next one.
    Idle,
    /// Exactly one command is in flight.
    Busy,
    /// A command missed its deadline. The output framing can no longer be
    /// trusted and the session must be replaced.
    Poisoned,
    /// The debugger (or its target) is gone. Absorbing.
    Terminated,
}

impl SessionState {
    pub fn is_usable(self) -> bool {
        matches!(self, SessionState::Idle | SessionState::Busy)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Idle => write!(f, "idle"),
            SessionState::Busy => write!(f, "busy"),
            SessionState::Poisoned => write!(f, "poisoned"),
            SessionState::Terminated => write!(f, "terminated"),
        }
    }
}

struct StateCode;
impl StateCode {
    const IDLE: u8 = 0;
    const BUSY: u8 = 1;
    const POISONED: u8 = 2;
    const TERMINATED: u8 = 3;
}

/// Lock-free holder for [`SessionState`]. Every transition is a single
/// compare-exchange, so racing transitions resolve to exactly one winner.
#[derive(Debug)]
pub(crate) struct StateCell(AtomicU8);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(StateCode::IDLE))
    }

    pub(crate) fn load(&self) -> SessionState {
        decode(self.0.load(Ordering::SeqCst))
    }

    /// `Idle -> Busy`. On failure returns the state that blocked it.
    pub(crate) fn try_begin(&self) -> Result<(), SessionState> {
        self.0
            .compare_exchange(
                StateCode::IDLE,
                StateCode::BUSY,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map(|_| ())
            .map_err(decode)
    }

    /// `Busy -> Idle`.
    pub(crate) fn finish(&self) -> bool {
        self.transition(StateCode::BUSY, StateCode::IDLE)
    }

    /// `Busy -> Poisoned`.
    pub(crate) fn poison(&self) -> bool {
        self.transition(StateCode::BUSY, StateCode::POISONED)
    }

    /// Any state to `Terminated`; returns whether this call made the change.
    pub(crate) fn terminate(&self) -> bool {
        self.0.swap(StateCode::TERMINATED, Ordering::SeqCst) != StateCode::TERMINATED
    }

    fn transition(&self, from: u8, to: u8) -> bool {
        self.0
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

fn decode(code: u8) -> SessionState {
    match code {
        StateCode::IDLE => SessionState::Idle,
        StateCode::BUSY => SessionState::Busy,
        StateCode::POISONED => SessionState::Poisoned,
        _ => SessionState::Terminated,
    }
}
