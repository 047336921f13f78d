//! Error handling module for pausable-timer.

use std::fmt;

use thiserror::Error;

use crate::state::TimerState;

/// Custom error type for Timer operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TimerError {
    /// Invalid parameter provided.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// The scheduler could not allocate another timer resource.
    #[error("Timer resources exhausted: {0}")]
    ResourceExhausted(String),

    /// A control operation was issued in a state that does not accept it.
    #[error("Cannot {trigger} a timer in state {from}")]
    InvalidStateTransition {
        from: TimerState,
        trigger: &'static str,
    },

    /// A timer was set up without a callback.
    #[error("Timer callback is missing.")]
    NullCallback,

    /// The underlying scheduler failed to arm, disarm or query a timer.
    #[error("Scheduler backend failure: {0}")]
    BackendFailure(String),

    /// Callback execution failed.
    #[error("Callback execution failed: {0}")]
    CallbackError(String),
}

/// How a callback run went wrong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// The callback returned an error.
    Error(TimerError),
    /// The callback panicked; holds the panic message.
    Panic(String),
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Error(e) => write!(f, "{e}"),
            FailureKind::Panic(message) => write!(f, "panicked: {message}"),
        }
    }
}

/// Report sent on a timer's failure channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackFailure {
    /// Invocation number of the failed run, starting at 1.
    pub invocation: u32,
    pub kind: FailureKind,
}
