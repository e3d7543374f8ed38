//! Errors visible to host code.
//!
//! Script exceptions and marshaling failures are kept apart so callers can
//! tell whether the engine threw or the bridge refused a conversion.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum HostError {
    /// Host-side type misuse, e.g. calling a value that is not callable.
    #[error("TypeError: {0}")]
    Type(String),

    /// An exception thrown by script and captured at the engine boundary.
    #[error("{name}: {message}")]
    Script { name: String, message: String },

    /// The bridge could not convert a value between the two runtimes.
    #[error("cannot marshal {kind}: {reason}")]
    Marshal { kind: String, reason: String },

    /// The engine failed without a script exception (released handle, no runtime).
    #[error("engine error: {0}")]
    Engine(String),
}

impl HostError {
    pub fn marshal(kind: impl Into<String>, reason: impl Into<String>) -> Self {
        HostError::Marshal {
            kind: kind.into(),
            reason: reason.into(),
        }
    }

    pub fn script(name: impl Into<String>, message: impl Into<String>) -> Self {
        HostError::Script {
            name: name.into(),
            message: message.into(),
        }
    }

    /// True for errors that originated as a script exception.
    pub fn is_script(&self) -> bool {
        matches!(self, HostError::Script { .. })
    }
}

pub type HostResult<T> = Result<T, HostError>;
