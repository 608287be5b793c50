//! svcmux error types.

use std::fmt;

#[derive(Debug)]
pub enum DispatchError {
    /// The readiness wait failed with an unrecoverable errno.
    WaitFailed(i32),
    /// The wait-set buffer could not be grown to hold the pollable set.
    WaitSetExhausted,
    /// The completion-signal descriptor could not be created.
    SignalSetup(i32),
    /// Rejected configuration value.
    InvalidConfig(&'static str),
    /// The dispatch loop terminated by panicking.
    Panicked,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WaitFailed(e) => write!(f, "readiness wait failed: errno {}", e),
            Self::WaitSetExhausted => write!(f, "wait set allocation failed"),
            Self::SignalSetup(e) => write!(f, "completion signal setup: errno {}", e),
            Self::InvalidConfig(what) => write!(f, "invalid configuration: {}", what),
            Self::Panicked => write!(f, "dispatch loop panicked"),
        }
    }
}

impl std::error::Error for DispatchError {}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_errno() {
        assert_eq!(
            DispatchError::WaitFailed(4).to_string(),
            "readiness wait failed: errno 4"
        );
        assert_eq!(
            DispatchError::SignalSetup(24).to_string(),
            "completion signal setup: errno 24"
        );
    }

    #[test]
    fn test_display_static_variants() {
        assert_eq!(
            DispatchError::WaitSetExhausted.to_string(),
            "wait set allocation failed"
        );
        assert_eq!(DispatchError::Panicked.to_string(), "dispatch loop panicked");
    }
}
