//! Error types for the squall runtime

use core::fmt;

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Errors that can occur in runtime operations
#[derive(Debug)]
pub enum RuntimeError {
    /// Stack mmap/mprotect failed
    StackAllocation(std::io::Error),

    /// Worker thread spawn failed
    ThreadSpawn(std::io::Error),

    /// Scheduler already started
    AlreadyStarted,

    /// Scheduler not started
    NotStarted,

    /// Fiber is in a state that forbids the requested transition
    InvalidFiberState,

    /// The direction is already armed on this descriptor
    EventAlreadyArmed { fd: i32 },

    /// epoll / pipe operation failed
    Reactor(std::io::Error),

    /// Invalid configuration value
    InvalidConfig(&'static str),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::StackAllocation(e) => write!(f, "stack allocation failed: {}", e),
            RuntimeError::ThreadSpawn(e) => write!(f, "worker thread spawn failed: {}", e),
            RuntimeError::AlreadyStarted => write!(f, "scheduler already started"),
            RuntimeError::NotStarted => write!(f, "scheduler not started"),
            RuntimeError::InvalidFiberState => write!(f, "invalid fiber state for operation"),
            RuntimeError::EventAlreadyArmed { fd } => {
                write!(f, "event already armed on fd {}", fd)
            }
            RuntimeError::Reactor(e) => write!(f, "reactor operation failed: {}", e),
            RuntimeError::InvalidConfig(msg) => write!(f, "invalid config: {}", msg),
        }
    }
}

impl std::error::Error for RuntimeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RuntimeError::StackAllocation(e)
            | RuntimeError::ThreadSpawn(e)
            | RuntimeError::Reactor(e) => Some(e),
            _ => None,
        }
    }
}

impl RuntimeError {
    /// Build a reactor error from the current errno
    pub fn last_os_error() -> Self {
        RuntimeError::Reactor(std::io::Error::last_os_error())
    }

    /// The raw OS error code, if this error carries one
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            RuntimeError::StackAllocation(e)
            | RuntimeError::ThreadSpawn(e)
            | RuntimeError::Reactor(e) => e.raw_os_error(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = RuntimeError::AlreadyStarted;
        assert_eq!(format!("{}", e), "scheduler already started");

        let e = RuntimeError::EventAlreadyArmed { fd: 7 };
        assert_eq!(format!("{}", e), "event already armed on fd 7");
    }

    #[test]
    fn test_raw_os_error() {
        let e = RuntimeError::Reactor(std::io::Error::from_raw_os_error(libc::EAGAIN));
        assert_eq!(e.raw_os_error(), Some(libc::EAGAIN));
        assert!(RuntimeError::AlreadyStarted.raw_os_error().is_none());
    }
}
