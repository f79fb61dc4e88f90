//! # squall-runtime
//!
//! Thread-per-core cooperative task runtime for the squall KV store.
//!
//! This crate provides:
//! - Stackful fibers with guard-page protected stacks
//! - A work-stealing scheduler with per-thread private/public queues
//! - A monotonic-time timer manager with tickle semantics
//! - An edge-triggered epoll reactor that resumes fibers on readiness
//! - Cooperative replacements for the blocking syscall surface
//!
//! The pieces interlock: an I/O wrapper that would block suspends its
//! fiber onto the reactor, which may arm a timer, which on expiry posts
//! the fiber back to the scheduler.

pub mod arch;
pub mod config;
pub mod fd;
pub mod fiber;
pub mod hook;
pub mod net;
pub mod reactor;
pub mod scheduler;
pub mod stack;
pub mod thread;
pub mod timer;

// Re-exports
pub use config::RuntimeConfig;
pub use fiber::Fiber;
pub use reactor::{Event, IoReactor};
pub use scheduler::{Scheduler, ANY_THREAD};
pub use timer::{Timer, TimerManager};

// Platform detection: the runtime assumes POSIX readiness multiplexing
// (epoll) and pthread affinity.
cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        // ok
    } else {
        compile_error!("squall-runtime requires Linux (epoll, pthread affinity)");
    }
}

// Architecture detection
cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        pub use arch::x86_64 as current_arch;
    } else if #[cfg(target_arch = "aarch64")] {
        pub use arch::aarch64 as current_arch;
    } else {
        compile_error!("Unsupported architecture");
    }
}
