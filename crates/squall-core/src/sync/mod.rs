//! Synchronization primitives used inside the runtime
//!
//! These are OS-thread-level primitives for the scheduler's own
//! bookkeeping. They must not be held across a fiber suspension point.

mod semaphore;
mod tas;

pub use semaphore::Semaphore;
pub use tas::{TasGuard, TasLock};
