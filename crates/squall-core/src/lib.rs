//! # squall-core
//!
//! Core types shared by the squall runtime crates:
//! - Fiber identifiers and state machine
//! - Synchronization primitives (semaphore, test-and-set lock)
//! - Environment-variable configuration helpers
//! - Error types

pub mod env;
pub mod error;
pub mod id;
pub mod state;
pub mod sync;

pub use env::{env_get, env_get_bool, env_get_opt, env_get_str};
pub use error::{RuntimeError, RuntimeResult};
pub use id::FiberId;
pub use state::FiberState;
pub use sync::{Semaphore, TasGuard, TasLock};
