//! # squall - cooperative fiber runtime
//!
//! Thread-per-core execution substrate for the squall KV store: stackful
//! fibers, a work-stealing scheduler with per-thread affinity, a
//! monotonic timer manager, and an edge-triggered epoll reactor that
//! turns synchronous-looking networking code into non-blocking
//! cooperative I/O.
//!
//! ## Quick start
//!
//! ```ignore
//! use squall::{IoReactor, RuntimeConfig, net::TcpListener, sleep_ms};
//! use std::net::Ipv4Addr;
//!
//! fn main() {
//!     let reactor = IoReactor::new(
//!         RuntimeConfig::from_env().threads(4).use_caller(false),
//!     );
//!     reactor.start();
//!
//!     reactor.spawn(|| {
//!         let listener = TcpListener::bind(Ipv4Addr::LOCALHOST, 9000).unwrap();
//!         loop {
//!             let stream = listener.accept().unwrap();
//!             let reactor = squall::current_reactor().unwrap();
//!             reactor.spawn(move || {
//!                 let mut buf = [0u8; 4096];
//!                 loop {
//!                     let n = stream.read(&mut buf);
//!                     if n <= 0 {
//!                         break;
//!                     }
//!                     stream.write_all(&buf[..n as usize]);
//!                 }
//!             });
//!         }
//!     });
//!
//!     // ... serve until shutdown ...
//!     reactor.stop();
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    Storage / Raft / RPC                    │
//! │        spawn(), timers, cooperative net and syscalls       │
//! └────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌────────────────────────────────────────────────────────────┐
//! │  IoReactor: epoll + self-pipe + timer set + fd contexts    │
//! └────────────────────────────────────────────────────────────┘
//!                              │
//!          ┌───────────────────┼───────────────────┐
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │  Caller   │
//!    │ (pinned)  │      │ (pinned)  │      │(optional) │
//!    └───────────┘      └───────────┘      └───────────┘
//!       private + public deque each, work stealing between
//! ```

// Re-export core types
pub use squall_core::{FiberId, FiberState, RuntimeError, RuntimeResult};

// Re-export the runtime surface
pub use squall_runtime::config::RuntimeConfig;
pub use squall_runtime::fiber::Fiber;
pub use squall_runtime::hook::{self, is_hook_enabled, set_hook_enable};
pub use squall_runtime::net;
pub use squall_runtime::reactor::{CancelMarker, Event, IoReactor};
pub use squall_runtime::scheduler::{current_scheduler, worker_index, Scheduler, ANY_THREAD};
pub use squall_runtime::timer::{elapsed_ms, Timer, TimerCallback, TimerManager};

use std::sync::Arc;

/// Reactor bound to the current thread, if it participates in one
pub fn current_reactor() -> Option<Arc<IoReactor>> {
    IoReactor::current()
}

/// The fiber currently running on this thread
pub fn current_fiber() -> Arc<Fiber> {
    Fiber::current()
}

/// Yield the current fiber cooperatively, staying runnable
///
/// Inside a scheduler-run fiber this requeues and suspends; elsewhere it
/// degrades to an OS-level yield.
#[inline]
pub fn yield_now() {
    squall_runtime::reactor::yield_now()
}

/// Suspend the current fiber for at least `ms` milliseconds
///
/// Cooperative when called from a runtime fiber with the hook enabled;
/// otherwise falls back to blocking the thread.
#[inline]
pub fn sleep_ms(ms: u64) {
    let req = libc::timespec {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
    };
    hook::nanosleep(&req);
}

/// Suspend the current fiber for at least `us` microseconds
///
/// Sub-millisecond waits quantize to the timer's millisecond grid.
#[inline]
pub fn sleep_us(us: u64) {
    let req = libc::timespec {
        tv_sec: (us / 1_000_000) as libc::time_t,
        tv_nsec: ((us % 1_000_000) * 1000) as libc::c_long,
    };
    hook::nanosleep(&req);
}
