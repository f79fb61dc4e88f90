//! Stackful cooperative fibers
//!
//! A fiber is one of three things:
//! - the **thread-primordial** fiber, a synthetic handle for the thread's
//!   original stack (created lazily by [`Fiber::current`]),
//! - a **scheduler-primordial** fiber, the fiber running a scheduler loop
//!   on some thread, or
//! - a **worker** fiber with its own guard-paged stack and a user
//!   callback.
//!
//! The counterpart rule: a fiber created with `run_in_scheduler = true`
//! suspends against the scheduler-primordial of its current thread; one
//! created with `false` suspends against the thread-primordial. That one
//! flag is what makes worker fibers fall back into the scheduler loop
//! while free-standing fibers return to plain thread code.

use crate::current_arch::{self, SavedRegs};
use crate::scheduler;
use crate::stack::GuardedStack;
use squall_core::{FiberId, FiberState};
use std::cell::{RefCell, UnsafeCell};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Callback type a worker fiber runs; consumed on entry
pub type FiberFn = Box<dyn FnOnce() + Send>;

thread_local! {
    /// The fiber currently executing on this thread
    static CURRENT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// This thread's primordial fiber
    static THREAD_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };
}

/// Live fiber count across the process
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

/// A stackful cooperative fiber
///
/// Handles are `Arc<Fiber>`; the reactor and scheduler capture handles so
/// a suspended fiber survives until every waiter is done with it.
pub struct Fiber {
    id: FiberId,
    state: AtomicU8,
    regs: UnsafeCell<SavedRegs>,
    stack: Option<GuardedStack>,
    cb: UnsafeCell<Option<FiberFn>>,
    run_in_scheduler: bool,
}

// Safety: `regs` and `cb` are only touched under the execution discipline
// that exactly one thread runs or switches a given fiber at a time (the
// single-RUNNING invariant); everything else is atomic or immutable.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a worker fiber with its own stack
    ///
    /// The fiber starts `Ready`; nothing runs until `resume`.
    ///
    /// # Panics
    ///
    /// Panics if the stack mapping fails: without stacks the runtime
    /// cannot uphold any of its guarantees.
    pub fn new(cb: FiberFn, stack_size: usize, run_in_scheduler: bool) -> Arc<Fiber> {
        let stack = GuardedStack::alloc(stack_size).expect("fiber stack allocation failed");
        let stack_top = stack.top();

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Ready as u8),
            regs: UnsafeCell::new(SavedRegs::default()),
            stack: Some(stack),
            cb: UnsafeCell::new(Some(cb)),
            run_in_scheduler,
        });
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        // Safety: the Arc is not shared yet; the regs cell is exclusively
        // ours. The entry arg is a non-owning pointer; every switch into
        // the fiber happens through an Arc held by the resuming frame.
        unsafe {
            current_arch::init_context(
                fiber.regs.get(),
                stack_top,
                fiber_entry as usize,
                Arc::as_ptr(&fiber) as usize,
            );
        }
        fiber
    }

    /// Build the synthetic fiber for a thread's original stack
    fn new_primordial() -> Arc<Fiber> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Running as u8),
            regs: UnsafeCell::new(SavedRegs::default()),
            stack: None,
            cb: UnsafeCell::new(None),
            run_in_scheduler: false,
        })
    }

    /// The fiber currently running on this thread
    ///
    /// On a thread that has never touched fibers, this creates and
    /// installs the thread-primordial fiber (state `Running`).
    pub fn current() -> Arc<Fiber> {
        if let Some(f) = CURRENT_FIBER.with(|c| c.borrow().clone()) {
            return f;
        }
        let main = Self::new_primordial();
        CURRENT_FIBER.with(|c| *c.borrow_mut() = Some(main.clone()));
        THREAD_FIBER.with(|c| *c.borrow_mut() = Some(main.clone()));
        main
    }

    /// Total live fibers in the process (primordials included)
    pub fn live_count() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub(crate) fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// True for the synthetic per-thread fiber (no owned stack)
    #[inline]
    pub fn is_primordial(&self) -> bool {
        self.stack.is_none()
    }

    #[inline]
    pub fn runs_in_scheduler(&self) -> bool {
        self.run_in_scheduler
    }

    /// The fiber this one suspends against
    fn counterpart(&self) -> Arc<Fiber> {
        if self.run_in_scheduler {
            scheduler::scheduler_fiber()
                .expect("fiber participates in a scheduler but none runs on this thread")
        } else {
            // Ensure the primordial exists even if nothing on this
            // thread asked for it yet
            Fiber::current();
            THREAD_FIBER.with(|c| c.borrow().clone()).unwrap()
        }
    }

    /// Switch into this fiber: READY -> RUNNING
    ///
    /// Must be called from this fiber's counterpart context (the
    /// scheduler loop for participating fibers, plain thread code for
    /// free-standing ones). Returns when the fiber yields or finishes.
    pub fn resume(self: &Arc<Self>) {
        let state = self.state();
        assert!(
            state.is_resumable(),
            "resume of fiber {} in state {}",
            self.id,
            state
        );

        let counterpart = self.counterpart();
        let out_regs = counterpart.regs.get();
        let in_regs = self.regs.get();

        self.set_state(FiberState::Running);
        set_current(Some(self.clone()));

        // Safety: out_regs belongs to the currently-executing context by
        // the counterpart invariant; in_regs was paved by init_context or
        // a previous save. Both Arcs outlive the switch in this frame.
        unsafe {
            current_arch::context_switch(out_regs, in_regs);
        }
        // The fiber suspended or finished; we are the counterpart again.
    }

    /// Suspend the current fiber: RUNNING -> READY, control returns to
    /// its counterpart
    ///
    /// From a primordial fiber (or a thread with no fibers) this is just
    /// an OS-level yield.
    pub fn yield_now() {
        let Some(cur) = CURRENT_FIBER.with(|c| c.borrow().clone()) else {
            std::thread::yield_now();
            return;
        };
        if cur.is_primordial() {
            std::thread::yield_now();
            return;
        }

        if !cur.state().is_finished() {
            cur.set_state(FiberState::Ready);
        }

        let counterpart = cur.counterpart();
        let out_regs = cur.regs.get();
        let in_regs = counterpart.regs.get();
        set_current(Some(counterpart));

        // Safety: we are the executing context for out_regs; in_regs is
        // the suspended counterpart. The TLS slot keeps the counterpart
        // alive; `cur` keeps us alive until this frame resumes and drops.
        unsafe {
            current_arch::context_switch(out_regs, in_regs);
        }
        // Resumed by a later `resume()`.
    }

    /// Repave a finished (or never-started) fiber with a new callback,
    /// reusing its stack
    pub fn reset(self: &Arc<Self>, cb: FiberFn) {
        let stack = self
            .stack
            .as_ref()
            .expect("reset of a primordial fiber");
        let state = self.state();
        assert!(
            state.is_resettable(),
            "reset of fiber {} in state {}",
            self.id,
            state
        );

        // Safety: the fiber is not running (state checked above), so the
        // cells are not aliased by an active context.
        unsafe {
            *self.cb.get() = Some(cb);
            current_arch::init_context(
                self.regs.get(),
                stack.top(),
                fiber_entry as usize,
                Arc::as_ptr(self) as usize,
            );
        }
        self.set_state(FiberState::Ready);
    }
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);
        if self.stack.is_some() {
            let state = self.state();
            debug_assert!(
                state != FiberState::Running,
                "dropping fiber {} while running",
                self.id
            );
        }
    }
}

impl std::fmt::Debug for Fiber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("primordial", &self.is_primordial())
            .finish()
    }
}

/// Replace the current-fiber slot for this thread
pub(crate) fn set_current(fiber: Option<Arc<Fiber>>) {
    CURRENT_FIBER.with(|c| *c.borrow_mut() = fiber);
}

/// The current fiber if one has been installed on this thread
pub(crate) fn current_opt() -> Option<Arc<Fiber>> {
    CURRENT_FIBER.with(|c| c.borrow().clone())
}

/// Entry point executed on the fiber's own stack via the trampoline
///
/// Runs the user callback inside a fault boundary, records the outcome,
/// and performs one final non-returning switch to the counterpart.
extern "C" fn fiber_entry(arg: usize) -> ! {
    // Safety: arg was installed by init_context from a live Arc; the
    // resuming frame holds another Arc for the whole execution.
    let fiber = unsafe { &*(arg as *const Fiber) };

    let cb = unsafe { (*fiber.cb.get()).take() };
    match cb {
        Some(cb) => match panic::catch_unwind(AssertUnwindSafe(cb)) {
            Ok(()) => fiber.set_state(FiberState::Terminated),
            Err(payload) => {
                fiber.set_state(FiberState::Failed);
                let msg = payload
                    .downcast_ref::<&str>()
                    .copied()
                    .or_else(|| payload.downcast_ref::<String>().map(|s| s.as_str()))
                    .unwrap_or("unknown panic");
                log::error!("fiber {} failed: {}", fiber.id, msg);
            }
        },
        None => fiber.set_state(FiberState::Terminated),
    }

    // Final switch out. Nothing owning may remain in this frame: the
    // stack is never unwound, so anything left here would leak.
    let counterpart = fiber.counterpart();
    let out_regs = fiber.regs.get();
    let in_regs = counterpart.regs.get();
    set_current(Some(counterpart));
    unsafe {
        current_arch::context_switch(out_regs, in_regs);
    }
    unreachable!("terminated fiber {} was resumed", fiber.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_primordial_current() {
        let cur = Fiber::current();
        assert!(cur.is_primordial());
        assert_eq!(cur.state(), FiberState::Running);
        // Stable across calls on the same thread
        assert_eq!(cur.id(), Fiber::current().id());
    }

    #[test]
    fn test_run_to_completion() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);

        let fiber = Fiber::new(
            Box::new(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
            64 * 1024,
            false,
        );
        assert_eq!(fiber.state(), FiberState::Ready);

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Terminated);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_yield_roundtrip() {
        let steps = Arc::new(AtomicUsize::new(0));
        let steps2 = Arc::clone(&steps);

        let fiber = Fiber::new(
            Box::new(move || {
                steps2.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_now();
                steps2.fetch_add(1, Ordering::SeqCst);
            }),
            64 * 1024,
            false,
        );

        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Ready);

        fiber.resume();
        assert_eq!(steps.load(Ordering::SeqCst), 2);
        assert_eq!(fiber.state(), FiberState::Terminated);
    }

    #[test]
    fn test_reset_reuses_stack() {
        let fiber = Fiber::new(Box::new(|| {}), 64 * 1024, false);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Terminated);

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        fiber.reset(Box::new(move || {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fiber.state(), FiberState::Ready);

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Terminated);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_panic_marks_failed() {
        let fiber = Fiber::new(
            Box::new(|| {
                panic!("deliberate failure");
            }),
            64 * 1024,
            false,
        );
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Failed);
        // The thread (and its primordial) survived
        assert_eq!(Fiber::current().state(), FiberState::Running);
    }

    #[test]
    fn test_failed_fiber_is_resettable() {
        let fiber = Fiber::new(Box::new(|| panic!("boom")), 64 * 1024, false);
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Failed);

        fiber.reset(Box::new(|| {}));
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Terminated);
    }

    #[test]
    fn test_nested_fibers_interleave() {
        let log = Arc::new(std::sync::Mutex::new(Vec::new()));

        let log_a = Arc::clone(&log);
        let a = Fiber::new(
            Box::new(move || {
                log_a.lock().unwrap().push("a1");
                Fiber::yield_now();
                log_a.lock().unwrap().push("a2");
            }),
            64 * 1024,
            false,
        );

        let log_b = Arc::clone(&log);
        let b = Fiber::new(
            Box::new(move || {
                log_b.lock().unwrap().push("b1");
                Fiber::yield_now();
                log_b.lock().unwrap().push("b2");
            }),
            64 * 1024,
            false,
        );

        a.resume();
        b.resume();
        a.resume();
        b.resume();

        assert_eq!(*log.lock().unwrap(), vec!["a1", "b1", "a2", "b2"]);
    }
}
