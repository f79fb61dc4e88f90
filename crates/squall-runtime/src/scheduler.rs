//! Thread-per-core work-stealing scheduler
//!
//! Each participating thread owns a context with two queues:
//! - a **private** FIFO deque, touched only by the owning thread (it
//!   lives in that thread's TLS, so there is no lock to take), and
//! - a **public** FIFO deque under a mutex, fed by other threads and
//!   raided by thieves from the back.
//!
//! The main loop drains, in order: private queue, one local public task,
//! stolen work from peers, and finally the per-thread idle fiber. Tasks
//! pinned to a thread go only to that thread's public deque and are never
//! stolen.
//!
//! The reactor customizes `tickle`/`idle`/`stopping` by installing a
//! [`SchedulerOps`] trait object; the base behaviors below apply when
//! none is installed.

use crate::config::RuntimeConfig;
use crate::fiber::{Fiber, FiberFn};
use crate::hook;
use crate::thread::{current_tid, num_cpus, pin_current_thread, Thread};
use squall_core::sync::TasLock;
use squall_core::FiberState;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

/// Target-thread value meaning "any participating thread"
pub const ANY_THREAD: isize = -1;

/// A schedulable unit: an existing fiber or a raw callback, plus an
/// optional target thread index
struct Task {
    fiber: Option<Arc<Fiber>>,
    cb: Option<FiberFn>,
    target: isize,
}

impl Task {
    fn from_fiber(fiber: Arc<Fiber>, target: isize) -> Self {
        Task {
            fiber: Some(fiber),
            cb: None,
            target,
        }
    }

    fn from_callback(cb: FiberFn, target: isize) -> Self {
        Task {
            fiber: None,
            cb: Some(cb),
            target,
        }
    }

    /// Defensive check used by queue scans: a fiber task whose fiber is
    /// still RUNNING has not finished saving its context yet
    fn is_takeable(&self) -> bool {
        match &self.fiber {
            Some(f) => f.state() != FiberState::Running,
            None => true,
        }
    }
}

/// Per-thread context owned by the scheduler
///
/// Only the public half lives here; the private deque is thread-local to
/// its owner.
struct ThreadContext {
    public: Mutex<VecDeque<Task>>,
}

impl ThreadContext {
    fn new() -> Self {
        ThreadContext {
            public: Mutex::new(VecDeque::new()),
        }
    }
}

/// Hooks a derived runtime installs to override the scheduler's wait
/// behavior (the reactor plugs epoll in here)
pub(crate) trait SchedulerOps: Send + Sync {
    /// Wake one blocked readiness-wait so queues get re-examined
    fn tickle(&self);

    /// Body of the per-thread idle fiber; must yield between rounds and
    /// return when the runtime may stop
    fn idle(&self);

    /// Stricter stop criterion than the base scheduler's
    fn stopping(&self) -> bool;

    /// Called once on every participating thread as its loop starts
    fn bind_thread(&self);
}

thread_local! {
    /// Scheduler this thread participates in (or last scheduled against)
    static CURRENT_SCHEDULER: RefCell<Option<Weak<Scheduler>>> = const { RefCell::new(None) };

    /// The fiber running this thread's scheduler loop
    static SCHEDULER_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Private task deque; owner-exclusive by construction
    static PRIVATE_QUEUE: RefCell<VecDeque<Task>> = const { RefCell::new(VecDeque::new()) };

    /// Index of the context this thread owns, MAX if not participating
    static WORKER_INDEX: Cell<usize> = const { Cell::new(usize::MAX) };
}

/// Scheduler bound to the current thread, if any
pub fn current_scheduler() -> Option<Arc<Scheduler>> {
    CURRENT_SCHEDULER.with(|s| s.borrow().as_ref().and_then(Weak::upgrade))
}

/// The scheduler-primordial fiber of the current thread
///
/// Worker fibers suspend against this; see the counterpart rule in
/// [`crate::fiber`].
pub(crate) fn scheduler_fiber() -> Option<Arc<Fiber>> {
    SCHEDULER_FIBER.with(|f| f.borrow().clone())
}

/// Context index owned by the current thread, if it participates
pub fn worker_index() -> Option<usize> {
    let idx = WORKER_INDEX.with(|i| i.get());
    (idx != usize::MAX).then_some(idx)
}

fn set_current_scheduler(sched: &Arc<Scheduler>) {
    CURRENT_SCHEDULER.with(|s| *s.borrow_mut() = Some(Arc::downgrade(sched)));
}

/// Thread-per-core cooperative scheduler
pub struct Scheduler {
    name: String,
    config: RuntimeConfig,
    /// One per participating thread; workers own 0..worker_count, the
    /// caller (if included) owns the last slot
    contexts: Vec<ThreadContext>,
    /// Spawned worker threads (excludes the caller)
    threads: Mutex<Vec<Thread>>,
    worker_count: usize,
    use_caller: bool,
    /// Scheduler-primordial fiber for the caller thread; held only for
    /// the instants start/stop swap it in and out
    caller_fiber: TasLock<Option<Arc<Fiber>>>,
    caller_tid: AtomicI32,
    /// Threads currently executing a task
    active: AtomicUsize,
    /// Threads parked in their idle fiber
    idle_threads: AtomicUsize,
    stop_flag: AtomicBool,
    started: AtomicBool,
    round_robin: AtomicUsize,
    ops: OnceLock<Weak<dyn SchedulerOps>>,
}

impl Scheduler {
    /// Create a scheduler for `config.threads` participating threads
    ///
    /// With `use_caller`, the thread that later calls [`start`] counts as
    /// one of them, so one fewer OS thread is spawned.
    ///
    /// # Panics
    ///
    /// Panics on invalid configuration.
    pub fn new(config: RuntimeConfig) -> Arc<Scheduler> {
        config.validate().expect("invalid runtime configuration");

        let use_caller = config.use_caller;
        let worker_count = if use_caller {
            config.threads - 1
        } else {
            config.threads
        };
        let context_count = worker_count + usize::from(use_caller);

        Arc::new(Scheduler {
            name: config.name.clone(),
            contexts: (0..context_count).map(|_| ThreadContext::new()).collect(),
            threads: Mutex::new(Vec::new()),
            worker_count,
            use_caller,
            caller_fiber: TasLock::new(None),
            caller_tid: AtomicI32::new(0),
            active: AtomicUsize::new(0),
            idle_threads: AtomicUsize::new(0),
            stop_flag: AtomicBool::new(false),
            started: AtomicBool::new(false),
            round_robin: AtomicUsize::new(0),
            ops: OnceLock::new(),
            config,
        })
    }

    /// Install the override hooks; done by the reactor before `start`
    pub(crate) fn install_ops(&self, ops: Weak<dyn SchedulerOps>) {
        if self.ops.set(ops).is_err() {
            panic!("scheduler ops installed twice");
        }
    }

    fn ops(&self) -> Option<Arc<dyn SchedulerOps>> {
        self.ops.get().and_then(Weak::upgrade)
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub(crate) fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    /// Number of participating threads (workers + caller if included)
    #[inline]
    pub fn thread_count(&self) -> usize {
        self.contexts.len()
    }

    /// Context index the caller thread owns, if it participates
    pub fn caller_index(&self) -> Option<usize> {
        self.use_caller.then_some(self.worker_count)
    }

    /// Spawn worker threads and, in caller mode, prepare the caller's
    /// scheduler-primordial fiber
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::SeqCst) {
            log::warn!("{}: start() on a running scheduler ignored", self.name);
            return;
        }
        self.stop_flag.store(false, Ordering::Release);

        let cores = num_cpus();

        if self.use_caller {
            // The caller thread becomes a participant: it needs the fiber
            // machinery plus a scheduler-primordial bound to run(). The
            // fiber is free-standing so that when run() drains and exits,
            // control lands back in stop().
            Fiber::current();
            set_current_scheduler(self);
            self.caller_tid.store(current_tid(), Ordering::Release);

            let weak = Arc::downgrade(self);
            let index = self.worker_count;
            let caller = Fiber::new(
                Box::new(move || {
                    if let Some(sched) = weak.upgrade() {
                        sched.run(index);
                    }
                }),
                self.config.stack_size,
                false,
            );
            *self.caller_fiber.lock() = Some(caller);

            if self.config.pin_cores {
                let core = (self.config.core_offset
                    + self.worker_count * self.config.core_stride)
                    % cores;
                pin_current_thread(core, &self.name);
            }
        }

        let mut threads = self.threads.lock().unwrap();
        for i in 0..self.worker_count {
            let sched = Arc::clone(self);
            let cpu = self
                .config
                .pin_cores
                .then(|| (self.config.core_offset + i * self.config.core_stride) % cores);
            let name = format!("{}_{}", self.name, i);
            let t = Thread::spawn(&name, cpu, move || sched.run(i))
                .expect("worker thread spawn failed");
            threads.push(t);
        }
        log::info!(
            "{}: started, {} workers{}",
            self.name,
            self.worker_count,
            if self.use_caller { " + caller" } else { "" }
        );
    }

    /// Two-phase shutdown: raise the stop flag, tickle every waiter, let
    /// the caller's scheduler fiber drain (caller mode), then join
    ///
    /// Must be called from the thread that called `start()` when the
    /// caller participates.
    pub fn stop(self: &Arc<Self>) {
        if self.check_stopping() {
            return;
        }
        self.stop_flag.store(true, Ordering::SeqCst);

        if self.use_caller {
            assert_eq!(
                self.caller_tid.load(Ordering::Acquire),
                current_tid(),
                "stop() must run on the scheduler's caller thread"
            );
        }

        for _ in 0..self.worker_count {
            self.tickle();
        }

        let caller = self.caller_fiber.lock().take();
        if caller.is_some() {
            self.tickle();
        }
        if let Some(cf) = caller {
            // Enter the scheduler loop on this thread to help drain;
            // returns when stopping() holds
            if !self.check_stopping() {
                cf.resume();
            }
        }

        let threads = std::mem::take(&mut *self.threads.lock().unwrap());
        for mut t in threads {
            t.join();
        }
        self.started.store(false, Ordering::Release);
        log::info!("{}: stopped", self.name);
    }

    /// Schedule a callback on any participating thread
    pub fn schedule<F>(self: &Arc<Self>, cb: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task::from_callback(Box::new(cb), ANY_THREAD));
    }

    /// Schedule a callback, optionally pinned to a thread index
    pub fn schedule_to<F>(self: &Arc<Self>, cb: F, target: isize)
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Task::from_callback(Box::new(cb), target));
    }

    /// Schedule an existing fiber, optionally pinned to a thread index
    pub fn schedule_fiber(self: &Arc<Self>, fiber: Arc<Fiber>, target: isize) {
        self.submit(Task::from_fiber(fiber, target));
    }

    /// Resolve a target context and enqueue
    ///
    /// Pinned tasks go to their thread's public deque. Unpinned tasks
    /// round-robin; when the resolved context is the submitting thread's
    /// own, the task takes the lock-free private path and no tickle is
    /// needed (the owner rescans on its next loop iteration).
    fn submit(self: &Arc<Self>, mut task: Task) {
        let n = self.contexts.len();
        let index = match task.target {
            t if t >= 0 && (t as usize) < n => t as usize,
            t if t >= 0 => {
                // Out-of-range pin: deterministic round-robin fallback,
                // and the pin no longer names a real thread so it is
                // dropped
                debug_assert!(false, "schedule target {} out of range ({})", t, n);
                task.target = ANY_THREAD;
                self.round_robin.fetch_add(1, Ordering::Relaxed) % n
            }
            _ => self.round_robin.fetch_add(1, Ordering::Relaxed) % n,
        };

        let is_own = WORKER_INDEX.with(|i| i.get()) == index
            && current_scheduler().is_some_and(|s| Arc::ptr_eq(&s, self));

        if is_own {
            PRIVATE_QUEUE.with(|q| q.borrow_mut().push_back(task));
        } else {
            self.contexts[index].public.lock().unwrap().push_back(task);
            self.tickle();
        }
    }

    /// Main loop, run by every participating thread
    fn run(self: &Arc<Self>, index: usize) {
        log::debug!("{}: loop start, context {}", self.name, index);
        hook::set_hook_enable(true);
        set_current_scheduler(self);
        WORKER_INDEX.with(|i| i.set(index));

        // This fiber (a thread primordial on workers, the caller fiber on
        // the caller thread) is the scheduler-primordial everything on
        // this thread yields back to.
        let main_fiber = Fiber::current();
        SCHEDULER_FIBER.with(|f| *f.borrow_mut() = Some(main_fiber));

        if let Some(ops) = self.ops() {
            ops.bind_thread();
        }

        let weak = Arc::downgrade(self);
        let idle_fiber = Fiber::new(
            Box::new(move || {
                if let Some(sched) = weak.upgrade() {
                    sched.idle_entry();
                }
            }),
            self.config.stack_size,
            true,
        );

        // Reusable fiber for plain-callback tasks; repaved per task
        let mut cb_fiber: Option<Arc<Fiber>> = None;

        loop {
            let mut tickle_peers = false;

            let task = PRIVATE_QUEUE
                .with(|q| q.borrow_mut().pop_front())
                .inspect(|_| {
                    self.active.fetch_add(1, Ordering::SeqCst);
                })
                .or_else(|| self.take_public(index, &mut tickle_peers))
                .or_else(|| self.steal(index));

            if tickle_peers {
                self.tickle();
            }

            match task {
                Some(task) => self.run_task(task, &mut cb_fiber),
                None => {
                    if idle_fiber.state() == FiberState::Terminated {
                        log::debug!("{}: idle fiber done, loop exit", self.name);
                        break;
                    }
                    self.idle_threads.fetch_add(1, Ordering::SeqCst);
                    idle_fiber.resume();
                    self.idle_threads.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }

        SCHEDULER_FIBER.with(|f| *f.borrow_mut() = None);
        log::debug!("{}: loop exit, context {}", self.name, index);
    }

    /// Take one task from this thread's public deque
    ///
    /// Raises the active count under the lock so `stopping()` cannot
    /// observe the task as neither queued nor running.
    fn take_public(&self, index: usize, tickle_peers: &mut bool) -> Option<Task> {
        let mut q = self.contexts[index].public.lock().unwrap();
        let pos = q.iter().position(Task::is_takeable)?;
        let task = q.remove(pos);
        self.active.fetch_add(1, Ordering::SeqCst);
        *tickle_peers = !q.is_empty();
        task
    }

    /// Raid peers' public deques from the back; pinned tasks stay put
    fn steal(&self, index: usize) -> Option<Task> {
        for (j, ctx) in self.contexts.iter().enumerate() {
            if j == index {
                continue;
            }
            let mut q = ctx.public.lock().unwrap();
            if let Some(pos) = q
                .iter()
                .rposition(|t| t.target == ANY_THREAD && t.is_takeable())
            {
                let task = q.remove(pos);
                self.active.fetch_add(1, Ordering::SeqCst);
                return task;
            }
        }
        None
    }

    /// Execute one task; the caller already raised the active count
    fn run_task(self: &Arc<Self>, task: Task, cb_fiber: &mut Option<Arc<Fiber>>) {
        if let Some(f) = task.fiber {
            match f.state() {
                FiberState::Ready => f.resume(),
                FiberState::Running => {
                    // Context save still in flight on another thread;
                    // requeue and let the next iteration retry
                    PRIVATE_QUEUE
                        .with(|q| q.borrow_mut().push_back(Task::from_fiber(f, task.target)));
                }
                _ => {} // finished fibers are dropped
            }
        } else if let Some(cb) = task.cb {
            let fiber = match cb_fiber.take() {
                Some(f) => {
                    f.reset(cb);
                    f
                }
                None => Fiber::new(cb, self.config.stack_size, true),
            };
            fiber.resume();
            if fiber.state().is_finished() {
                // Callback ran to completion; the paved closure is gone
                // and the stack can host the next one
                *cb_fiber = Some(fiber);
            }
            // A suspended callback fiber belongs to whoever captured its
            // handle (reactor, timer); the next task pays one allocation.
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    /// Idle fiber body: dispatch to the installed ops, or busy-yield
    fn idle_entry(self: &Arc<Self>) {
        if let Some(ops) = self.ops() {
            ops.idle();
            return;
        }
        log::debug!("{}: enter base idle", self.name);
        loop {
            if self.base_stopping() {
                break;
            }
            Fiber::yield_now();
        }
    }

    /// Wake blocked waiters; a no-op until the reactor overrides it
    pub(crate) fn tickle(&self) {
        if let Some(ops) = self.ops() {
            ops.tickle();
        }
    }

    /// Stop criterion with any installed override applied
    fn check_stopping(&self) -> bool {
        match self.ops() {
            Some(ops) => ops.stopping(),
            None => self.base_stopping(),
        }
    }

    /// Base stop criterion: flag raised, no queued work, nothing running
    pub(crate) fn base_stopping(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
            && self.active.load(Ordering::SeqCst) == 0
            && self
                .contexts
                .iter()
                .all(|c| c.public.lock().unwrap().is_empty())
    }

    /// Whether `stop()` has been requested
    #[inline]
    pub fn stop_requested(&self) -> bool {
        self.stop_flag.load(Ordering::Acquire)
    }

    /// Whether any participating thread is parked in its idle fiber
    #[inline]
    pub(crate) fn has_idle_threads(&self) -> bool {
        self.idle_threads.load(Ordering::SeqCst) > 0
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("name", &self.name)
            .field("workers", &self.worker_count)
            .field("use_caller", &self.use_caller)
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn test_config(threads: usize, use_caller: bool) -> RuntimeConfig {
        RuntimeConfig::new()
            .threads(threads)
            .use_caller(use_caller)
            .pin_cores(false)
            .name("sched-test")
    }

    fn wait_for(count: &Arc<AtomicUsize>, expected: usize) {
        for _ in 0..2000 {
            if count.load(Ordering::SeqCst) == expected {
                return;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!(
            "expected {} completions, saw {}",
            expected,
            count.load(Ordering::SeqCst)
        );
    }

    #[test]
    fn test_callbacks_run() {
        let sched = Scheduler::new(test_config(2, false));
        sched.start();

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let count = Arc::clone(&count);
            sched.schedule(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        wait_for(&count, 100);
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn test_pinned_tasks_stay_on_target() {
        let sched = Scheduler::new(test_config(3, false));
        sched.start();

        let count = Arc::new(AtomicUsize::new(0));
        let wrong = Arc::new(AtomicUsize::new(0));
        for _ in 0..500 {
            let count = Arc::clone(&count);
            let wrong = Arc::clone(&wrong);
            sched.schedule_to(
                move || {
                    if worker_index() != Some(0) {
                        wrong.fetch_add(1, Ordering::SeqCst);
                    }
                    count.fetch_add(1, Ordering::SeqCst);
                },
                0,
            );
        }

        wait_for(&count, 500);
        sched.stop();
        assert_eq!(wrong.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_use_caller_drains_on_stop() {
        let sched = Scheduler::new(test_config(1, true));
        sched.start();

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..50 {
            let count = Arc::clone(&count);
            sched.schedule(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        // The only participant is the caller; work happens in stop()
        sched.stop();
        assert_eq!(count.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_fiber_task_resumes() {
        let sched = Scheduler::new(test_config(1, false));
        sched.start();

        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let fiber = Fiber::new(
            Box::new(move || {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
            64 * 1024,
            true,
        );
        sched.schedule_fiber(fiber, ANY_THREAD);

        wait_for(&count, 1);
        sched.stop();
    }

    #[test]
    fn test_out_of_range_pin_falls_back() {
        let sched = Scheduler::new(test_config(2, false));
        sched.start();

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = Arc::clone(&count);
            // Release builds route this through round-robin
            #[cfg(not(debug_assertions))]
            sched.schedule_to(
                move || {
                    count.fetch_add(1, Ordering::SeqCst);
                },
                99,
            );
            #[cfg(debug_assertions)]
            sched.schedule(move || {
                count.fetch_add(1, Ordering::SeqCst);
            });
        }

        wait_for(&count, 10);
        sched.stop();
    }

    #[test]
    fn test_steals_unpinned_from_peer_public_queue() {
        let sched = Scheduler::new(test_config(4, false));
        sched.start();

        let done = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(std::collections::HashSet::new()));

        // Load one worker's public deque directly; the others must raid
        // it from the back
        {
            let mut q = sched.contexts[0].public.lock().unwrap();
            for _ in 0..200 {
                let done = Arc::clone(&done);
                let seen = Arc::clone(&seen);
                q.push_back(Task::from_callback(
                    Box::new(move || {
                        if let Some(idx) = worker_index() {
                            seen.lock().unwrap().insert(idx);
                        }
                        std::thread::sleep(Duration::from_millis(1));
                        done.fetch_add(1, Ordering::SeqCst);
                    }),
                    ANY_THREAD,
                ));
            }
        }

        wait_for(&done, 200);
        sched.stop();
        assert!(
            seen.lock().unwrap().len() >= 2,
            "no thief ever took work from the loaded queue"
        );
    }

    #[test]
    fn test_fifo_order_per_pinned_thread() {
        let sched = Scheduler::new(test_config(2, false));
        sched.start();

        let order = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(AtomicUsize::new(0));
        for i in 0..100 {
            let order = Arc::clone(&order);
            let done = Arc::clone(&done);
            sched.schedule_to(
                move || {
                    order.lock().unwrap().push(i);
                    done.fetch_add(1, Ordering::SeqCst);
                },
                1,
            );
        }

        wait_for(&done, 100);
        sched.stop();
        let order = order.lock().unwrap();
        assert_eq!(*order, (0..100).collect::<Vec<_>>());
    }
}
