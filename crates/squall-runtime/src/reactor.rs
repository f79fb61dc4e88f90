//! Edge-triggered epoll reactor
//!
//! Extends the scheduler with readiness-driven wakeups. Each worker's
//! idle fiber blocks in `epoll_wait` with a timeout equal to the next
//! timer deadline (capped), drains expired timers into the scheduler,
//! dispatches ready descriptors, and yields back to the scheduler loop.
//!
//! A one-byte write to a self-pipe ("tickle") interrupts the wait so a
//! blocked worker notices newly posted work, a new front timer, or the
//! stop flag.

use crate::config::{RuntimeConfig, MAX_EVENT_BATCH, MAX_IDLE_TIMEOUT_MS};
use crate::fiber::{self, Fiber, FiberFn};
use crate::scheduler::{Scheduler, SchedulerOps, ANY_THREAD};
use crate::timer::{Timer, TimerCallback, TimerManager, NO_TIMER};
use squall_core::error::{RuntimeError, RuntimeResult};
use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Shared cancellation marker between a suspended waiter and whoever
/// cancels it
///
/// Zero means "not cancelled"; a cancelling agent stamps an errno value
/// (`ETIMEDOUT`) that the woken fiber reads to tell cancellation from
/// readiness.
pub type CancelMarker = Arc<AtomicI32>;

bitflags::bitflags! {
    /// Readiness directions, numerically aligned with epoll
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Event: u32 {
        const READ = libc::EPOLLIN as u32;
        const WRITE = libc::EPOLLOUT as u32;
    }
}

/// What to run when a direction fires: the armed scheduler plus either a
/// suspended fiber or a callback, and the waiter's cancellation marker
#[derive(Default)]
struct EventContext {
    scheduler: Option<Weak<Scheduler>>,
    fiber: Option<Arc<Fiber>>,
    cb: Option<FiberFn>,
    marker: Option<Weak<AtomicI32>>,
}

impl EventContext {
    fn is_clean(&self) -> bool {
        self.scheduler.is_none() && self.fiber.is_none() && self.cb.is_none()
    }
}

/// Mutable half of a descriptor's reactor state
struct FdInner {
    events: Event,
    read: EventContext,
    write: EventContext,
}

/// Per-descriptor reactor context
///
/// Invariant: a direction is armed iff its bit is set in `events` iff its
/// event context holds a scheduler reference; firing clears the bit
/// atomically with dispatch (both happen under the context mutex).
pub struct FdContext {
    fd: RawFd,
    inner: Mutex<FdInner>,
}

impl FdContext {
    fn new(fd: RawFd) -> Arc<FdContext> {
        Arc::new(FdContext {
            fd,
            inner: Mutex::new(FdInner {
                events: Event::empty(),
                read: EventContext::default(),
                write: EventContext::default(),
            }),
        })
    }
}

thread_local! {
    /// Reactor bound to this participating thread
    static CURRENT_REACTOR: RefCell<Option<Weak<IoReactor>>> = const { RefCell::new(None) };
}

/// Scheduler + timer manager + epoll: the full cooperative I/O runtime
pub struct IoReactor {
    sched: Arc<Scheduler>,
    timers: Arc<TimerManager>,
    epfd: RawFd,
    /// Self-pipe; [0] is epoll-registered for readable edges, [1] takes
    /// the tickle bytes
    tickle_fds: [RawFd; 2],
    /// Armed directions not yet fired; in-flight work for shutdown
    pending: AtomicUsize,
    /// FD-indexed contexts, resized geometrically on first touch of a
    /// higher descriptor
    fd_contexts: RwLock<Vec<Arc<FdContext>>>,
    me: Weak<IoReactor>,
}

impl IoReactor {
    /// Build a reactor and its scheduler from `config`
    ///
    /// # Panics
    ///
    /// Panics if epoll or self-pipe setup fails: the runtime cannot
    /// uphold any liveness guarantee without its readiness facility.
    pub fn new(config: RuntimeConfig) -> Arc<IoReactor> {
        let sched = Scheduler::new(config);
        let timers = TimerManager::new();

        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        assert!(
            epfd >= 0,
            "epoll_create1 failed: {}",
            std::io::Error::last_os_error()
        );

        let mut pipe_fds = [0 as RawFd; 2];
        let rc = unsafe { libc::pipe2(pipe_fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(
            rc,
            0,
            "self-pipe creation failed: {}",
            std::io::Error::last_os_error()
        );

        // Register the read end for edge-triggered readability; the idle
        // loop drains it to EAGAIN on every wake
        let mut ev = libc::epoll_event {
            events: (libc::EPOLLIN | libc::EPOLLET) as u32,
            u64: pipe_fds[0] as u64,
        };
        let rc = unsafe { libc::epoll_ctl(epfd, libc::EPOLL_CTL_ADD, pipe_fds[0], &mut ev) };
        assert_eq!(
            rc,
            0,
            "epoll registration of self-pipe failed: {}",
            std::io::Error::last_os_error()
        );

        let reactor = Arc::new_cyclic(|me: &Weak<IoReactor>| IoReactor {
            sched: sched.clone(),
            timers: timers.clone(),
            epfd,
            tickle_fds: pipe_fds,
            pending: AtomicUsize::new(0),
            fd_contexts: RwLock::new((0..32).map(|fd| FdContext::new(fd as RawFd)).collect()),
            me: me.clone(),
        });

        let ops: Weak<dyn SchedulerOps> = reactor.me.clone();
        sched.install_ops(ops);

        let weak = reactor.me.clone();
        timers.set_front_notify(Box::new(move || {
            // A new earliest deadline: interrupt the readiness wait so
            // the block timeout is recomputed
            if let Some(r) = weak.upgrade() {
                r.tickle();
            }
        }));

        reactor
    }

    /// Reactor bound to the current thread, if any
    pub fn current() -> Option<Arc<IoReactor>> {
        CURRENT_REACTOR.with(|r| r.borrow().as_ref().and_then(Weak::upgrade))
    }

    /// Start worker threads; also binds this (caller) thread so syscall
    /// shims on it can reach the reactor
    pub fn start(self: &Arc<Self>) {
        CURRENT_REACTOR.with(|r| *r.borrow_mut() = Some(self.me.clone()));
        self.sched.start();
    }

    /// Drain and join; see [`Scheduler::stop`] for the two-phase shape
    pub fn stop(self: &Arc<Self>) {
        self.sched.stop();
    }

    #[inline]
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.sched
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        self.sched.config()
    }

    /// Schedule a callback as a worker fiber on any thread
    pub fn spawn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.schedule(f);
    }

    /// Schedule a callback pinned to a thread index
    pub fn spawn_to<F>(&self, f: F, target: isize)
    where
        F: FnOnce() + Send + 'static,
    {
        self.sched.schedule_to(f, target);
    }

    /// Schedule an existing fiber
    pub fn spawn_fiber(&self, fiber: Arc<Fiber>, target: isize) {
        self.sched.schedule_fiber(fiber, target);
    }

    /// Register a timer firing `ms` from now
    pub fn add_timer(&self, ms: u64, cb: TimerCallback, recurring: bool) -> Arc<Timer> {
        self.timers.add_timer(ms, cb, recurring)
    }

    /// Register a timer gated on a weak guard; see
    /// [`TimerManager::add_condition_timer`]
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        &self,
        ms: u64,
        cb: TimerCallback,
        guard: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer> {
        self.timers.add_condition_timer(ms, cb, guard, recurring)
    }

    /// Arm a readiness direction on a descriptor
    ///
    /// With `cb = None` the current fiber is captured and resumed when
    /// the direction fires; with a callback, the callback is scheduled
    /// instead. Arming an already-armed direction is rejected without
    /// disturbing the existing registration.
    pub fn add_event(&self, fd: RawFd, event: Event, cb: Option<FiberFn>) -> RuntimeResult<()> {
        self.add_event_inner(fd, event, cb, None)
    }

    /// Arm a direction with the current fiber as continuation and a
    /// cancellation marker
    ///
    /// `cancel_event`/`cancel_all` stamp `ETIMEDOUT` into the marker
    /// before waking the fiber; a genuine readiness firing leaves it
    /// zero. The syscall shims wait this way.
    pub fn add_event_marked(
        &self,
        fd: RawFd,
        event: Event,
        marker: &CancelMarker,
    ) -> RuntimeResult<()> {
        self.add_event_inner(fd, event, None, Some(Arc::downgrade(marker)))
    }

    fn add_event_inner(
        &self,
        fd: RawFd,
        event: Event,
        cb: Option<FiberFn>,
        marker: Option<Weak<AtomicI32>>,
    ) -> RuntimeResult<()> {
        debug_assert!(
            event == Event::READ || event == Event::WRITE,
            "add_event arms one direction at a time"
        );
        let ctx = self.fd_context(fd);
        let mut inner = ctx.inner.lock().unwrap();

        if inner.events.intersects(event) {
            log::error!(
                "add_event: fd {} direction {:?} already armed (events={:?})",
                fd,
                event,
                inner.events
            );
            return Err(RuntimeError::EventAlreadyArmed { fd });
        }

        let op = if inner.events.is_empty() {
            libc::EPOLL_CTL_ADD
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | (inner.events | event).bits(),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            log::error!("add_event: epoll_ctl(fd={}, op={}) failed: {}", fd, op, err);
            return Err(RuntimeError::Reactor(err));
        }

        self.pending.fetch_add(1, Ordering::SeqCst);
        inner.events |= event;

        let ectx = if event == Event::READ {
            &mut inner.read
        } else {
            &mut inner.write
        };
        debug_assert!(ectx.is_clean(), "event context for fd {} is dirty", fd);
        ectx.scheduler = Some(Arc::downgrade(&self.sched));
        ectx.marker = marker;
        match cb {
            Some(cb) => ectx.cb = Some(cb),
            None => {
                let cur = Fiber::current();
                debug_assert!(
                    !cur.is_primordial(),
                    "default-callback add_event needs a resumable fiber"
                );
                ectx.fiber = Some(cur);
            }
        }
        Ok(())
    }

    /// Disarm a direction and fire it as if it had become ready
    ///
    /// The suspended fiber wakes and finds the cancellation marker its
    /// waiter protocol defines; nothing leaks.
    pub fn cancel_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.intersects(event) {
            return false;
        }

        if !self.rewrite_registration(fd, inner.events - event) {
            return false;
        }
        self.trigger_event(ctx.fd, &mut inner, event, true);
        self.pending.fetch_sub(1, Ordering::SeqCst);
        true
    }

    /// Disarm a direction without firing it
    pub fn del_event(&self, fd: RawFd, event: Event) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if !inner.events.intersects(event) {
            return false;
        }

        if !self.rewrite_registration(fd, inner.events - event) {
            return false;
        }
        self.pending.fetch_sub(1, Ordering::SeqCst);
        inner.events -= event;
        let ectx = if event == Event::READ {
            &mut inner.read
        } else {
            &mut inner.write
        };
        *ectx = EventContext::default();
        true
    }

    /// Fire every armed direction on a descriptor (used by close)
    pub fn cancel_all(&self, fd: RawFd) -> bool {
        let Some(ctx) = self.lookup(fd) else {
            return false;
        };
        let mut inner = ctx.inner.lock().unwrap();
        if inner.events.is_empty() {
            return false;
        }

        let mut ev = libc::epoll_event { events: 0, u64: fd as u64 };
        let rc = unsafe { libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut ev) };
        if rc != 0 {
            log::error!(
                "cancel_all: epoll_ctl(fd={}) failed: {}",
                fd,
                std::io::Error::last_os_error()
            );
            return false;
        }

        if inner.events.intersects(Event::READ) {
            self.trigger_event(ctx.fd, &mut inner, Event::READ, true);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        if inner.events.intersects(Event::WRITE) {
            self.trigger_event(ctx.fd, &mut inner, Event::WRITE, true);
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
        debug_assert!(inner.events.is_empty(), "fd {} not fully cleared", fd);
        true
    }

    /// Armed-but-unfired direction count (in-flight work)
    #[inline]
    pub fn pending_events(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Context for a descriptor, growing the vector if needed
    fn fd_context(&self, fd: RawFd) -> Arc<FdContext> {
        let idx = fd as usize;
        {
            let contexts = self.fd_contexts.read().unwrap();
            if idx < contexts.len() {
                return contexts[idx].clone();
            }
        }
        let mut contexts = self.fd_contexts.write().unwrap();
        // Re-check after lock upgrade: someone else may have grown it
        if idx >= contexts.len() {
            let new_len = idx + idx / 2 + 1;
            let old_len = contexts.len();
            contexts.extend((old_len..new_len).map(|fd| FdContext::new(fd as RawFd)));
        }
        contexts[idx].clone()
    }

    /// Bounds-checked lookup without growth
    fn lookup(&self, fd: RawFd) -> Option<Arc<FdContext>> {
        if fd < 0 {
            return None;
        }
        let contexts = self.fd_contexts.read().unwrap();
        contexts.get(fd as usize).cloned()
    }

    /// Point the kernel registration at the residual event set
    fn rewrite_registration(&self, fd: RawFd, residual: Event) -> bool {
        let op = if residual.is_empty() {
            libc::EPOLL_CTL_DEL
        } else {
            libc::EPOLL_CTL_MOD
        };
        let mut ev = libc::epoll_event {
            events: libc::EPOLLET as u32 | residual.bits(),
            u64: fd as u64,
        };
        let rc = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if rc != 0 {
            log::error!(
                "epoll_ctl(fd={}, op={}) failed: {}",
                fd,
                op,
                std::io::Error::last_os_error()
            );
            return false;
        }
        true
    }

    /// Clear the direction bit and hand the stored continuation to the
    /// scheduler that armed it
    ///
    /// A cancelling caller stamps the waiter's marker first, so the
    /// woken fiber observes `ETIMEDOUT` instead of retrying.
    fn trigger_event(&self, fd: RawFd, inner: &mut FdInner, event: Event, cancelled: bool) {
        debug_assert!(
            inner.events.intersects(event),
            "triggering unarmed direction on fd {}",
            fd
        );
        inner.events -= event;
        let ectx = if event == Event::READ {
            &mut inner.read
        } else {
            &mut inner.write
        };

        let sched = ectx.scheduler.take().and_then(|w| w.upgrade());
        let fiber = ectx.fiber.take();
        let cb = ectx.cb.take();
        let marker = ectx.marker.take();

        if cancelled {
            if let Some(marker) = marker.and_then(|w| w.upgrade()) {
                let _ = marker.compare_exchange(
                    0,
                    libc::ETIMEDOUT,
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
            }
        }

        let Some(sched) = sched else {
            log::warn!("fired event on fd {} with no live scheduler", fd);
            return;
        };
        if let Some(cb) = cb {
            sched.schedule(cb);
        } else if let Some(fiber) = fiber {
            sched.schedule_fiber(fiber, ANY_THREAD);
        }
    }

    /// Stop check that also reports the next timer distance, so the idle
    /// loop computes both in one pass
    fn stopping_with_timeout(&self, next_timeout: &mut u64) -> bool {
        *next_timeout = self.timers.next_deadline_ms();
        *next_timeout == NO_TIMER
            && self.pending.load(Ordering::SeqCst) == 0
            && self.sched.base_stopping()
    }
}

impl SchedulerOps for IoReactor {
    /// Wake a blocked readiness-wait with one self-pipe byte
    fn tickle(&self) {
        if !self.sched.has_idle_threads() {
            return;
        }
        let rc = unsafe { libc::write(self.tickle_fds[1], b"T".as_ptr() as *const _, 1) };
        if rc != 1 {
            let err = std::io::Error::last_os_error();
            // A full pipe already guarantees a pending wakeup
            if err.raw_os_error() != Some(libc::EAGAIN) {
                log::error!("tickle write failed: {}", err);
            }
        }
    }

    /// Idle fiber body: block on readiness, dispatch timers and events,
    /// yield back to the scheduler loop
    fn idle(&self) {
        let mut events =
            vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENT_BATCH];

        loop {
            let mut next_timeout = NO_TIMER;
            if self.stopping_with_timeout(&mut next_timeout) {
                log::debug!("{}: reactor idle exit", self.sched.name());
                break;
            }

            let n = loop {
                let timeout = next_timeout.min(MAX_IDLE_TIMEOUT_MS) as i32;
                let rc = unsafe {
                    libc::epoll_wait(self.epfd, events.as_mut_ptr(), events.len() as i32, timeout)
                };
                if rc >= 0 {
                    break rc as usize;
                }
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                log::error!("epoll_wait failed: {}", err);
                break 0;
            };

            // Expired timers first: their callbacks join the queues the
            // scheduler loop drains right after this fiber yields
            let mut cbs: Vec<TimerCallback> = Vec::new();
            self.timers.collect_expired(&mut cbs);
            for cb in cbs.drain(..) {
                self.sched.schedule(move || cb());
            }

            for ev in events.iter().take(n) {
                let data = ev.u64;
                let revents = ev.events;

                if data == self.tickle_fds[0] as u64 {
                    // Edge-triggered: drain completely or a later tickle
                    // byte never re-arms the edge
                    let mut buf = [0u8; 256];
                    loop {
                        let r = unsafe {
                            libc::read(
                                self.tickle_fds[0],
                                buf.as_mut_ptr() as *mut _,
                                buf.len(),
                            )
                        };
                        if r <= 0 {
                            break;
                        }
                    }
                    continue;
                }

                let fd = data as RawFd;
                let Some(ctx) = self.lookup(fd) else {
                    continue;
                };
                let mut inner = ctx.inner.lock().unwrap();

                // Error or hangup wakes whichever directions are armed:
                // the waiter sees the condition via its own syscall
                let mut revents = revents;
                if revents & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                    revents |= (libc::EPOLLIN | libc::EPOLLOUT) as u32 & inner.events.bits();
                }

                let real = Event::from_bits_truncate(revents) & inner.events;
                if real.is_empty() {
                    continue;
                }

                // Re-register the residual interest before dispatch
                if !self.rewrite_registration(fd, inner.events - real) {
                    continue;
                }

                if real.intersects(Event::READ) {
                    self.trigger_event(ctx.fd, &mut inner, Event::READ, false);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
                if real.intersects(Event::WRITE) {
                    self.trigger_event(ctx.fd, &mut inner, Event::WRITE, false);
                    self.pending.fetch_sub(1, Ordering::SeqCst);
                }
            }

            // Let the scheduler loop run what we just made runnable
            Fiber::yield_now();
        }
    }

    /// Stricter than the base criterion: armed events and pending timers
    /// are in-flight work
    fn stopping(&self) -> bool {
        let mut unused = NO_TIMER;
        self.stopping_with_timeout(&mut unused)
    }

    /// Make the reactor reachable from syscall shims on this thread
    fn bind_thread(&self) {
        CURRENT_REACTOR.with(|r| *r.borrow_mut() = Some(self.me.clone()));
    }
}

impl Drop for IoReactor {
    fn drop(&mut self) {
        // Belt-and-braces for a reactor dropped without stop(): raise the
        // flag and poke the pipe directly (the ops weak is already dead).
        if !self.sched.base_stopping() {
            unsafe {
                libc::write(self.tickle_fds[1], b"T".as_ptr() as *const _, 1);
            }
            self.sched.stop();
        }
        unsafe {
            libc::close(self.epfd);
            libc::close(self.tickle_fds[0]);
            libc::close(self.tickle_fds[1]);
        }
    }
}

impl std::fmt::Debug for IoReactor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoReactor")
            .field("epfd", &self.epfd)
            .field("pending", &self.pending.load(Ordering::Relaxed))
            .field("scheduler", &self.sched)
            .finish()
    }
}

/// Yield the current fiber back to its scheduler, staying runnable
///
/// Unlike [`Fiber::yield_now`], the fiber is first re-queued so it runs
/// again without an external wakeup; use this for cooperative fairness
/// inside long computations.
pub fn yield_now() {
    if let (Some(sched), Some(cur)) = (crate::scheduler::current_scheduler(), fiber::current_opt())
    {
        if cur.runs_in_scheduler() && !cur.is_primordial() {
            sched.schedule_fiber(cur, ANY_THREAD);
        }
    }
    Fiber::yield_now();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::{Duration, Instant};

    fn test_reactor(threads: usize) -> Arc<IoReactor> {
        IoReactor::new(
            RuntimeConfig::new()
                .threads(threads)
                .use_caller(false)
                .pin_cores(false)
                .name("reactor-test"),
        )
    }

    fn socketpair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr())
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn test_duplicate_arm_rejected() {
        let reactor = test_reactor(1);
        let (a, b) = socketpair();

        assert!(reactor.add_event(a, Event::READ, Some(Box::new(|| {}))).is_ok());
        // Second arm of the same direction must not disturb the first
        let err = reactor.add_event(a, Event::READ, Some(Box::new(|| {})));
        assert!(matches!(err, Err(RuntimeError::EventAlreadyArmed { .. })));
        // The other direction is independent
        assert!(reactor.add_event(a, Event::WRITE, Some(Box::new(|| {}))).is_ok());

        assert!(reactor.cancel_all(a));
        assert_eq!(reactor.pending_events(), 0);
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_del_event_does_not_fire() {
        let reactor = test_reactor(1);
        let (a, b) = socketpair();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        reactor
            .add_event(
                a,
                Event::READ,
                Some(Box::new(move || {
                    hits2.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();
        assert_eq!(reactor.pending_events(), 1);

        assert!(reactor.del_event(a, Event::READ));
        assert_eq!(reactor.pending_events(), 0);
        // Silent removal: the callback is gone, not queued
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_event_fires_on_readiness() {
        let reactor = test_reactor(1);
        reactor.start();
        let (a, b) = socketpair();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        reactor
            .add_event(
                a,
                Event::READ,
                Some(Box::new(move || {
                    hits2.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        // Make `a` readable
        let rc = unsafe { libc::write(b, b"x".as_ptr() as *const _, 1) };
        assert_eq!(rc, 1);

        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(reactor.pending_events(), 0);

        reactor.stop();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_cancel_event_fires_callback() {
        let reactor = test_reactor(1);
        reactor.start();
        let (a, b) = socketpair();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        reactor
            .add_event(
                a,
                Event::READ,
                Some(Box::new(move || {
                    hits2.fetch_add(1, Ordering::SeqCst);
                })),
            )
            .unwrap();

        // No data ever arrives; cancellation still wakes the waiter
        assert!(reactor.cancel_event(a, Event::READ));

        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        reactor.stop();
        unsafe {
            libc::close(a);
            libc::close(b);
        }
    }

    #[test]
    fn test_timer_fires_through_reactor() {
        let reactor = test_reactor(1);
        reactor.start();

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = Arc::clone(&hits);
        let start = Instant::now();
        reactor.add_timer(
            30,
            Arc::new(move || {
                hits2.fetch_add(1, Ordering::SeqCst);
            }),
            false,
        );

        let deadline = Instant::now() + Duration::from_secs(2);
        while hits.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() >= Duration::from_millis(29));

        reactor.stop();
    }

    #[test]
    fn test_context_vector_grows() {
        let reactor = test_reactor(1);
        let (a, b) = socketpair();

        // Force a descriptor well past the initial capacity
        let high = unsafe { libc::fcntl(a, libc::F_DUPFD, 300) };
        assert!(high >= 300);

        assert!(reactor
            .add_event(high, Event::READ, Some(Box::new(|| {})))
            .is_ok());
        assert!(reactor.cancel_all(high));

        unsafe {
            libc::close(high);
            libc::close(a);
            libc::close(b);
        }
    }
}
