//! Timer manager: a monotonic-time ordered set with tickle semantics
//!
//! Timers live in a set ordered by (deadline, pointer identity), so
//! equal deadlines coexist deterministically. Deadlines are computed
//! against a monotonic clock immune to wall-clock jumps; a rollover of
//! the underlying counter is still detected defensively and handled by
//! expiring everything once.
//!
//! Inserting a new earliest timer fires an installable front-insert
//! notification exactly once per wait cycle; the reactor uses it to wake
//! its readiness-wait and recompute the block timeout.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock, Weak};
use std::time::Instant;

/// Sentinel for "no timer pending"
pub const NO_TIMER: u64 = u64::MAX;

/// Clock went backwards by more than this: treat as rollover
const ROLLOVER_WINDOW_MS: u64 = 60 * 60 * 1000;

/// Milliseconds since process start on the monotonic clock
pub fn elapsed_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// Callback type for timers; recurring timers re-run the same callback
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// A single timer registered with a [`TimerManager`]
///
/// The ordering key (deadline) is immutable while the timer sits in the
/// set; `cancel`/`refresh`/`reset` all erase-then-reinsert under the
/// manager's write lock.
pub struct Timer {
    /// Absolute deadline in monotonic milliseconds
    next: AtomicU64,
    /// Period for recurring timers (also the original delay)
    period: AtomicU64,
    recurring: bool,
    cb: Mutex<Option<TimerCallback>>,
    manager: Weak<TimerManager>,
}

impl Timer {
    fn new(ms: u64, cb: TimerCallback, recurring: bool, manager: &Arc<TimerManager>) -> Arc<Timer> {
        Arc::new(Timer {
            next: AtomicU64::new(elapsed_ms() + ms),
            period: AtomicU64::new(ms),
            recurring,
            cb: Mutex::new(Some(cb)),
            manager: Arc::downgrade(manager),
        })
    }

    #[inline]
    fn deadline(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    /// Cancel the timer; idempotent
    ///
    /// Returns true if the timer was still pending.
    pub fn cancel(self: &Arc<Self>) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut timers = manager.timers.write().unwrap();
        let had_cb = self.cb.lock().unwrap().take().is_some();
        if had_cb {
            timers.remove(&TimerEntry(self.clone()));
            return true;
        }
        false
    }

    /// Push the deadline out to now + period, watchdog style
    pub fn refresh(self: &Arc<Self>) -> bool {
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        let mut timers = manager.timers.write().unwrap();
        if self.cb.lock().unwrap().is_none() {
            return false;
        }
        if !timers.remove(&TimerEntry(self.clone())) {
            return false;
        }
        self.next.store(
            elapsed_ms() + self.period.load(Ordering::Acquire),
            Ordering::Release,
        );
        timers.insert(TimerEntry(self.clone()));
        true
    }

    /// Change the period
    ///
    /// With `from_now = false` the new deadline anchors at the original
    /// schedule point (`old_deadline - old_period`), keeping periodic
    /// work drift-free; with `true` it anchors at the current instant.
    pub fn reset(self: &Arc<Self>, ms: u64, from_now: bool) -> bool {
        if ms == self.period.load(Ordering::Acquire) && !from_now {
            return true;
        }
        let Some(manager) = self.manager.upgrade() else {
            return false;
        };
        {
            let mut timers = manager.timers.write().unwrap();
            if self.cb.lock().unwrap().is_none() {
                return false;
            }
            if !timers.remove(&TimerEntry(self.clone())) {
                return false;
            }
            let start = if from_now {
                elapsed_ms()
            } else {
                self.deadline() - self.period.load(Ordering::Acquire)
            };
            self.period.store(ms, Ordering::Release);
            self.next.store(start + ms, Ordering::Release);
        }
        // Reinsert through the front-notify path: the new deadline may
        // now be the earliest
        manager.insert(self.clone());
        true
    }
}

/// Set entry ordered by (deadline, pointer identity)
struct TimerEntry(Arc<Timer>);

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
impl Eq for TimerEntry {}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.0.deadline(), Arc::as_ptr(&self.0) as usize)
            .cmp(&(other.0.deadline(), Arc::as_ptr(&other.0) as usize))
    }
}

/// Ordered collection of pending timers
pub struct TimerManager {
    timers: RwLock<BTreeSet<TimerEntry>>,
    /// Latch so a burst of front inserts raises one notification per
    /// wait cycle; cleared by `next_deadline_ms`
    tickled: AtomicBool,
    /// Last observed clock value, for rollover detection
    previous_ms: AtomicU64,
    /// Invoked when a new earliest timer appears
    on_front_insert: OnceLock<Box<dyn Fn() + Send + Sync>>,
}

impl TimerManager {
    pub fn new() -> Arc<TimerManager> {
        Arc::new(TimerManager {
            timers: RwLock::new(BTreeSet::new()),
            tickled: AtomicBool::new(false),
            previous_ms: AtomicU64::new(elapsed_ms()),
            on_front_insert: OnceLock::new(),
        })
    }

    /// Install the front-insert notification (reactor: tickle)
    pub fn set_front_notify(&self, f: Box<dyn Fn() + Send + Sync>) {
        if self.on_front_insert.set(f).is_err() {
            panic!("timer front notifier installed twice");
        }
    }

    /// Register a timer firing `ms` from now
    pub fn add_timer(
        self: &Arc<Self>,
        ms: u64,
        cb: TimerCallback,
        recurring: bool,
    ) -> Arc<Timer> {
        let timer = Timer::new(ms, cb, recurring, self);
        self.insert(timer.clone());
        timer
    }

    /// Register a timer whose callback runs only if `guard` is still
    /// upgradable at fire time
    ///
    /// Breaks the cycle a timeout callback would otherwise form with the
    /// object it guards: once the strong owner is gone the callback is
    /// dropped unrun.
    pub fn add_condition_timer<T: Send + Sync + 'static>(
        self: &Arc<Self>,
        ms: u64,
        cb: TimerCallback,
        guard: Weak<T>,
        recurring: bool,
    ) -> Arc<Timer> {
        let wrapped: TimerCallback = Arc::new(move || {
            if guard.upgrade().is_some() {
                cb();
            }
        });
        self.add_timer(ms, wrapped, recurring)
    }

    /// Milliseconds until the earliest deadline: 0 if already due,
    /// [`NO_TIMER`] if the set is empty
    ///
    /// Also re-arms the front-insert latch; callers use this right
    /// before blocking.
    pub fn next_deadline_ms(&self) -> u64 {
        let timers = self.timers.read().unwrap();
        self.tickled.store(false, Ordering::Release);

        let Some(first) = timers.iter().next() else {
            return NO_TIMER;
        };
        let now = elapsed_ms();
        first.0.deadline().saturating_sub(now)
    }

    /// Move every expired callback into `out`
    ///
    /// Recurring timers are reinserted with a fresh deadline;
    /// non-recurring ones have their callback nulled so no reference
    /// cycle outlives the firing. A clock rollover expires everything
    /// once rather than hanging timers forever.
    pub fn collect_expired(&self, out: &mut Vec<TimerCallback>) {
        let now = elapsed_ms();
        let mut timers = self.timers.write().unwrap();
        if timers.is_empty() {
            return;
        }

        let rollover = self.detect_rollover(now);
        if !rollover && timers.iter().next().is_some_and(|t| t.0.deadline() > now) {
            return;
        }

        let mut expired = Vec::new();
        if rollover {
            expired.extend(std::mem::take(&mut *timers));
        } else {
            while let Some(first) = timers.iter().next() {
                if first.0.deadline() > now {
                    break;
                }
                expired.push(timers.pop_first().unwrap());
            }
        }

        out.reserve(expired.len());
        for entry in expired {
            let timer = entry.0;
            let cb = timer.cb.lock().unwrap().clone();
            let Some(cb) = cb else {
                continue; // cancelled while expiring
            };
            if timer.recurring {
                timer
                    .next
                    .store(now + timer.period.load(Ordering::Acquire), Ordering::Release);
                out.push(cb);
                timers.insert(TimerEntry(timer));
            } else {
                *timer.cb.lock().unwrap() = None;
                out.push(cb);
            }
        }
    }

    /// Any timers pending?
    pub fn has_timer(&self) -> bool {
        !self.timers.read().unwrap().is_empty()
    }

    /// Insert and fire the front notification if this became the new
    /// earliest deadline
    fn insert(&self, timer: Arc<Timer>) {
        let at_front = {
            let mut timers = self.timers.write().unwrap();
            timers.insert(TimerEntry(timer.clone()));
            let is_first = timers
                .iter()
                .next()
                .is_some_and(|t| Arc::ptr_eq(&t.0, &timer));
            is_first && !self.tickled.swap(true, Ordering::AcqRel)
        };
        if at_front {
            if let Some(notify) = self.on_front_insert.get() {
                notify();
            }
        }
    }

    /// Detected when the monotonic source jumps back by over an hour
    fn detect_rollover(&self, now: u64) -> bool {
        let prev = self.previous_ms.swap(now, Ordering::AcqRel);
        now < prev && now < prev.saturating_sub(ROLLOVER_WINDOW_MS)
    }
}

impl std::fmt::Debug for TimerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerManager")
            .field("pending", &self.timers.read().unwrap().len())
            .finish()
    }
}
