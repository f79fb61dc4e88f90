//! Worker thread wrapper
//!
//! Wraps an OS thread with a name, an optional CPU pin, and a start
//! barrier: the constructor returns only after the new thread has
//! published its kernel tid and finished pinning itself, so thread state
//! is deterministic from the caller's point of view.

use squall_core::error::{RuntimeError, RuntimeResult};
use squall_core::sync::Semaphore;
use std::cell::RefCell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Linux truncates thread names to 15 bytes + NUL
const MAX_NAME_LEN: usize = 15;

thread_local! {
    static THREAD_NAME: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Name of the current thread as set by [`Thread::spawn`]
pub fn current_thread_name() -> String {
    THREAD_NAME.with(|n| n.borrow().clone())
}

/// Kernel thread id of the current thread
#[inline]
pub fn current_tid() -> libc::pid_t {
    unsafe { libc::gettid() }
}

/// Number of online logical CPUs
pub fn num_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

/// Pin the calling thread to a logical core
///
/// Failure is survivable: the thread keeps running unpinned with a
/// warning, per the affinity policy.
pub fn pin_current_thread(core: usize, name: &str) {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(core % num_cpus(), &mut set);
        let rc = libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        );
        if rc != 0 {
            log::warn!(
                "{}: failed to pin to core {}: {}",
                name,
                core,
                std::io::Error::from_raw_os_error(rc)
            );
        }
    }
}

/// A named, optionally CPU-pinned OS thread
pub struct Thread {
    handle: Option<JoinHandle<()>>,
    id: libc::pid_t,
    name: String,
}

impl Thread {
    /// Spawn a thread running `f`
    ///
    /// Blocks until the new thread has published its tid and completed
    /// its CPU pin, so `id()` is valid as soon as this returns.
    pub fn spawn<F>(name: &str, cpu: Option<usize>, f: F) -> RuntimeResult<Thread>
    where
        F: FnOnce() + Send + 'static,
    {
        let name: String = name.chars().take(MAX_NAME_LEN).collect();
        let started = Arc::new(Semaphore::new(0));
        let tid = Arc::new(AtomicI32::new(0));

        let thread_name = name.clone();
        let started2 = Arc::clone(&started);
        let tid2 = Arc::clone(&tid);

        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(move || {
                THREAD_NAME.with(|n| *n.borrow_mut() = thread_name.clone());
                tid2.store(current_tid(), Ordering::Release);

                if let Some(core) = cpu {
                    pin_current_thread(core, &thread_name);
                }

                // Publish: the constructor may now return
                started2.post();

                f();
            })
            .map_err(RuntimeError::ThreadSpawn)?;

        started.wait();

        Ok(Thread {
            handle: Some(handle),
            id: tid.load(Ordering::Acquire),
            name,
        })
    }

    /// Wait for the thread to finish
    pub fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("thread {} panicked", self.name);
            }
        }
    }

    /// Kernel thread id
    #[inline]
    pub fn id(&self) -> libc::pid_t {
        self.id
    }

    /// Thread name (already truncated to the platform limit)
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        // Not joined: dropping the JoinHandle detaches, which keeps the
        // kernel resources reclaimable.
        self.handle.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn test_spawn_and_join() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = Arc::clone(&ran);
        let mut t = Thread::spawn("test-worker", None, move || {
            ran2.store(true, Ordering::Release);
        })
        .unwrap();
        t.join();
        assert!(ran.load(Ordering::Acquire));
    }

    #[test]
    fn test_id_published_before_return() {
        let mut t = Thread::spawn("test-id", None, || {
            std::thread::sleep(std::time::Duration::from_millis(20));
        })
        .unwrap();
        // Barrier guarantees the tid is visible immediately
        assert!(t.id() > 0);
        t.join();
    }

    #[test]
    fn test_name_truncated() {
        let mut t = Thread::spawn("a-very-long-thread-name-indeed", None, || {}).unwrap();
        assert!(t.name().len() <= MAX_NAME_LEN);
        t.join();
    }

    #[test]
    fn test_thread_name_tls() {
        let mut t = Thread::spawn("named", None, || {
            assert_eq!(current_thread_name(), "named");
        })
        .unwrap();
        t.join();
    }
}
