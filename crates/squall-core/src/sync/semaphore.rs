//! Counting semaphore over the POSIX `sem_t`
//!
//! Used for thread startup barriers: the spawning side blocks in `wait`
//! until the new thread has published its identity and calls `post`.

use std::cell::UnsafeCell;

/// A counting semaphore
pub struct Semaphore {
    inner: UnsafeCell<libc::sem_t>,
}

// Safety: sem_wait/sem_post are thread-safe by POSIX contract; the
// UnsafeCell only exists because libc wants *mut sem_t.
unsafe impl Send for Semaphore {}
unsafe impl Sync for Semaphore {}

impl Semaphore {
    /// Create a semaphore with the given initial count
    ///
    /// # Panics
    ///
    /// Panics if `sem_init` fails; the runtime cannot uphold its startup
    /// ordering without a working semaphore.
    pub fn new(count: u32) -> Self {
        let inner = UnsafeCell::new(unsafe { std::mem::zeroed() });
        let rc = unsafe { libc::sem_init(inner.get(), 0, count) };
        assert_eq!(rc, 0, "sem_init failed: {}", std::io::Error::last_os_error());
        Self { inner }
    }

    /// Decrement the semaphore, blocking until the count is positive
    pub fn wait(&self) {
        loop {
            let rc = unsafe { libc::sem_wait(self.inner.get()) };
            if rc == 0 {
                return;
            }
            let err = std::io::Error::last_os_error();
            // Signal delivery interrupts sem_wait
            if err.raw_os_error() != Some(libc::EINTR) {
                panic!("sem_wait failed: {}", err);
            }
        }
    }

    /// Increment the semaphore, waking one waiter
    pub fn post(&self) {
        let rc = unsafe { libc::sem_post(self.inner.get()) };
        assert_eq!(rc, 0, "sem_post failed: {}", std::io::Error::last_os_error());
    }
}

impl Drop for Semaphore {
    fn drop(&mut self) {
        unsafe {
            libc::sem_destroy(self.inner.get());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_semaphore_initial_count() {
        let sem = Semaphore::new(2);
        sem.wait();
        sem.wait();
        // Count exhausted; post to restore
        sem.post();
        sem.wait();
    }

    #[test]
    fn test_semaphore_cross_thread() {
        let sem = Arc::new(Semaphore::new(0));
        let sem2 = Arc::clone(&sem);

        let handle = thread::spawn(move || {
            sem2.post();
        });

        sem.wait();
        handle.join().unwrap();
    }
}
