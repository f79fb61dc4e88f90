//! Guard-paged fiber stacks
//!
//! Each stack is an anonymous private mapping of `size + one page`. The
//! lowest page is downgraded to `PROT_NONE` so an overflow faults
//! deterministically instead of corrupting the heap. Physical pages are
//! committed lazily, so a 128 KiB stack costs only the pages it touches.

use squall_core::error::{RuntimeError, RuntimeResult};

/// System page size, queried once
pub fn page_size() -> usize {
    use std::sync::OnceLock;
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize })
}

/// An owned fiber stack with a low guard page
///
/// `base` points at the first usable byte (just above the guard page);
/// the mapping itself starts one page lower. Dropping unmaps the whole
/// region including the guard.
pub struct GuardedStack {
    base: *mut u8,
    size: usize,
}

// Safety: the region is exclusively owned; pointers never alias another
// stack.
unsafe impl Send for GuardedStack {}
unsafe impl Sync for GuardedStack {}

impl GuardedStack {
    /// Map a new stack of `size` usable bytes
    pub fn alloc(size: usize) -> RuntimeResult<Self> {
        let page = page_size();
        let real_size = size + page;

        let mapping = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                real_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if mapping == libc::MAP_FAILED {
            return Err(RuntimeError::StackAllocation(std::io::Error::last_os_error()));
        }

        // Low page becomes the guard: any touch faults
        let rc = unsafe { libc::mprotect(mapping, page, libc::PROT_NONE) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            unsafe {
                libc::munmap(mapping, real_size);
            }
            return Err(RuntimeError::StackAllocation(err));
        }

        Ok(Self {
            base: unsafe { (mapping as *mut u8).add(page) },
            size,
        })
    }

    /// First usable byte (low end, just above the guard page)
    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    /// One past the last usable byte (where a stack pointer starts)
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.add(self.size) }
    }

    /// Usable size in bytes (excluding the guard page)
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for GuardedStack {
    fn drop(&mut self) {
        let page = page_size();
        let mapping = unsafe { self.base.sub(page) };
        let rc = unsafe { libc::munmap(mapping as *mut libc::c_void, self.size + page) };
        if rc != 0 {
            log::error!(
                "munmap of fiber stack failed: {}",
                std::io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_and_touch() {
        let stack = GuardedStack::alloc(64 * 1024).unwrap();
        assert_eq!(stack.size(), 64 * 1024);
        assert_eq!(stack.top() as usize - stack.base() as usize, 64 * 1024);

        // The whole usable range is writable
        unsafe {
            *stack.base() = 0xAB;
            *stack.top().sub(1) = 0xCD;
            assert_eq!(*stack.base(), 0xAB);
        }
    }

    #[test]
    fn test_base_is_page_aligned() {
        let stack = GuardedStack::alloc(128 * 1024).unwrap();
        assert_eq!(stack.base() as usize % page_size(), 0);
    }

    #[test]
    fn test_many_stacks() {
        // Virtual space is cheap; lazy backing means this stays small
        let stacks: Vec<_> = (0..64)
            .map(|_| GuardedStack::alloc(128 * 1024).unwrap())
            .collect();
        assert_eq!(stacks.len(), 64);
    }
}
