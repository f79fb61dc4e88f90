//! Process-wide file descriptor registry
//!
//! Tracks, per descriptor: socket-ness, the user's requested non-blocking
//! mode, the system-enforced non-blocking mode, per-direction timeouts,
//! and a closed flag. Sockets managed by the runtime are always
//! non-blocking at the kernel level; the user's requested mode is
//! remembered here and emulated by the syscall shims.

use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, RwLock};

/// Sentinel for "no timeout configured"
pub const NO_TIMEOUT: u64 = u64::MAX;

/// Which directional timeout to consult
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// `SO_RCVTIMEO`: read-side operations
    Recv,
    /// `SO_SNDTIMEO`: write-side operations
    Send,
}

/// Per-descriptor metadata entry
pub struct FdCtx {
    fd: RawFd,
    is_socket: bool,
    sys_nonblock: AtomicBool,
    user_nonblock: AtomicBool,
    closed: AtomicBool,
    recv_timeout_ms: AtomicU64,
    send_timeout_ms: AtomicU64,
}

impl FdCtx {
    /// Probe the descriptor and build its entry
    ///
    /// Sockets get `O_NONBLOCK` forced on at the kernel level here; the
    /// shim layer emulates blocking behavior on top.
    fn new(fd: RawFd) -> FdCtx {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        let is_socket = unsafe { libc::fstat(fd, &mut stat) } == 0
            && (stat.st_mode & libc::S_IFMT) == libc::S_IFSOCK;

        let mut sys_nonblock = false;
        if is_socket {
            let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
            if flags >= 0 && (flags & libc::O_NONBLOCK) == 0 {
                unsafe {
                    libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);
                }
            }
            sys_nonblock = true;
        }

        FdCtx {
            fd,
            is_socket,
            sys_nonblock: AtomicBool::new(sys_nonblock),
            user_nonblock: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            recv_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            send_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn is_socket(&self) -> bool {
        self.is_socket
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Kernel-level non-blocking state maintained by the runtime
    #[inline]
    pub fn sys_nonblock(&self) -> bool {
        self.sys_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_sys_nonblock(&self, on: bool) {
        self.sys_nonblock.store(on, Ordering::Release);
    }

    /// The mode the application asked for; emulated, not forwarded
    #[inline]
    pub fn user_nonblock(&self) -> bool {
        self.user_nonblock.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn set_user_nonblock(&self, on: bool) {
        self.user_nonblock.store(on, Ordering::Release);
    }

    /// Directional timeout in ms, [`NO_TIMEOUT`] if unset
    pub fn timeout(&self, kind: TimeoutKind) -> u64 {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.load(Ordering::Acquire),
            TimeoutKind::Send => self.send_timeout_ms.load(Ordering::Acquire),
        }
    }

    pub fn set_timeout(&self, kind: TimeoutKind, ms: u64) {
        match kind {
            TimeoutKind::Recv => self.recv_timeout_ms.store(ms, Ordering::Release),
            TimeoutKind::Send => self.send_timeout_ms.store(ms, Ordering::Release),
        }
    }
}

/// Registry of live descriptor entries, indexed by fd
pub struct FdRegistry {
    entries: RwLock<Vec<Option<Arc<FdCtx>>>>,
}

impl FdRegistry {
    /// Process-wide instance, initialized lazily
    pub fn instance() -> &'static FdRegistry {
        static REGISTRY: OnceLock<FdRegistry> = OnceLock::new();
        REGISTRY.get_or_init(|| FdRegistry {
            entries: RwLock::new(Vec::new()),
        })
    }

    /// Look up an entry; with `auto_create` an unknown descriptor is
    /// probed and registered on the spot
    pub fn get(&self, fd: RawFd, auto_create: bool) -> Option<Arc<FdCtx>> {
        if fd < 0 {
            return None;
        }
        let idx = fd as usize;

        {
            let entries = self.entries.read().unwrap();
            if let Some(Some(ctx)) = entries.get(idx) {
                return Some(ctx.clone());
            }
        }
        if !auto_create {
            return None;
        }

        let mut entries = self.entries.write().unwrap();
        // Re-check: another thread may have registered it while we
        // waited on the lock
        if let Some(Some(ctx)) = entries.get(idx) {
            return Some(ctx.clone());
        }
        if entries.len() <= idx {
            entries.resize(idx + idx / 2 + 1, None);
        }
        let ctx = Arc::new(FdCtx::new(fd));
        entries[idx] = Some(ctx.clone());
        Some(ctx)
    }

    /// Drop the entry for a descriptor (on close)
    pub fn del(&self, fd: RawFd) {
        if fd < 0 {
            return;
        }
        let mut entries = self.entries.write().unwrap();
        if let Some(slot) = entries.get_mut(fd as usize) {
            if let Some(ctx) = slot.take() {
                ctx.mark_closed();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_socket() -> RawFd {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        fd
    }

    #[test]
    fn test_socket_detection_and_forced_nonblock() {
        let fd = make_socket();
        let ctx = FdRegistry::instance().get(fd, true).unwrap();

        assert!(ctx.is_socket());
        assert!(ctx.sys_nonblock());
        assert!(!ctx.user_nonblock());

        // Kernel flag really is set
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(flags & libc::O_NONBLOCK != 0);

        FdRegistry::instance().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_non_socket_left_alone() {
        // stdin-like: use a pipe end
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        let ctx = FdRegistry::instance().get(fds[0], true).unwrap();

        assert!(!ctx.is_socket());
        assert!(!ctx.sys_nonblock());

        FdRegistry::instance().del(fds[0]);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_lookup_without_create() {
        let fd = make_socket();
        assert!(FdRegistry::instance().get(fd, false).is_none());
        assert!(FdRegistry::instance().get(fd, true).is_some());
        assert!(FdRegistry::instance().get(fd, false).is_some());

        FdRegistry::instance().del(fd);
        assert!(FdRegistry::instance().get(fd, false).is_none());
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_timeouts_stored_per_direction() {
        let fd = make_socket();
        let ctx = FdRegistry::instance().get(fd, true).unwrap();

        assert_eq!(ctx.timeout(TimeoutKind::Recv), NO_TIMEOUT);
        ctx.set_timeout(TimeoutKind::Recv, 250);
        ctx.set_timeout(TimeoutKind::Send, 500);
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 250);
        assert_eq!(ctx.timeout(TimeoutKind::Send), 500);

        FdRegistry::instance().del(fd);
        unsafe { libc::close(fd) };
    }

    #[test]
    fn test_negative_fd_rejected() {
        assert!(FdRegistry::instance().get(-1, true).is_none());
    }
}
