//! Cooperative replacements for the blocking syscall surface
//!
//! Each wrapper keeps the POSIX calling convention (raw fds, errno,
//! -1 on error) but turns would-block conditions into fiber suspension:
//! on `EAGAIN` the shim arms a reactor event for the fd + direction,
//! optionally arms a condition timer for the fd's configured timeout,
//! and yields. The reactor resumes the fiber on readiness; the timer
//! resumes it with a cancellation marker that surfaces as `ETIMEDOUT`.
//!
//! Interception is per-thread: with the hook disabled (the default off
//! the runtime's worker threads) every wrapper is a straight
//! passthrough, observationally identical to the raw call. Diagnostics
//! code that must never suspend runs under `set_hook_enable(false)`.

use crate::config::DEFAULT_CONNECT_TIMEOUT_MS;
use crate::fd::{FdRegistry, TimeoutKind, NO_TIMEOUT};
use crate::fiber::Fiber;
use crate::reactor::{CancelMarker, Event, IoReactor};
use crate::scheduler::ANY_THREAD;
use libc::{c_int, c_ulong, c_void, socklen_t};
use std::cell::Cell;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

thread_local! {
    static HOOK_ENABLED: Cell<bool> = const { Cell::new(false) };
}

/// Enable or disable syscall interception on the current thread
///
/// Worker threads enable it as their scheduler loop starts.
#[inline]
pub fn set_hook_enable(on: bool) {
    HOOK_ENABLED.with(|h| h.set(on));
}

/// Whether the current thread intercepts blocking calls
#[inline]
pub fn is_hook_enabled() -> bool {
    HOOK_ENABLED.with(|h| h.get())
}

#[inline]
fn errno() -> c_int {
    unsafe { *libc::__errno_location() }
}

#[inline]
fn set_errno(v: c_int) {
    unsafe {
        *libc::__errno_location() = v;
    }
}

/// Arm the fd's directional timeout as a condition timer, if one is set
///
/// The timer holds only weak references: if the waiter already resumed
/// (marker dropped) the callback is a no-op, and `cancel_event` itself
/// stamps `ETIMEDOUT` into the marker before waking the fiber.
fn arm_timeout(
    reactor: &Arc<IoReactor>,
    marker: &CancelMarker,
    fd: c_int,
    event: Event,
    timeout_ms: u64,
) -> Option<Arc<crate::timer::Timer>> {
    if timeout_ms == NO_TIMEOUT {
        return None;
    }
    let wmarker = Arc::downgrade(marker);
    let wreactor = Arc::downgrade(reactor);
    Some(reactor.add_condition_timer(
        timeout_ms,
        Arc::new(move || {
            let Some(m) = wmarker.upgrade() else {
                return;
            };
            if m.load(Ordering::SeqCst) != 0 {
                return;
            }
            if let Some(r) = wreactor.upgrade() {
                r.cancel_event(fd, event);
            }
        }),
        Arc::downgrade(marker),
        false,
    ))
}

/// Generic cooperative I/O template
///
/// Retries `raw` through `EINTR`; on `EAGAIN` suspends the current
/// fiber against the reactor until readiness, timeout, or cancellation.
/// Any non-would-block outcome returns straight through with the raw
/// errno intact.
fn do_io<F>(
    fd: c_int,
    name: &'static str,
    event: Event,
    timeout_kind: TimeoutKind,
    mut raw: F,
) -> isize
where
    F: FnMut() -> isize,
{
    if !is_hook_enabled() {
        return raw();
    }
    let Some(ctx) = FdRegistry::instance().get(fd, false) else {
        return raw();
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return raw();
    }

    let timeout_ms = ctx.timeout(timeout_kind);
    let marker: CancelMarker = Arc::new(AtomicI32::new(0));

    loop {
        let mut n = raw();
        while n == -1 && errno() == libc::EINTR {
            n = raw();
        }
        if n != -1 || errno() != libc::EAGAIN {
            return n;
        }

        // Would block: park this fiber on the reactor
        let Some(reactor) = IoReactor::current() else {
            // Not on a runtime thread; surface the raw would-block
            return n;
        };
        let timer = arm_timeout(&reactor, &marker, fd, event, timeout_ms);

        if let Err(e) = reactor.add_event_marked(fd, event, &marker) {
            log::error!("{}: arming {:?} on fd {} failed: {}", name, event, fd, e);
            if let Some(t) = &timer {
                t.cancel();
            }
            if let Some(code) = e.raw_os_error() {
                set_errno(code);
            }
            return -1;
        }

        Fiber::yield_now();

        if let Some(t) = &timer {
            t.cancel();
        }
        let cancelled = marker.load(Ordering::SeqCst);
        if cancelled != 0 {
            set_errno(cancelled);
            return -1;
        }
        // Readiness: retry the syscall
    }
}

// ── Sleep family ──

/// Park the current fiber for `ms`, scheduling it back via a timer
///
/// Returns false when cooperative sleep is unavailable on this thread
/// (hook disabled, no reactor, or not inside a fiber).
fn cooperative_sleep(ms: u64) -> bool {
    if !is_hook_enabled() {
        return false;
    }
    let Some(reactor) = IoReactor::current() else {
        return false;
    };
    let fiber = Fiber::current();
    if fiber.is_primordial() {
        return false;
    }
    let weak = Arc::downgrade(&reactor);
    reactor.add_timer(
        ms,
        Arc::new(move || {
            if let Some(r) = weak.upgrade() {
                r.spawn_fiber(fiber.clone(), ANY_THREAD);
            }
        }),
        false,
    );
    Fiber::yield_now();
    true
}

/// Cooperative `sleep(3)`
pub fn sleep(seconds: u32) -> u32 {
    if cooperative_sleep(seconds as u64 * 1000) {
        return 0;
    }
    unsafe { libc::sleep(seconds) }
}

/// Cooperative `usleep(3)`
pub fn usleep(usec: u32) -> c_int {
    if cooperative_sleep(usec as u64 / 1000) {
        return 0;
    }
    unsafe { libc::usleep(usec) }
}

/// Cooperative `nanosleep(2)` (quantized to milliseconds)
pub fn nanosleep(req: &libc::timespec) -> c_int {
    let ms = req.tv_sec as u64 * 1000 + req.tv_nsec as u64 / 1_000_000;
    if cooperative_sleep(ms) {
        return 0;
    }
    unsafe { libc::nanosleep(req, std::ptr::null_mut()) }
}

// ── Socket lifecycle ──

/// `socket(2)`; registers the new descriptor with the runtime
pub fn socket(domain: c_int, ty: c_int, protocol: c_int) -> c_int {
    let fd = unsafe { libc::socket(domain, ty, protocol) };
    if fd >= 0 && is_hook_enabled() {
        FdRegistry::instance().get(fd, true);
    }
    fd
}

/// `connect(2)` with the runtime's default timeout
pub fn connect(fd: c_int, addr: *const libc::sockaddr, addrlen: socklen_t) -> c_int {
    let timeout = IoReactor::current()
        .map(|r| r.config().connect_timeout_ms)
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS);
    connect_with_timeout(fd, addr, addrlen, timeout)
}

/// `connect(2)` with an explicit timeout
///
/// A non-blocking connect that returns `EINPROGRESS` arms a WRITE event
/// plus an optional condition timer and suspends; on resume `SO_ERROR`
/// distinguishes success from asynchronous failure.
pub fn connect_with_timeout(
    fd: c_int,
    addr: *const libc::sockaddr,
    addrlen: socklen_t,
    timeout_ms: u64,
) -> c_int {
    if !is_hook_enabled() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }
    let Some(ctx) = FdRegistry::instance().get(fd, false) else {
        return unsafe { libc::connect(fd, addr, addrlen) };
    };
    if ctx.is_closed() {
        set_errno(libc::EBADF);
        return -1;
    }
    if !ctx.is_socket() || ctx.user_nonblock() {
        return unsafe { libc::connect(fd, addr, addrlen) };
    }

    let n = unsafe { libc::connect(fd, addr, addrlen) };
    if n == 0 {
        return 0;
    }
    if n != -1 || errno() != libc::EINPROGRESS {
        return n;
    }

    // Handshake in flight
    let Some(reactor) = IoReactor::current() else {
        return n;
    };
    let marker: CancelMarker = Arc::new(AtomicI32::new(0));
    let timer = arm_timeout(&reactor, &marker, fd, Event::WRITE, timeout_ms);

    match reactor.add_event_marked(fd, Event::WRITE, &marker) {
        Ok(()) => {
            Fiber::yield_now();
            if let Some(t) = &timer {
                t.cancel();
            }
            let cancelled = marker.load(Ordering::SeqCst);
            if cancelled != 0 {
                set_errno(cancelled);
                return -1;
            }
        }
        Err(e) => {
            if let Some(t) = &timer {
                t.cancel();
            }
            log::error!("connect: arming WRITE on fd {} failed: {}", fd, e);
            if let Some(code) = e.raw_os_error() {
                set_errno(code);
            }
            return -1;
        }
    }

    // The socket is writable: read the handshake outcome
    let mut err: c_int = 0;
    let mut len = std::mem::size_of::<c_int>() as socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut c_void,
            &mut len,
        )
    };
    if rc == -1 {
        return -1;
    }
    if err == 0 {
        0
    } else {
        set_errno(err);
        -1
    }
}

/// `accept(2)`; the accepted descriptor is registered with the runtime
pub fn accept(fd: c_int, addr: *mut libc::sockaddr, addrlen: *mut socklen_t) -> c_int {
    let n = do_io(fd, "accept", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::accept(fd, addr, addrlen) as isize
    });
    if n >= 0 && is_hook_enabled() {
        FdRegistry::instance().get(n as c_int, true);
    }
    n as c_int
}

// ── Read family ──

/// `read(2)`
pub fn read(fd: c_int, buf: &mut [u8]) -> isize {
    do_io(fd, "read", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len())
    })
}

/// `readv(2)`
pub fn readv(fd: c_int, iov: &[libc::iovec]) -> isize {
    do_io(fd, "readv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::readv(fd, iov.as_ptr(), iov.len() as c_int)
    })
}

/// `recv(2)`
pub fn recv(fd: c_int, buf: &mut [u8], flags: c_int) -> isize {
    do_io(fd, "recv", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), flags)
    })
}

/// `recvfrom(2)`
pub fn recvfrom(
    fd: c_int,
    buf: &mut [u8],
    flags: c_int,
    src_addr: *mut libc::sockaddr,
    addrlen: *mut socklen_t,
) -> isize {
    do_io(fd, "recvfrom", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            flags,
            src_addr,
            addrlen,
        )
    })
}

/// `recvmsg(2)`
pub fn recvmsg(fd: c_int, msg: *mut libc::msghdr, flags: c_int) -> isize {
    do_io(fd, "recvmsg", Event::READ, TimeoutKind::Recv, || unsafe {
        libc::recvmsg(fd, msg, flags)
    })
}

// ── Write family ──

/// `write(2)`
pub fn write(fd: c_int, buf: &[u8]) -> isize {
    do_io(fd, "write", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::write(fd, buf.as_ptr() as *const c_void, buf.len())
    })
}

/// `writev(2)`
pub fn writev(fd: c_int, iov: &[libc::iovec]) -> isize {
    do_io(fd, "writev", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::writev(fd, iov.as_ptr(), iov.len() as c_int)
    })
}

/// `send(2)`
pub fn send(fd: c_int, buf: &[u8], flags: c_int) -> isize {
    do_io(fd, "send", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::send(fd, buf.as_ptr() as *const c_void, buf.len(), flags)
    })
}

/// `sendto(2)`
pub fn sendto(
    fd: c_int,
    buf: &[u8],
    flags: c_int,
    dest_addr: *const libc::sockaddr,
    addrlen: socklen_t,
) -> isize {
    do_io(fd, "sendto", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::sendto(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            flags,
            dest_addr,
            addrlen,
        )
    })
}

/// `sendmsg(2)`
pub fn sendmsg(fd: c_int, msg: *const libc::msghdr, flags: c_int) -> isize {
    do_io(fd, "sendmsg", Event::WRITE, TimeoutKind::Send, || unsafe {
        libc::sendmsg(fd, msg, flags)
    })
}

// ── Descriptor control ──

/// `close(2)`; cancels armed events so no fiber stays parked on a dead fd
pub fn close(fd: c_int) -> c_int {
    if !is_hook_enabled() {
        return unsafe { libc::close(fd) };
    }
    if FdRegistry::instance().get(fd, false).is_some() {
        if let Some(reactor) = IoReactor::current() {
            reactor.cancel_all(fd);
        }
        FdRegistry::instance().del(fd);
    }
    unsafe { libc::close(fd) }
}

/// `fcntl(2)` for the int-argument commands
///
/// `F_SETFL` records the user's `O_NONBLOCK` wish but keeps the kernel
/// flag forced on for managed sockets; `F_GETFL` reports the user's
/// perceived mode.
pub fn fcntl(fd: c_int, cmd: c_int, arg: c_int) -> c_int {
    match cmd {
        libc::F_SETFL => {
            let ctx = FdRegistry::instance()
                .get(fd, false)
                .filter(|c| !c.is_closed() && c.is_socket());
            let Some(ctx) = ctx else {
                return unsafe { libc::fcntl(fd, cmd, arg) };
            };
            ctx.set_user_nonblock(arg & libc::O_NONBLOCK != 0);
            let mut arg = arg;
            if ctx.sys_nonblock() {
                arg |= libc::O_NONBLOCK;
            } else {
                arg &= !libc::O_NONBLOCK;
            }
            unsafe { libc::fcntl(fd, cmd, arg) }
        }
        libc::F_GETFL => {
            let flags = unsafe { libc::fcntl(fd, cmd, 0) };
            if flags == -1 {
                return flags;
            }
            let ctx = FdRegistry::instance()
                .get(fd, false)
                .filter(|c| !c.is_closed() && c.is_socket());
            let Some(ctx) = ctx else {
                return flags;
            };
            if ctx.user_nonblock() {
                flags | libc::O_NONBLOCK
            } else {
                flags & !libc::O_NONBLOCK
            }
        }
        _ => unsafe { libc::fcntl(fd, cmd, arg) },
    }
}

/// `ioctl(2)`; intercepts `FIONBIO` the same way `fcntl` handles
/// `O_NONBLOCK`
pub fn ioctl(fd: c_int, request: c_ulong, arg: *mut c_void) -> c_int {
    if request == libc::FIONBIO {
        let ctx = FdRegistry::instance()
            .get(fd, false)
            .filter(|c| !c.is_closed() && c.is_socket());
        if let Some(ctx) = ctx {
            let user_nonblock = unsafe { *(arg as *const c_int) } != 0;
            ctx.set_user_nonblock(user_nonblock);
            // Kernel mode stays as the runtime enforces it
            let mut forced: c_int = ctx.sys_nonblock() as c_int;
            return unsafe { libc::ioctl(fd, request, &mut forced as *mut c_int) };
        }
    }
    unsafe { libc::ioctl(fd, request, arg) }
}

/// `getsockopt(2)` passthrough
pub fn getsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *mut c_void,
    optlen: *mut socklen_t,
) -> c_int {
    unsafe { libc::getsockopt(fd, level, optname, optval, optlen) }
}

/// `setsockopt(2)`; `SO_RCVTIMEO`/`SO_SNDTIMEO` are captured into the
/// registry (timeouts are managed in user space, not by the kernel)
pub fn setsockopt(
    fd: c_int,
    level: c_int,
    optname: c_int,
    optval: *const c_void,
    optlen: socklen_t,
) -> c_int {
    if !is_hook_enabled() {
        return unsafe { libc::setsockopt(fd, level, optname, optval, optlen) };
    }
    if level == libc::SOL_SOCKET && (optname == libc::SO_RCVTIMEO || optname == libc::SO_SNDTIMEO)
    {
        if let Some(ctx) = FdRegistry::instance().get(fd, false) {
            let tv = unsafe { &*(optval as *const libc::timeval) };
            let ms = tv.tv_sec as u64 * 1000 + tv.tv_usec as u64 / 1000;
            // A zero timeval disables the timeout, as with the kernel
            let ms = if ms == 0 { NO_TIMEOUT } else { ms };
            let kind = if optname == libc::SO_RCVTIMEO {
                TimeoutKind::Recv
            } else {
                TimeoutKind::Send
            };
            ctx.set_timeout(kind, ms);
            return 0;
        }
    }
    unsafe { libc::setsockopt(fd, level, optname, optval, optlen) }
}

/// `dup(2)`; the duplicate is re-registered so its I/O stays managed
pub fn dup(oldfd: c_int) -> c_int {
    let newfd = unsafe { libc::dup(oldfd) };
    if newfd >= 0 && is_hook_enabled() {
        FdRegistry::instance().get(newfd, true);
    }
    newfd
}

/// `dup2(2)`; any stale entry for `newfd` is replaced
pub fn dup2(oldfd: c_int, newfd: c_int) -> c_int {
    let rc = unsafe { libc::dup2(oldfd, newfd) };
    if rc >= 0 && is_hook_enabled() {
        FdRegistry::instance().del(newfd);
        FdRegistry::instance().get(newfd, true);
    }
    rc
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_socket() -> c_int {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
        assert!(fd >= 0);
        fd
    }

    #[test]
    fn test_hook_flag_is_per_thread() {
        set_hook_enable(true);
        assert!(is_hook_enabled());

        let handle = std::thread::spawn(|| is_hook_enabled());
        assert!(!handle.join().unwrap());

        set_hook_enable(false);
        assert!(!is_hook_enabled());
    }

    #[test]
    fn test_disabled_hook_is_passthrough() {
        set_hook_enable(false);

        // A pipe with data: read must behave exactly like raw read
        let mut fds = [0 as c_int; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        assert_eq!(unsafe { libc::write(fds[1], b"hi".as_ptr() as *const _, 2) }, 2);

        let mut buf = [0u8; 8];
        let n = read(fds[0], &mut buf);
        assert_eq!(n, 2);
        assert_eq!(&buf[..2], b"hi");

        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_fcntl_emulates_user_nonblock() {
        set_hook_enable(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);

        // Kernel flag is forced on; user view starts blocking
        let raw_flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(raw_flags & libc::O_NONBLOCK != 0);
        assert!(fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK == 0);

        // User requests non-blocking: view flips, kernel stays forced
        let flags = fcntl(fd, libc::F_GETFL, 0);
        assert_eq!(fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK), 0);
        assert!(fcntl(fd, libc::F_GETFL, 0) & libc::O_NONBLOCK != 0);
        let raw_flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
        assert!(raw_flags & libc::O_NONBLOCK != 0);

        close(fd);
        set_hook_enable(false);
    }

    #[test]
    fn test_setsockopt_captures_timeouts() {
        set_hook_enable(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);

        let tv = libc::timeval {
            tv_sec: 1,
            tv_usec: 500_000,
        };
        let rc = setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVTIMEO,
            &tv as *const _ as *const c_void,
            std::mem::size_of::<libc::timeval>() as socklen_t,
        );
        assert_eq!(rc, 0);

        let ctx = FdRegistry::instance().get(fd, false).unwrap();
        assert_eq!(ctx.timeout(TimeoutKind::Recv), 1500);
        assert_eq!(ctx.timeout(TimeoutKind::Send), NO_TIMEOUT);

        close(fd);
        set_hook_enable(false);
    }

    #[test]
    fn test_user_nonblock_gets_raw_errno() {
        set_hook_enable(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);

        // User explicitly non-blocking: the shim must not suspend
        let flags = fcntl(fd, libc::F_GETFL, 0);
        fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK);

        let mut buf = [0u8; 8];
        let n = recv(fd, &mut buf, 0);
        assert_eq!(n, -1);
        // Unconnected socket: ENOTCONN comes straight through
        assert_eq!(errno(), libc::ENOTCONN);

        close(fd);
        set_hook_enable(false);
    }

    #[test]
    fn test_dup_registers_duplicate() {
        set_hook_enable(true);
        let fd = socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        let dup_fd = dup(fd);
        assert!(dup_fd >= 0);

        let ctx = FdRegistry::instance().get(dup_fd, false).unwrap();
        assert!(ctx.is_socket());

        close(fd);
        close(dup_fd);
        set_hook_enable(false);
    }
}
