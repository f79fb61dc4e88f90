//! Cooperative TCP wrappers over the syscall shims
//!
//! Thin typed veneer used by the RPC and storage layers (and the test
//! suites): socket setup is raw, while accept/connect/read/write go
//! through the cooperative wrappers, so calls block the fiber instead of
//! the worker thread.

use crate::hook;
use std::net::Ipv4Addr;
use std::os::unix::io::RawFd;

fn sockaddr_v4(ip: Ipv4Addr, port: u16) -> libc::sockaddr_in {
    let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
    addr.sin_family = libc::AF_INET as libc::sa_family_t;
    addr.sin_port = port.to_be();
    addr.sin_addr.s_addr = u32::from(ip).to_be();
    addr
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// A TCP listener whose `accept` suspends the calling fiber
pub struct TcpListener {
    fd: RawFd,
}

impl TcpListener {
    /// Bind and listen on `ip:port` (port 0 picks an ephemeral port)
    pub fn bind(ip: Ipv4Addr, port: u16) -> Result<TcpListener, i32> {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(last_errno());
        }

        let opt: libc::c_int = 1;
        unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                &opt as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            );
        }

        let addr = sockaddr_v4(ip, port);
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        if rc != 0 {
            let err = last_errno();
            hook::close(fd);
            return Err(err);
        }

        if unsafe { libc::listen(fd, 1024) } != 0 {
            let err = last_errno();
            hook::close(fd);
            return Err(err);
        }

        Ok(TcpListener { fd })
    }

    /// Bind with an explicit backlog (tests saturate tiny backlogs to
    /// provoke hanging connects)
    pub fn bind_with_backlog(ip: Ipv4Addr, port: u16, backlog: i32) -> Result<TcpListener, i32> {
        let listener = Self::bind(ip, port)?;
        unsafe {
            libc::listen(listener.fd, backlog);
        }
        Ok(listener)
    }

    /// Port actually bound (useful after binding port 0)
    pub fn local_port(&self) -> u16 {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rc = unsafe {
            libc::getsockname(self.fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len)
        };
        if rc != 0 {
            return 0;
        }
        u16::from_be(addr.sin_port)
    }

    /// Accept one connection, suspending the fiber until a client shows
    pub fn accept(&self) -> Result<TcpStream, i32> {
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let fd = hook::accept(self.fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len);
        if fd < 0 {
            return Err(last_errno());
        }
        Ok(TcpStream { fd })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TcpListener {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}

/// A TCP connection whose reads and writes suspend the calling fiber
pub struct TcpStream {
    fd: RawFd,
}

impl TcpStream {
    /// Connect with the runtime's default timeout
    pub fn connect(ip: Ipv4Addr, port: u16) -> Result<TcpStream, i32> {
        Self::connect_ms(ip, port, None)
    }

    /// Connect with an explicit timeout in milliseconds
    pub fn connect_timeout(ip: Ipv4Addr, port: u16, timeout_ms: u64) -> Result<TcpStream, i32> {
        Self::connect_ms(ip, port, Some(timeout_ms))
    }

    fn connect_ms(ip: Ipv4Addr, port: u16, timeout_ms: Option<u64>) -> Result<TcpStream, i32> {
        let fd = hook::socket(libc::AF_INET, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(last_errno());
        }
        let addr = sockaddr_v4(ip, port);
        let rc = match timeout_ms {
            Some(ms) => hook::connect_with_timeout(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                ms,
            ),
            None => hook::connect(
                fd,
                &addr as *const _ as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            ),
        };
        if rc != 0 {
            let err = last_errno();
            hook::close(fd);
            return Err(err);
        }
        Ok(TcpStream { fd })
    }

    /// Adopt an already-connected descriptor
    pub fn from_raw(fd: RawFd) -> TcpStream {
        TcpStream { fd }
    }

    /// Read into `buf`; 0 means the peer closed
    pub fn read(&self, buf: &mut [u8]) -> isize {
        hook::recv(self.fd, buf, 0)
    }

    /// Single write; may be partial
    pub fn write(&self, buf: &[u8]) -> isize {
        hook::send(self.fd, buf, 0)
    }

    /// Write the whole buffer, looping over partial sends
    pub fn write_all(&self, mut buf: &[u8]) -> isize {
        let mut total: isize = 0;
        while !buf.is_empty() {
            let n = self.write(buf);
            if n < 0 {
                return n;
            }
            total += n;
            buf = &buf[n as usize..];
        }
        total
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for TcpStream {
    fn drop(&mut self) {
        hook::close(self.fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_port() {
        let listener = TcpListener::bind(Ipv4Addr::LOCALHOST, 0).unwrap();
        assert!(listener.local_port() > 0);
    }

    #[test]
    fn test_plain_echo_without_runtime() {
        // Hook disabled: everything passes through to blocking syscalls,
        // so the wrappers must still work as ordinary sockets
        let listener = TcpListener::bind(Ipv4Addr::LOCALHOST, 0).unwrap();
        let port = listener.local_port();

        let server = std::thread::spawn(move || {
            let stream = listener.accept().unwrap();
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf);
            assert_eq!(n, 4);
            assert_eq!(stream.write_all(&buf[..4]), 4);
        });

        let client = TcpStream::connect(Ipv4Addr::LOCALHOST, port).unwrap();
        assert_eq!(client.write_all(b"ping"), 4);
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf), 4);
        assert_eq!(&buf[..4], b"ping");

        server.join().unwrap();
    }
}
