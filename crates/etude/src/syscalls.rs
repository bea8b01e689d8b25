// src/syscalls.rs
use crate::error::EtudeResult;
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ptr;

// ---- Socket Operations ----

/// Create a non-blocking TCP listening socket with SO_REUSEADDR.
pub fn create_listen_socket(addr: &str) -> EtudeResult<c_int> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    unsafe {
        // 1. Atomic non-blocking socket
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // 2. SO_REUSEADDR so restarts don't trip over TIME_WAIT
        if let Err(e) = set_reuseaddr(fd) {
            libc::close(fd);
            return Err(e);
        }

        // 3. Bind
        bind_addr(fd, &addr)?;

        // 4. Listen
        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        Ok(fd)
    }
}

/// Bind a socket to an address. Closes the socket on failure.
fn bind_addr(fd: c_int, addr: &SocketAddr) -> EtudeResult<()> {
    unsafe {
        let res = match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
        Ok(())
    }
}

/// Local address a bound socket ended up on (useful after binding port 0).
pub fn local_addr(fd: c_int) -> EtudeResult<SocketAddr> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        if libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        sockaddr_to_addr(&storage).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidData, "unsupported address family").into()
        })
    }
}

/// Accept a non-blocking connection together with the peer address.
/// Returns `None` once the backlog is drained.
pub fn accept_connection(listen_fd: c_int) -> EtudeResult<Option<(c_int, Option<SocketAddr>)>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::WouldBlock => Ok(None),
                // The peer gave up before we got to it; keep draining.
                io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted => {
                    accept_connection(listen_fd)
                }
                _ => Err(err.into()),
            }
        } else {
            Ok(Some((fd, sockaddr_to_addr(&storage))))
        }
    }
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Some(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Some(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => None,
    }
}

/// Flip a descriptor to non-blocking mode. Returns the previous flags.
pub fn set_nonblocking(fd: c_int) -> EtudeResult<c_int> {
    unsafe {
        let old = libc::fcntl(fd, libc::F_GETFL);
        if old < 0 {
            return Err(io::Error::last_os_error().into());
        }
        if libc::fcntl(fd, libc::F_SETFL, old | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(old)
    }
}

pub fn set_reuseaddr(fd: c_int) -> EtudeResult<()> {
    let one: c_int = 1;
    unsafe {
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ---- Epoll Operations ----

pub use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, epoll_event};

/// Direction a one-shot registration is rearmed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Readable,
    Writable,
}

impl Interest {
    fn bits(self) -> i32 {
        match self {
            Interest::Readable => libc::EPOLLIN,
            Interest::Writable => libc::EPOLLOUT,
        }
    }
}

/// Epoll instance. Every registration is edge-triggered and watches for
/// peer half-close. The token of a registration is its descriptor number.
///
/// One-shot registrations deliver at most one event and then stay silent
/// until [`Epoll::rearm`] is called, so a descriptor is never handed to two
/// workers at once as long as every handler rearms exactly once.
#[derive(Debug)]
pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> EtudeResult<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// Make `fd` non-blocking and register it for read readiness.
    pub fn register(&self, fd: c_int, one_shot: bool) -> EtudeResult<()> {
        let mut interests = EPOLLIN | libc::EPOLLET | EPOLLRDHUP;
        if one_shot {
            interests |= libc::EPOLLONESHOT;
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, interests)?;
        set_nonblocking(fd)?;
        Ok(())
    }

    /// Re-enable a one-shot registration for the given direction.
    pub fn rearm(&self, fd: c_int, interest: Interest) -> EtudeResult<()> {
        self.ctl(
            libc::EPOLL_CTL_MOD,
            fd,
            interest.bits() | libc::EPOLLET | libc::EPOLLONESHOT | EPOLLRDHUP,
        )
    }

    /// Remove `fd` from the interest list and close it.
    pub fn deregister(&self, fd: c_int) -> EtudeResult<()> {
        let res = unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) };
        let err = (res < 0).then(io::Error::last_os_error);
        close_fd(fd);
        match err {
            Some(e) if e.raw_os_error() != Some(libc::ENOENT) => Err(e.into()),
            _ => Ok(()),
        }
    }

    fn ctl(&self, op: c_int, fd: c_int, interests: i32) -> EtudeResult<()> {
        let mut event = epoll_event {
            events: interests as u32,
            u64: fd as u64,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> EtudeResult<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }

            Ok(res as usize)
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        close_fd(self.fd);
    }
}

// ---- Non-blocking transfer ----

/// Read into `buf`. `Ok(None)` means the socket would block, `Ok(Some(0))`
/// means end of stream.
pub fn read_nonblocking(fd: c_int, buf: &mut [u8]) -> EtudeResult<Option<usize>> {
    loop {
        let res = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

/// Vectored send: write multiple buffers in a single syscall (scatter-gather I/O).
/// `MSG_NOSIGNAL` keeps a vanished peer from raising SIGPIPE.
/// `Ok(None)` means the socket would block.
pub fn sendmsg_nonblocking(fd: c_int, bufs: &[&[u8]]) -> EtudeResult<Option<usize>> {
    // Build iovec array on stack (max 8 segments)
    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(8);

    for (iov, buf) in iovecs.iter_mut().zip(bufs.iter().take(iov_count)) {
        *iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_iov = iovecs.as_mut_ptr();
    msg.msg_iovlen = iov_count as _;

    loop {
        let res = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err.into()),
        }
    }
}

/// Best-effort single send, used for the "server busy" notice.
pub fn send_nonblocking(fd: c_int, buf: &[u8]) -> EtudeResult<Option<usize>> {
    sendmsg_nonblocking(fd, &[buf])
}
