// src/syscalls.rs
use crate::error::{EtudeError, EtudeResult};
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;

pub use libc::{EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, epoll_event};

/// Readiness delivery mode for an epoll registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Level,
    Edge,
}

impl Trigger {
    #[inline(always)]
    fn flag(self) -> u32 {
        match self {
            Trigger::Level => 0,
            Trigger::Edge => libc::EPOLLET as u32,
        }
    }
}

#[inline(always)]
fn cvt(res: c_int) -> io::Result<c_int> {
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}

fn set_opt<T>(fd: RawFd, level: c_int, name: c_int, value: &T) -> io::Result<()> {
    unsafe {
        cvt(libc::setsockopt(
            fd,
            level,
            name,
            value as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        ))?;
    }
    Ok(())
}

fn to_sockaddr(addr: &SocketAddr) -> (libc::sockaddr_storage, socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe {
                ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin);
            }
            mem::size_of::<libc::sockaddr_in>()
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
            unsafe {
                ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6);
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as socklen_t)
}

fn from_sockaddr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
        }
        libc::AF_INET6 => {
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            Ok(SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("unsupported address family {family}"),
        )),
    }
}

// ---- Socket Operations ----

/// Create a non-blocking TCP listener with SO_REUSEADDR. With `linger` the
/// socket closes gracefully with a one second SO_LINGER.
pub fn create_listen_socket(addr: SocketAddr, linger: bool) -> EtudeResult<OwnedFd> {
    let domain = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };

    let fd = unsafe {
        cvt(libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        ))?
    };
    // From here on the OwnedFd closes the socket on every early return.
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };

    let on = libc::linger {
        l_onoff: if linger { 1 } else { 0 },
        l_linger: 1,
    };
    set_opt(fd, libc::SOL_SOCKET, libc::SO_LINGER, &on)?;

    let one: c_int = 1;
    set_opt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, &one)?;

    let (storage, len) = to_sockaddr(&addr);
    unsafe {
        cvt(libc::bind(
            fd,
            &storage as *const _ as *const libc::sockaddr,
            len,
        ))?;
        cvt(libc::listen(fd, libc::SOMAXCONN))?;
    }

    Ok(sock)
}

/// Address a socket is bound to. Needed to discover an ephemeral port.
pub fn local_addr(fd: RawFd) -> EtudeResult<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    unsafe {
        cvt(libc::getsockname(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        ))?;
    }
    Ok(from_sockaddr(&storage)?)
}

/// Accept a non-blocking connection. `Ok(None)` means the backlog is empty.
pub fn accept_connection(listen_fd: RawFd) -> EtudeResult<Option<(OwnedFd, SocketAddr)>> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;

    let fd = unsafe {
        libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if fd < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock => Ok(None),
            _ => Err(err.into()),
        };
    }

    let sock = unsafe { OwnedFd::from_raw_fd(fd) };
    let peer = from_sockaddr(&storage)?;
    Ok(Some((sock, peer)))
}

/// Write a short diagnostic straight to a socket that is about to be dropped.
pub fn show_error(fd: RawFd, info: &str) {
    let _ = write_nonblocking(fd, info.as_bytes());
}

// ---- Epoll Operations (Linux Only) ----

pub struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub fn new() -> EtudeResult<Self> {
        let fd = unsafe { cvt(libc::epoll_create1(libc::EPOLL_CLOEXEC))? };
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    fn ctl(&self, op: c_int, fd: RawFd, token: u64, events: u32) -> EtudeResult<()> {
        let mut event = epoll_event { events, u64: token };
        unsafe {
            cvt(libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event))?;
        }
        Ok(())
    }

    /// Register `fd`. One-shot registrations stay silent after the first
    /// event until re-armed through [`modify`](Self::modify).
    pub fn add(
        &self,
        fd: RawFd,
        token: u64,
        interests: i32,
        trigger: Trigger,
        oneshot: bool,
    ) -> EtudeResult<()> {
        let mut events = interests as u32 | trigger.flag();
        if oneshot {
            events |= libc::EPOLLONESHOT as u32;
        }
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, events)
    }

    /// Re-arm a one-shot registration with a new interest set.
    pub fn modify(&self, fd: RawFd, token: u64, interests: i32, trigger: Trigger) -> EtudeResult<()> {
        let events = interests as u32 | trigger.flag() | libc::EPOLLONESHOT as u32;
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, events)
    }

    pub fn delete(&self, fd: RawFd) -> EtudeResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Block for readiness. A negative timeout waits indefinitely; EINTR
    /// reports zero events.
    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> EtudeResult<usize> {
        let res = unsafe {
            libc::epoll_wait(
                self.fd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            )
        };
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

// ---- Non-blocking I/O ----
//
// `Ok(None)` is would-block; `Ok(Some(0))` from a read is end of stream.

pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> EtudeResult<Option<usize>> {
    let res = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
    if res < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
            _ => Err(err.into()),
        };
    }
    Ok(Some(res as usize))
}

pub fn write_nonblocking(fd: RawFd, buf: &[u8]) -> EtudeResult<Option<usize>> {
    let res = unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) };
    if res < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
            _ => Err(err.into()),
        };
    }
    Ok(Some(res as usize))
}

/// Vectored write: write multiple buffers in a single syscall (scatter-gather I/O)
pub fn writev_nonblocking(fd: RawFd, bufs: &[&[u8]]) -> EtudeResult<Option<usize>> {
    if bufs.is_empty() {
        return Ok(Some(0));
    }

    // Build iovec array on stack (max 8 segments)
    let mut iovecs: [libc::iovec; 8] = unsafe { mem::zeroed() };
    let iov_count = bufs.len().min(8);

    for i in 0..iov_count {
        iovecs[i] = libc::iovec {
            iov_base: bufs[i].as_ptr() as *mut c_void,
            iov_len: bufs[i].len(),
        };
    }

    let res = unsafe { libc::writev(fd, iovecs.as_ptr(), iov_count as c_int) };
    if res < 0 {
        let err = io::Error::last_os_error();
        return match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
            _ => Err(err.into()),
        };
    }
    Ok(Some(res as usize))
}

// ---- Self-pipe ----

/// Read half of a self-pipe, registered with epoll by the dispatcher.
pub struct PipeReader {
    fd: OwnedFd,
}

/// Cloneable write half. Any thread may ring it.
#[derive(Clone)]
pub struct Notifier {
    fd: Arc<OwnedFd>,
}

/// Create a non-blocking pipe. Returns (read half, write half).
pub fn self_pipe() -> EtudeResult<(PipeReader, Notifier)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        cvt(libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC))?;
    }
    let reader = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let writer = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    Ok((
        PipeReader { fd: reader },
        Notifier {
            fd: Arc::new(writer),
        },
    ))
}

impl PipeReader {
    #[inline(always)]
    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Read every pending byte into `out`.
    pub fn drain(&self, out: &mut Vec<u8>) -> EtudeResult<usize> {
        let mut chunk = [0u8; 256];
        let mut total = 0;
        loop {
            match read_nonblocking(self.fd.as_raw_fd(), &mut chunk)? {
                Some(0) => {
                    return Err(EtudeError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "self-pipe writer closed",
                    )));
                }
                Some(n) => {
                    out.extend_from_slice(&chunk[..n]);
                    total += n;
                }
                None => return Ok(total),
            }
        }
    }
}

impl Notifier {
    /// Queue one byte for the reader. A full pipe already holds a pending
    /// wakeup, so the byte is dropped and `false` returned.
    pub fn notify(&self, byte: u8) -> bool {
        matches!(write_nonblocking(self.fd.as_raw_fd(), &[byte]), Ok(Some(1)))
    }
}
