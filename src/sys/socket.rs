use std::io::{self, Error, ErrorKind};
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::path::Path;
use std::ptr;

use libc::{c_int, c_void, socklen_t};
use log::debug;

use super::fd::FileDesc;

// TODO: take the cap from /proc/sys/net/core/{rmem_max,wmem_max}
const MAX_SOCKET_BUFFER: c_int = 16 * 1024 * 1024;

pub fn setsockopt<T>(sock: &Socket, opt: c_int, val: c_int, payload: T) -> io::Result<()> {
    let payload = &payload as *const T as *const c_void;
    syscall!(setsockopt(
        sock.raw(),
        opt,
        val,
        payload,
        mem::size_of::<T>() as socklen_t
    ))?;
    Ok(())
}

pub fn getsockopt<T: Copy>(sock: &Socket, opt: c_int, val: c_int) -> io::Result<T> {
    let mut slot: T = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<T>() as socklen_t;
    syscall!(getsockopt(
        sock.raw(),
        opt,
        val,
        &mut slot as *mut _ as *mut _,
        &mut len
    ))?;
    assert_eq!(len as usize, mem::size_of::<T>());
    Ok(slot)
}

/// A prepared `sockaddr` for connect/bind, either internet or unix.
pub struct RawAddr {
    storage: libc::sockaddr_storage,
    len: socklen_t,
}

impl RawAddr {
    pub fn from_inet(addr: &SocketAddr) -> RawAddr {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

        let len = match addr {
            SocketAddr::V4(v4) => {
                let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
                unsafe {
                    (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                    (*sin).sin_port = v4.port().to_be();
                    (*sin).sin_addr = libc::in_addr {
                        s_addr: u32::from_ne_bytes(v4.ip().octets()),
                    };
                }
                mem::size_of::<libc::sockaddr_in>()
            }
            SocketAddr::V6(v6) => {
                let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
                unsafe {
                    (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    (*sin6).sin6_port = v6.port().to_be();
                    (*sin6).sin6_addr.s6_addr = v6.ip().octets();
                    (*sin6).sin6_flowinfo = v6.flowinfo();
                    (*sin6).sin6_scope_id = v6.scope_id();
                }
                mem::size_of::<libc::sockaddr_in6>()
            }
        };

        RawAddr {
            storage,
            len: len as socklen_t,
        }
    }

    pub fn from_unix<P: AsRef<Path>>(path: P) -> io::Result<RawAddr> {
        use std::os::unix::ffi::OsStrExt;

        let bytes = path.as_ref().as_os_str().as_bytes();

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let sun = &mut storage as *mut _ as *mut libc::sockaddr_un;

        let sun_path_len = unsafe { (*sun).sun_path.len() };
        if bytes.len() >= sun_path_len {
            return Err(Error::new(ErrorKind::InvalidInput, "socket path too long"));
        }
        if bytes.contains(&0) {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "socket path contains NUL",
            ));
        }

        unsafe {
            (*sun).sun_family = libc::AF_UNIX as libc::sa_family_t;
            for (dst, src) in (*sun).sun_path.iter_mut().zip(bytes.iter()) {
                *dst = *src as libc::c_char;
            }
        }

        let base = memoffset_sun_path();

        Ok(RawAddr {
            storage,
            len: (base + bytes.len() + 1) as socklen_t,
        })
    }

    fn as_ptr(&self) -> *const libc::sockaddr {
        &self.storage as *const _ as *const libc::sockaddr
    }
}

fn memoffset_sun_path() -> usize {
    let sun: libc::sockaddr_un = unsafe { mem::zeroed() };
    let base = &sun as *const _ as usize;
    let path = &sun.sun_path as *const _ as usize;
    path - base
}

pub fn sockaddr_to_addr(storage: &libc::sockaddr_storage, len: usize) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        libc::AF_INET => {
            assert!(len >= mem::size_of::<libc::sockaddr_in>());
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(
                ip,
                u16::from_be(sin.sin_port),
            )))
        }
        libc::AF_INET6 => {
            assert!(len >= mem::size_of::<libc::sockaddr_in6>());
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            )))
        }
        _ => Err(Error::new(ErrorKind::InvalidInput, "invalid argument")),
    }
}

/// A stream socket. All sends default to `MSG_NOSIGNAL` so a closed
/// peer surfaces as an error instead of SIGPIPE.
#[derive(Debug)]
pub struct Socket(FileDesc);

impl Socket {
    pub fn stream(addr: &SocketAddr) -> io::Result<Socket> {
        let fam = match addr {
            SocketAddr::V4(..) => libc::AF_INET,
            SocketAddr::V6(..) => libc::AF_INET6,
        };
        Socket::new_raw(fam, libc::SOCK_STREAM)
    }

    pub fn stream_unix() -> io::Result<Socket> {
        Socket::new_raw(libc::AF_UNIX, libc::SOCK_STREAM)
    }

    pub fn new_raw(fam: c_int, ty: c_int) -> io::Result<Socket> {
        let fd = syscall!(socket(fam, ty | libc::SOCK_CLOEXEC, 0))?;
        Ok(Socket(FileDesc::new(fd)))
    }

    pub fn new_pair(fam: c_int, ty: c_int) -> io::Result<(Socket, Socket)> {
        let mut fds = [0, 0];

        syscall!(socketpair(
            fam,
            ty | libc::SOCK_CLOEXEC,
            0,
            fds.as_mut_ptr()
        ))?;

        Ok((
            Socket(FileDesc::new(fds[0])),
            Socket(FileDesc::new(fds[1])),
        ))
    }

    pub fn raw(&self) -> libc::c_int {
        self.0.raw()
    }

    /// Binds a TCP listening socket (not yet listening) with
    /// `SO_REUSEADDR` set.
    pub fn bind_tcp(addr: &SocketAddr) -> io::Result<Socket> {
        let sock = Socket::stream(addr)?;
        sock.set_reuseaddr(true)?;
        let raw = RawAddr::from_inet(addr);
        syscall!(bind(sock.raw(), raw.as_ptr(), raw.len))?;
        Ok(sock)
    }

    /// Binds a unix-domain listening socket, replacing a stale path.
    pub fn bind_unix<P: AsRef<Path>>(path: P) -> io::Result<Socket> {
        let _ = std::fs::remove_file(path.as_ref());
        let sock = Socket::stream_unix()?;
        let raw = RawAddr::from_unix(path)?;
        syscall!(bind(sock.raw(), raw.as_ptr(), raw.len))?;
        Ok(sock)
    }

    pub fn listen(&self, backlog: c_int) -> io::Result<()> {
        syscall!(listen(self.raw(), backlog))?;
        Ok(())
    }

    /// Accepts one pending connection; `None` when nothing is pending.
    pub fn accept(&self) -> io::Result<Option<Socket>> {
        let res = loop {
            match syscall!(accept4(
                self.raw(),
                ptr::null_mut(),
                ptr::null_mut(),
                libc::SOCK_CLOEXEC
            )) {
                Err(ref e) if e.kind() == ErrorKind::Interrupted => (),
                other => break other,
            }
        };

        match res {
            Ok(fd) => Ok(Some(Socket(FileDesc::new(fd)))),
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Starts a connect. `Ok(true)` means connected already; `Ok(false)`
    /// means in progress, to be completed once the socket reports
    /// writable.
    pub fn connect(&self, addr: &RawAddr) -> io::Result<bool> {
        match syscall!(connect(self.raw(), addr.as_ptr(), addr.len)) {
            Ok(_) => Ok(true),
            Err(e) => match e.raw_os_error() {
                Some(libc::EINPROGRESS) | Some(libc::EALREADY) | Some(libc::EINTR)
                | Some(libc::EAGAIN) => Ok(false),
                Some(libc::EISCONN) => Ok(true),
                _ => Err(e),
            },
        }
    }

    /// Resolves an in-progress connect after writable readiness:
    /// `Ok(true)` connected, `Ok(false)` still pending, `Err` failed.
    pub fn finish_connect(&self) -> io::Result<bool> {
        if let Some(e) = self.take_error()? {
            return Err(e);
        }

        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;

        match syscall!(getpeername(
            self.raw(),
            &mut storage as *mut _ as *mut _,
            &mut len
        )) {
            Ok(_) => Ok(true),
            Err(ref e) if e.raw_os_error() == Some(libc::ENOTCONN) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let ret = syscall!(recv(
            self.raw(),
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            0
        ))?;
        Ok(ret as usize)
    }

    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        let ret = syscall!(send(
            self.raw(),
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL
        ))?;
        Ok(ret as usize)
    }

    pub fn shutdown(&self) -> io::Result<()> {
        syscall!(shutdown(self.raw(), libc::SHUT_RDWR))?;
        Ok(())
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        let mut nonblocking = nonblocking as c_int;
        syscall!(ioctl(self.raw(), libc::FIONBIO, &mut nonblocking)).map(|_| ())
    }

    pub fn set_nodelay(&self, nodelay: bool) -> io::Result<()> {
        setsockopt(self, libc::IPPROTO_TCP, libc::TCP_NODELAY, nodelay as c_int)
    }

    pub fn set_reuseaddr(&self, reuse: bool) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_REUSEADDR, reuse as c_int)
    }

    /// Raises the kernel receive buffer to the most the OS will grant.
    pub fn set_max_recv_buffer(&self) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_RCVBUF, MAX_SOCKET_BUFFER)?;

        let granted: c_int = getsockopt(self, libc::SOL_SOCKET, libc::SO_RCVBUF)?;
        debug!("receive buffer on fd {} is now {}", self.raw(), granted);

        Ok(())
    }

    /// Raises the kernel send buffer to the most the OS will grant.
    pub fn set_max_send_buffer(&self) -> io::Result<()> {
        setsockopt(self, libc::SOL_SOCKET, libc::SO_SNDBUF, MAX_SOCKET_BUFFER)?;

        let granted: c_int = getsockopt(self, libc::SOL_SOCKET, libc::SO_SNDBUF)?;
        debug!("send buffer on fd {} is now {}", self.raw(), granted);

        Ok(())
    }

    pub fn take_error(&self) -> io::Result<Option<io::Error>> {
        let raw: c_int = getsockopt(self, libc::SOL_SOCKET, libc::SO_ERROR)?;
        if raw == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(raw)))
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let mut len = mem::size_of_val(&storage) as socklen_t;
        syscall!(getsockname(
            self.raw(),
            &mut storage as *mut _ as *mut _,
            &mut len
        ))?;
        sockaddr_to_addr(&storage, len as usize)
    }
}

impl std::os::unix::io::AsRawFd for Socket {
    fn as_raw_fd(&self) -> std::os::unix::io::RawFd {
        self.raw()
    }
}

impl std::os::unix::io::FromRawFd for Socket {
    unsafe fn from_raw_fd(fd: std::os::unix::io::RawFd) -> Socket {
        Socket(FileDesc::new(fd))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn pair_round_trip() {
        let (a, b) = Socket::new_pair(libc::AF_UNIX, libc::SOCK_STREAM).unwrap();

        assert_eq!(a.send(b"ping").unwrap(), 4);

        let mut buf = [0u8; 16];
        assert_eq!(b.recv(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
    }

    #[test]
    fn nonblocking_recv_would_block() {
        let (a, _b) = Socket::new_pair(libc::AF_UNIX, libc::SOCK_STREAM).unwrap();
        a.set_nonblocking(true).unwrap();

        let mut buf = [0u8; 16];
        let err = a.recv(&mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn max_buffer_helpers_grow_the_socket() {
        let (a, _b) = Socket::new_pair(libc::AF_UNIX, libc::SOCK_STREAM).unwrap();

        a.set_max_recv_buffer().unwrap();
        a.set_max_send_buffer().unwrap();

        // the kernel clamps to its configured maximum; it must at
        // least report something sane back
        let rcv: libc::c_int = getsockopt(&a, libc::SOL_SOCKET, libc::SO_RCVBUF).unwrap();
        let snd: libc::c_int = getsockopt(&a, libc::SOL_SOCKET, libc::SO_SNDBUF).unwrap();
        assert!(rcv >= 4096);
        assert!(snd >= 4096);
    }

    #[test]
    fn inet_addr_round_trip() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let sock = Socket::bind_tcp(&addr).unwrap();

        let local = sock.local_addr().unwrap();
        assert_eq!(local.ip(), addr.ip());
        assert_ne!(local.port(), 0);
    }
}
