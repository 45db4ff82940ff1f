// src/syscalls.rs
//
// Endpoint primitives: thin wrappers over the OS socket API. No retry
// policy at this layer; WouldBlock surfaces through the error kind.
use libc::{c_int, c_void, socklen_t};
use std::io;
use std::mem;
use std::net::Ipv4Addr;
use std::ptr;

// Not exposed by the `libc` crate on Linux; value from linux/sockios.h.
#[cfg(target_os = "linux")]
const SIOCATMARK: libc::Ioctl = 0x8905;
#[cfg(not(target_os = "linux"))]
use libc::SIOCATMARK;

// ---- Socket operations ----

/// Create a plain TCP socket.
pub fn tcp_socket() -> io::Result<c_int> {
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(fd)
}

/// Create a TCP listener bound to all interfaces on `port`.
///
/// The socket is closed before returning on any partial failure.
pub fn tcp_listener(port: u16, backlog: c_int) -> io::Result<c_int> {
    let fd = tcp_socket()?;

    unsafe {
        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let addr = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
    }

    Ok(fd)
}

/// Accept one pending connection. The accepted descriptor is created
/// nonblocking. Returns `Ok(None)` when the queue is drained.
pub fn accept(listen_fd: c_int) -> io::Result<Option<c_int>> {
    let fd = unsafe {
        libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK,
        )
    };

    if fd < 0 {
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock {
            Ok(None)
        } else {
            Err(err)
        }
    } else {
        Ok(Some(fd))
    }
}

/// Connect `fd` to a remote IPv4 endpoint.
pub fn connect(fd: c_int, ip: Ipv4Addr, port: u16) -> io::Result<()> {
    let addr = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(ip.octets()),
        },
        sin_zero: [0; 8],
    };

    let ret = unsafe {
        libc::connect(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of_val(&addr) as socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set a descriptor to nonblocking mode.
pub fn set_nonblocking(fd: c_int) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Create a connected stream socket pair (used as an in-band signal
/// channel).
pub fn socketpair_stream() -> io::Result<[c_int; 2]> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(fds)
}

// ---- Data transfer ----

/// Read from a socket. `Ok(0)` is an orderly close; transient emptiness
/// under edge-triggered mode surfaces as `WouldBlock`.
pub fn read(fd: c_int, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Read a single out-of-band byte. Returns `Ok(None)` when the stream is
/// not at the urgent mark or the peer sent nothing.
pub fn read_oob(fd: c_int) -> io::Result<Option<u8>> {
    let mut mark: c_int = 0;
    if unsafe { libc::ioctl(fd, SIOCATMARK, &mut mark) } < 0 {
        return Err(io::Error::last_os_error());
    }
    if mark == 0 {
        return Ok(None);
    }

    let mut byte = [0u8; 1];
    let n = unsafe { libc::recv(fd, byte.as_mut_ptr() as *mut c_void, 1, libc::MSG_OOB) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    if n == 0 {
        return Ok(None);
    }
    Ok(Some(byte[0]))
}

/// Write to a socket. Short writes are possible; `MSG_NOSIGNAL` keeps a
/// dead peer from raising SIGPIPE.
pub fn write(fd: c_int, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::send(
            fd,
            buf.as_ptr() as *const c_void,
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Close a descriptor.
pub fn close(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}
