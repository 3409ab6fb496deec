use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, TcpStream, UdpSocket};
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn set_cloexec(fd: RawFd) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let len = match *addr {
        SocketAddr::V4(ref a) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = a.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from(*a.ip()).to_be(),
                };
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(ref a) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = a.port().to_be();
                (*sin6).sin6_addr = libc::in6_addr {
                    s6_addr: a.ip().octets(),
                };
                (*sin6).sin6_flowinfo = a.flowinfo();
                (*sin6).sin6_scope_id = a.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };

    (storage, len as libc::socklen_t)
}

fn new_socket(addr: &SocketAddr, kind: libc::c_int) -> io::Result<OwnedFd> {
    let family = match *addr {
        SocketAddr::V4(..) => libc::AF_INET,
        SocketAddr::V6(..) => libc::AF_INET6,
    };

    let fd = unsafe { libc::socket(family, kind, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    set_cloexec(fd.as_raw_fd())?;
    set_nonblocking(fd.as_raw_fd())?;
    Ok(fd)
}

/// Start a non-blocking connect. The caller waits for writability and
/// then checks `take_socket_error` before trusting the stream.
pub fn tcp_connect(addr: &SocketAddr) -> io::Result<TcpStream> {
    let fd = new_socket(addr, libc::SOCK_STREAM)?;
    let (storage, len) = sockaddr_from(addr);

    let rc = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &storage as *const _ as *const libc::sockaddr,
            len,
        )
    };
    if rc != 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::EINPROGRESS) {
            return Err(err);
        }
    }

    Ok(unsafe { TcpStream::from_raw_fd(fd.into_raw_fd()) })
}

/// Connect carrying the first bytes in the SYN where the platform can
/// (`MSG_FASTOPEN`). Returns the stream and how many bytes the kernel
/// took; whatever it did not take must be written the ordinary way.
pub fn tcp_connect_fast_open(addr: &SocketAddr, data: &[u8]) -> io::Result<(TcpStream, usize)> {
    #[cfg(target_os = "linux")]
    {
        let fd = new_socket(addr, libc::SOCK_STREAM)?;
        let (storage, len) = sockaddr_from(addr);

        let rc = unsafe {
            libc::sendto(
                fd.as_raw_fd(),
                data.as_ptr() as *const libc::c_void,
                data.len(),
                libc::MSG_FASTOPEN,
                &storage as *const _ as *const libc::sockaddr,
                len,
            )
        };
        if rc >= 0 {
            let stream = unsafe { TcpStream::from_raw_fd(fd.into_raw_fd()) };
            return Ok((stream, rc as usize));
        }

        let err = io::Error::last_os_error();
        // without a cookie the kernel falls back to a plain handshake
        if err.raw_os_error() == Some(libc::EINPROGRESS) {
            let stream = unsafe { TcpStream::from_raw_fd(fd.into_raw_fd()) };
            return Ok((stream, 0));
        }

        drop(fd);
        tcp_connect(addr).map(|stream| (stream, 0))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = data;
        tcp_connect(addr).map(|stream| (stream, 0))
    }
}

/// Ask the kernel to accept data riding on incoming SYNs.
pub fn listen_fast_open(fd: RawFd) -> io::Result<()> {
    #[cfg(target_os = "linux")]
    {
        let qlen: libc::c_int = 5;
        setsockopt(fd, libc::IPPROTO_TCP, libc::TCP_FASTOPEN, qlen)
    }

    #[cfg(not(target_os = "linux"))]
    {
        let _ = fd;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "fast open not supported on this platform",
        ))
    }
}

#[cfg(target_os = "linux")]
fn setsockopt<T>(fd: RawFd, level: libc::c_int, name: libc::c_int, value: T) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Pending asynchronous connect result, readable once the fd turns
/// writable.
pub fn take_socket_error(fd: RawFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        Err(io::Error::last_os_error())
    } else if err != 0 {
        Err(io::Error::from_raw_os_error(err))
    } else {
        Ok(())
    }
}

/// Non-blocking pipe pair (read end, write end), both ends non-blocking
/// so a full pipe never stalls the writer.
pub fn pipe() -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];
    if unsafe { libc::pipe(fds.as_mut_ptr()) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let read = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let write = unsafe { OwnedFd::from_raw_fd(fds[1]) };

    for fd in [read.as_raw_fd(), write.as_raw_fd()] {
        set_cloexec(fd)?;
        set_nonblocking(fd)?;
    }
    Ok((read, write))
}

/// Unbound non-blocking UDP socket in the destination's address family,
/// used as the outbound half of one NAT entry.
pub fn udp_socket(peer: &SocketAddr) -> io::Result<UdpSocket> {
    let bind: SocketAddr = match *peer {
        SocketAddr::V4(..) => SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0),
        SocketAddr::V6(..) => SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), 0),
    };

    let socket = UdpSocket::bind(bind)?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

#[cfg(test)]
mod test {
    use std::io::Read;
    use std::net::TcpListener;
    use std::os::fd::AsRawFd;

    use super::*;

    #[test]
    fn test_pipe_wakes_and_drains() {
        let (read, write) = pipe().unwrap();

        let rc = unsafe { libc::write(write.as_raw_fd(), b"x".as_ptr() as *const _, 1) };
        assert_eq!(rc, 1);

        let mut buf = [0u8; 8];
        let rc = unsafe { libc::read(read.as_raw_fd(), buf.as_mut_ptr() as *mut _, 8) };
        assert_eq!(rc, 1);
        assert_eq!(buf[0], b'x');

        // drained pipe must not block
        let rc = unsafe { libc::read(read.as_raw_fd(), buf.as_mut_ptr() as *mut _, 8) };
        assert!(rc < 0);
        let err = io::Error::last_os_error();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_nonblocking_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = tcp_connect(&addr).unwrap();
        let (mut accepted, _) = listener.accept().unwrap();

        take_socket_error(stream.as_raw_fd()).unwrap();

        drop(stream);
        let mut buf = [0u8; 1];
        assert_eq!(accepted.read(&mut buf).unwrap(), 0);
    }
}
