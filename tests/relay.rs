//! End to end tests: a real local and server pair on loopback, driven
//! through plain std sockets like any socks5 client would.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::thread;
use std::time::Duration;

use umbra::config::{LocalConfig, ServerConfig};
use umbra::crypto::Method;
use umbra::{Local, Server};

const PASSWORD: &str = "between-us";

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind throwaway socket");
    listener.local_addr().expect("throwaway addr").port()
}

/// Starts a tunnel pair on fresh ports and returns (local, server) addresses.
/// Both serve loops run on detached threads for the life of the test binary.
fn start_pair(method: &str) -> (SocketAddr, SocketAddr) {
    let local_addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().expect("addr");
    let server_addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().expect("addr");
    let method = Method::new(method).expect("method");

    let server_config = ServerConfig {
        listen: server_addr,
        password: PASSWORD.to_string(),
        method,
        timeout: Duration::from_secs(5),
        fast_open: false,
        workers: 1,
    };
    thread::spawn(move || {
        let _ = Server::new(server_config).serve();
    });

    let local_config = LocalConfig {
        listen: local_addr,
        server: server_addr,
        password: PASSWORD.to_string(),
        method,
        timeout: Duration::from_secs(5),
        fast_open: false,
    };
    thread::spawn(move || {
        let _ = Local::new(local_config).serve();
    });

    wait_listening(server_addr);
    wait_listening(local_addr);
    (local_addr, server_addr)
}

fn wait_listening(addr: SocketAddr) {
    for _ in 0..100 {
        if TcpStream::connect_timeout(&addr, Duration::from_millis(100)).is_ok() {
            return;
        }
        thread::sleep(Duration::from_millis(20));
    }
    panic!("{} never started listening", addr);
}

/// Starts only the local half, pointed at `server` whether or not
/// anything answers there.
fn start_local_only(method: &str, server: SocketAddr) -> SocketAddr {
    let local_addr: SocketAddr = format!("127.0.0.1:{}", free_port()).parse().expect("addr");
    let config = LocalConfig {
        listen: local_addr,
        server,
        password: PASSWORD.to_string(),
        method: Method::new(method).expect("method"),
        timeout: Duration::from_secs(5),
        fast_open: false,
    };
    thread::spawn(move || {
        let _ = Local::new(config).serve();
    });
    wait_listening(local_addr);
    local_addr
}

/// A tcp echo server on an ephemeral port.
fn start_echo() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind echo");
    let addr = listener.local_addr().expect("echo addr");
    thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(s) => s,
                Err(_) => break,
            };
            thread::spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

fn start_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind udp echo");
    let addr = socket.local_addr().expect("udp echo addr");
    thread::spawn(move || {
        let mut buf = [0u8; 2048];
        while let Ok((n, from)) = socket.recv_from(&mut buf) {
            if socket.send_to(&buf[..n], from).is_err() {
                break;
            }
        }
    });
    addr
}

fn push_target_v4(out: &mut Vec<u8>, target: SocketAddr) {
    match target {
        SocketAddr::V4(v4) => {
            out.extend_from_slice(&v4.ip().octets());
            out.extend_from_slice(&v4.port().to_be_bytes());
        }
        SocketAddr::V6(_) => panic!("tests use v4 targets"),
    }
}

/// Sends a connect request for `target` and reads the reply off `stream`.
fn socks5_request(stream: &mut TcpStream, target: SocketAddr) {
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    push_target_v4(&mut request, target);
    stream.write_all(&request).expect("write request");

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).expect("read reply");
    assert_eq!(head[0], 0x05);
    assert_eq!(head[1], 0x00, "request was refused");
    let bound = match head[3] {
        0x01 => 4 + 2,
        0x04 => 16 + 2,
        other => panic!("unexpected bound address type {}", other),
    };
    let mut rest = vec![0u8; bound];
    stream.read_exact(&mut rest).expect("read bound address");
}

/// Full no-auth handshake plus connect, returns the proxied stream.
fn socks5_connect(proxy: SocketAddr, target: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).expect("connect proxy");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");

    stream.write_all(&[0x05, 0x01, 0x00]).expect("write methods");
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).expect("read choice");
    assert_eq!(choice, [0x05, 0x00]);

    socks5_request(&mut stream, target);
    stream
}

#[test]
fn test_tcp_echo_round_trip() {
    let echo = start_echo();
    let (proxy, _) = start_pair("aes-256-ctr");

    let mut stream = socks5_connect(proxy, echo);
    stream.write_all(b"ping through the tunnel").expect("write");

    let mut buf = [0u8; 23];
    stream.read_exact(&mut buf).expect("read echo");
    assert_eq!(&buf, b"ping through the tunnel");
}

#[test]
fn test_tcp_large_transfer() {
    let echo = start_echo();
    let (proxy, _) = start_pair("chacha20");

    // big enough to fragment into many chunks on both hops
    let mut payload = Vec::with_capacity(512 * 1024);
    for i in 0..512 * 1024usize {
        payload.push((i * 7 + i / 311) as u8);
    }
    let expected = payload.clone();

    let stream = socks5_connect(proxy, echo);
    let mut reader = stream.try_clone().expect("clone stream");
    let writer = thread::spawn(move || {
        let mut stream = stream;
        stream.write_all(&payload).expect("write payload");
    });

    let mut received = vec![0u8; expected.len()];
    reader.read_exact(&mut received).expect("read echo");
    writer.join().expect("writer");
    assert_eq!(received, expected);
}

#[test]
fn test_domain_name_target() {
    let echo = start_echo();
    let (proxy, _) = start_pair("table");

    let mut stream = TcpStream::connect(proxy).expect("connect proxy");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    stream.write_all(&[0x05, 0x01, 0x00]).expect("write methods");
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).expect("read choice");
    assert_eq!(choice, [0x05, 0x00]);

    // the name travels to the server end, which resolves it there
    let name = b"localhost";
    let mut request = vec![0x05, 0x01, 0x00, 0x03, name.len() as u8];
    request.extend_from_slice(name);
    request.extend_from_slice(&echo.port().to_be_bytes());
    stream.write_all(&request).expect("write request");

    let mut head = [0u8; 4];
    stream.read_exact(&mut head).expect("read reply");
    assert_eq!(head[1], 0x00);
    let mut rest = [0u8; 6];
    stream.read_exact(&mut rest).expect("read bound address");

    stream.write_all(b"hello by name").expect("write");
    let mut buf = [0u8; 13];
    stream.read_exact(&mut buf).expect("read echo");
    assert_eq!(&buf, b"hello by name");
}

#[test]
fn test_user_pass_auth_accepted() {
    let echo = start_echo();
    let (proxy, _) = start_pair("aes-192-ctr");

    let mut stream = TcpStream::connect(proxy).expect("connect proxy");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");

    stream.write_all(&[0x05, 0x01, 0x02]).expect("write methods");
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).expect("read choice");
    assert_eq!(choice, [0x05, 0x02]);

    // whatever pair the client offers is let through
    stream
        .write_all(&[0x01, 3, b'b', b'o', b'b', 2, b'p', b'w'])
        .expect("write auth");
    let mut status = [0u8; 2];
    stream.read_exact(&mut status).expect("read auth status");
    assert_eq!(status, [0x01, 0x00]);

    socks5_request(&mut stream, echo);
    stream.write_all(b"after auth").expect("write");
    let mut buf = [0u8; 10];
    stream.read_exact(&mut buf).expect("read echo");
    assert_eq!(&buf, b"after auth");
}

#[test]
fn test_bad_address_type_gets_silence() {
    let (proxy, _) = start_pair("rc4-md5");

    let mut stream = TcpStream::connect(proxy).expect("connect proxy");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    stream.write_all(&[0x05, 0x01, 0x00]).expect("write methods");
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).expect("read choice");
    assert_eq!(choice, [0x05, 0x00]);

    // address type 0x09 does not exist, the connection just goes away
    stream
        .write_all(&[0x05, 0x01, 0x00, 0x09, 1, 2, 3, 4, 0, 80])
        .expect("write request");

    let mut buf = [0u8; 16];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("got {} reply bytes, wanted a silent close", n),
        Err(e) => panic!("read failed, {}", e),
    }
}

#[test]
fn test_refused_upstream_closes_clean() {
    // nothing listens on this port's tcp side, connects get refused
    let hold = UdpSocket::bind("127.0.0.1:0").expect("bind port holder");
    let dead = hold.local_addr().expect("dead addr");
    let proxy = start_local_only("aes-256-ctr", dead);

    let mut stream = TcpStream::connect(proxy).expect("connect proxy");
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("read timeout");
    stream
        .set_write_timeout(Some(Duration::from_secs(10)))
        .expect("write timeout");
    stream.write_all(&[0x05, 0x01, 0x00]).expect("write methods");
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).expect("read choice");
    assert_eq!(choice, [0x05, 0x00]);

    // half a megabyte pipelined right behind the request, so plenty of
    // unread input sits in the socket when the upstream connect fails
    let mut request = vec![0x05, 0x01, 0x00, 0x01];
    push_target_v4(&mut request, dead);
    request.resize(request.len() + 512 * 1024, 0x5a);
    stream.write_all(&request).expect("write request and payload");

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).expect("read reply");
    assert_eq!(reply[0], 0x05);
    assert_eq!(reply[1], 0x00);

    // after the reply the proxy must close in order, never with a reset
    let mut buf = [0u8; 4096];
    loop {
        match stream.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => panic!("{} stray bytes after the reply", n),
            Err(err) => panic!("reset instead of an orderly close: {}", err),
        }
    }
}

#[test]
fn test_server_says_nothing_to_garbage() {
    let (_, server) = start_pair("aes-128-ctr");

    let mut stream = TcpStream::connect(server).expect("connect server");
    stream
        .set_read_timeout(Some(Duration::from_millis(1500)))
        .expect("timeout");

    let junk: Vec<u8> = (0u16..64).map(|i| (i * 37 + 11) as u8).collect();
    stream.write_all(&junk).expect("write junk");

    // an outside scan learns nothing: either the peer drops us or it stays mute
    let mut buf = [0u8; 64];
    match stream.read(&mut buf) {
        Ok(0) => {}
        Ok(n) => panic!("server answered garbage with {} bytes", n),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
        Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
        Err(e) => panic!("read failed, {}", e),
    }
}

#[test]
fn test_udp_associate_round_trip() {
    let target = start_udp_echo();
    let (proxy, _) = start_pair("chacha20-ietf");

    // associate over tcp to learn the relay port
    let mut stream = TcpStream::connect(proxy).expect("connect proxy");
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");
    stream.write_all(&[0x05, 0x01, 0x00]).expect("write methods");
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).expect("read choice");
    assert_eq!(choice, [0x05, 0x00]);

    stream
        .write_all(&[0x05, 0x03, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .expect("write associate");
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).expect("read reply");
    assert_eq!(&head[..2], &[0x05, 0x00]);
    assert_eq!(head[3], 0x01);
    let mut bound = [0u8; 6];
    stream.read_exact(&mut bound).expect("read bound address");
    let relay_port = u16::from_be_bytes([bound[4], bound[5]]);

    let socket = UdpSocket::bind("127.0.0.1:0").expect("bind client socket");
    socket
        .set_read_timeout(Some(Duration::from_secs(5)))
        .expect("timeout");

    let mut datagram = vec![0x00, 0x00, 0x00, 0x01];
    push_target_v4(&mut datagram, target);
    datagram.extend_from_slice(b"udp ping");
    socket
        .send_to(&datagram, (proxy.ip(), relay_port))
        .expect("send datagram");

    let mut buf = [0u8; 2048];
    let (n, _) = socket.recv_from(&mut buf).expect("recv reply");
    assert_eq!(&buf[..3], &[0x00, 0x00, 0x00]);
    assert_eq!(&buf[n - 8..n], b"udp ping");
    // the reply carries the sender it came from
    assert_eq!(buf[3], 0x01);
}
