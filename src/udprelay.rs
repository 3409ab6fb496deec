//! UDP half of the tunnel.
//!
//! Flows are NATed: each (client, destination) pair gets one outbound
//! socket, found again on the way back through a reverse fd map. The
//! association cache re-timestamps on every touch and expired flows are
//! torn down on the periodic sweep.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use crate::cache::SessionCache;
use crate::config::{LocalConfig, ServerConfig};
use crate::crypto::CipherSuite;
use crate::dns::{DnsCallback, Resolver};
use crate::eventloop::{EventHandler, EventLoop, POLL_ERR, POLL_IN};
use crate::net;
use crate::socks5::{self, Address};
use crate::UDP_BUF_SIZE;

/// Datagrams parked per hostname while the resolver works.
const MAX_PARKED: usize = 32;

/// (client, destination); on the local hop the destination is always
/// the tunnel server.
type FlowKey = (SocketAddr, SocketAddr);

struct Flow {
    socket: UdpSocket,
    fd: RawFd,
}

pub struct UdpRelay {
    socket: UdpSocket,
    socket_fd: RawFd,
    is_local: bool,
    server_addr: Option<SocketAddr>,
    resolver: Option<Rc<Resolver>>,
    suite: CipherSuite,
    nat: SessionCache<FlowKey, Flow>,
    reverse: HashMap<RawFd, FlowKey>,
    pending_dns: HashMap<String, Vec<(SocketAddr, u16, Vec<u8>)>>,
    self_weak: Weak<RefCell<UdpRelay>>,
}

impl UdpRelay {
    pub fn new_local(
        socket: UdpSocket,
        config: &LocalConfig,
        suite: CipherSuite,
    ) -> io::Result<UdpRelay> {
        socket.set_nonblocking(true)?;
        let socket_fd = socket.as_raw_fd();
        Ok(UdpRelay {
            socket,
            socket_fd,
            is_local: true,
            server_addr: Some(config.server),
            resolver: None,
            suite,
            nat: SessionCache::new(config.timeout),
            reverse: HashMap::new(),
            pending_dns: HashMap::new(),
            self_weak: Weak::new(),
        })
    }

    pub fn new_server(
        socket: UdpSocket,
        config: &ServerConfig,
        suite: CipherSuite,
        resolver: Rc<Resolver>,
    ) -> io::Result<UdpRelay> {
        socket.set_nonblocking(true)?;
        let socket_fd = socket.as_raw_fd();
        Ok(UdpRelay {
            socket,
            socket_fd,
            is_local: false,
            server_addr: None,
            resolver: Some(resolver),
            suite,
            nat: SessionCache::new(config.timeout),
            reverse: HashMap::new(),
            pending_dns: HashMap::new(),
            self_weak: Weak::new(),
        })
    }

    pub fn register(relay: &Rc<RefCell<UdpRelay>>, lp: &mut EventLoop) -> io::Result<()> {
        relay.borrow_mut().self_weak = Rc::downgrade(relay);
        let fd = relay.borrow().socket_fd;
        lp.add(fd, POLL_IN | POLL_ERR, relay.clone())?;
        lp.add_periodic(relay.clone());
        Ok(())
    }

    /// One datagram off the listening socket.
    fn on_listen_ready(&mut self, lp: &mut EventLoop) {
        let mut buf = [0u8; UDP_BUF_SIZE];
        let (n, client) = match self.socket.recv_from(&mut buf) {
            Ok(pair) => pair,
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                return;
            }
            Err(err) => {
                debug!("udp recv failed: {}", err);
                return;
            }
        };

        if self.is_local {
            self.client_datagram(lp, client, &buf[..n]);
        } else {
            self.wire_datagram(lp, client, &buf[..n]);
        }
    }

    // +----+------+------+----------+----------+----------+
    // |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
    // +----+------+------+----------+----------+----------+
    // | 2  |  1   |  1   | Variable |    2     | Variable |
    // +----+------+------+----------+----------+----------+
    fn client_datagram(&mut self, lp: &mut EventLoop, client: SocketAddr, data: &[u8]) {
        if data.len() <= socks5::UDP_HEAD_LEN {
            return;
        }
        if data[2] != 0 {
            debug!("{} sent fragmented udp, dropped", client);
            return;
        }

        let body = &data[socks5::UDP_HEAD_LEN..];
        // the header stays in front of the sealed body, only sanity
        // checked here
        if Address::parse(body).is_none() {
            return;
        }

        let wire = match self.suite.encrypt_all(body) {
            Ok(wire) => wire,
            Err(err) => {
                debug!("{}: {}", client, err);
                return;
            }
        };
        let server = match self.server_addr {
            Some(addr) => addr,
            None => return,
        };
        self.flow_send(lp, (client, server), &wire);
    }

    /// Sealed datagram from a local relay: [IV][ATYP ADDR PORT DATA].
    fn wire_datagram(&mut self, lp: &mut EventLoop, client: SocketAddr, data: &[u8]) {
        let plain = match self.suite.decrypt_all(data) {
            Ok(plain) => plain,
            // not even a whole iv, drop it
            Err(_) => return,
        };

        let (target, consumed) = match Address::parse(&plain) {
            Some(pair) => pair,
            None => return,
        };
        let payload = &plain[consumed..];

        match target {
            Address::Ip(dest) => self.flow_send(lp, (client, dest), payload),
            Address::Domain(domain, port) => {
                let resolver = match self.resolver.clone() {
                    Some(resolver) => resolver,
                    None => return,
                };

                let parked = self.pending_dns.entry(domain.clone()).or_default();
                if parked.len() >= MAX_PARKED {
                    debug!("udp dns backlog for {}, dropped", domain);
                    return;
                }
                let fresh = parked.is_empty();
                parked.push((client, port, payload.to_vec()));

                if fresh {
                    let waiter: Weak<RefCell<dyn DnsCallback>> = self.self_weak.clone();
                    if let Err(err) = resolver.resolve(&domain, waiter) {
                        debug!("udp resolve {} failed: {}", domain, err);
                        self.pending_dns.remove(&domain);
                    }
                }
            }
        }
    }

    /// Send over the flow's socket, creating and watching it first if
    /// this is a fresh (client, destination) pair.
    fn flow_send(&mut self, lp: &mut EventLoop, key: FlowKey, wire: &[u8]) {
        let dest = key.1;
        if let Some(flow) = self.nat.get(&key) {
            if let Err(err) = flow.socket.send_to(wire, dest) {
                debug!("udp send to {} failed: {}", dest, err);
            }
            return;
        }

        let socket = match net::udp_socket(&dest) {
            Ok(socket) => socket,
            Err(err) => {
                debug!("udp socket for {} failed: {}", dest, err);
                return;
            }
        };
        let fd = socket.as_raw_fd();
        let handler = match self.self_weak.upgrade() {
            Some(handler) => handler,
            None => return,
        };
        if let Err(err) = lp.add(fd, POLL_IN | POLL_ERR, handler) {
            debug!("watch udp socket: {}", err);
            return;
        }

        debug!("udp flow {} -> {}", key.0, dest);
        if let Err(err) = socket.send_to(wire, dest) {
            debug!("udp send to {} failed: {}", dest, err);
        }
        self.reverse.insert(fd, key);
        self.nat.set(key, Flow { socket, fd });
    }

    /// Reply on one of the outbound sockets, headed back to the client.
    fn on_outbound_ready(&mut self, lp: &mut EventLoop, fd: RawFd) {
        let key = match self.reverse.get(&fd) {
            Some(key) => *key,
            None => {
                // stale event for an evicted flow
                let _ = lp.remove(fd);
                return;
            }
        };
        let client = key.0;

        let mut buf = [0u8; UDP_BUF_SIZE];
        let received = match self.nat.get(&key) {
            Some(flow) => flow.socket.recv_from(&mut buf),
            None => return,
        };
        let (n, from) = match received {
            Ok(pair) => pair,
            Err(ref err)
                if err.kind() == io::ErrorKind::WouldBlock
                    || err.kind() == io::ErrorKind::Interrupted =>
            {
                return;
            }
            Err(err) => {
                debug!("udp recv failed: {}", err);
                return;
            }
        };

        if self.is_local {
            // sealed reply from the server; verify the header, then put
            // the socks5 framing back on
            let plain = match self.suite.decrypt_all(&buf[..n]) {
                Ok(plain) => plain,
                Err(_) => return,
            };
            if Address::parse(&plain).is_none() {
                return;
            }

            let mut out = Vec::with_capacity(socks5::UDP_HEAD_LEN + plain.len());
            out.extend_from_slice(&[0, 0, 0]);
            out.extend_from_slice(&plain);
            if let Err(err) = self.socket.send_to(&out, client) {
                debug!("udp send to {} failed: {}", client, err);
            }
        } else {
            // reply from the target; state who it came from, then seal
            let mut plain = Vec::with_capacity(socks5::MAX_ADDR_LEN + n);
            Address::Ip(from).write_to(&mut plain);
            plain.extend_from_slice(&buf[..n]);

            let wire = match self.suite.encrypt_all(&plain) {
                Ok(wire) => wire,
                Err(err) => {
                    debug!("{}: {}", client, err);
                    return;
                }
            };
            if let Err(err) = self.socket.send_to(&wire, client) {
                debug!("udp send to {} failed: {}", client, err);
            }
        }
    }

    fn drop_flow(&mut self, lp: &mut EventLoop, fd: RawFd) {
        let _ = net::take_socket_error(fd);
        if let Some(key) = self.reverse.remove(&fd) {
            let _ = lp.remove(fd);
            self.nat.remove(&key);
        }
    }
}

impl EventHandler for UdpRelay {
    fn handle_event(&mut self, lp: &mut EventLoop, fd: RawFd, events: u32) {
        if events & POLL_ERR != 0 {
            if fd == self.socket_fd {
                // clear it and carry on serving
                let _ = net::take_socket_error(fd);
                error!("udp listener error");
            } else {
                self.drop_flow(lp, fd);
            }
            return;
        }

        if fd == self.socket_fd {
            self.on_listen_ready(lp);
        } else {
            self.on_outbound_ready(lp, fd);
        }
    }

    fn handle_periodic(&mut self, lp: &mut EventLoop) {
        let UdpRelay {
            ref mut nat,
            ref mut reverse,
            ..
        } = *self;
        nat.sweep(|key, flow| {
            debug!("udp flow {} -> {} expired", key.0, key.1);
            reverse.remove(&flow.fd);
            // unregister first, the socket closes when the flow drops
            let _ = lp.remove(flow.fd);
        });
    }
}

impl DnsCallback for UdpRelay {
    fn handle_dns_resolved(
        &mut self,
        lp: &mut EventLoop,
        hostname: &str,
        result: io::Result<IpAddr>,
    ) {
        let parked = match self.pending_dns.remove(hostname) {
            Some(parked) => parked,
            None => return,
        };
        let ip = match result {
            Ok(ip) => ip,
            Err(err) => {
                debug!("udp resolve {} failed: {}", hostname, err);
                return;
            }
        };

        for (client, port, payload) in parked {
            self.flow_send(lp, (client, SocketAddr::new(ip, port)), &payload);
        }
    }
}
