//! TCP half of the tunnel.
//!
//! The same relay runs on both hops: on the local side it speaks socks5
//! to applications and writes the encrypted stream toward the server; on
//! the server side it peels the address header off the decrypted stream
//! and pipes payload to the target. Either personality is a state
//! machine owning two sockets, driven entirely by readiness events.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{IpAddr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use crate::config::{LocalConfig, ServerConfig};
use crate::crypto::{CipherSuite, Encryptor};
use crate::dns::{DnsCallback, Resolver};
use crate::eventloop::{
    EventHandler, EventLoop, POLL_ERR, POLL_HUP, POLL_IN, POLL_NULL, POLL_OUT,
};
use crate::net;
use crate::socks5::{self, Address, Reply};
use crate::BUF_SIZE;

/// Live connections, shared between the relay and every connection so a
/// dying connection can drop its own entry right away.
type ConnTable = Rc<RefCell<HashMap<RawFd, Rc<RefCell<TcpConnection>>>>>;

pub struct TcpRelay {
    listener: TcpListener,
    listen_addr: SocketAddr,
    is_local: bool,
    server_addr: Option<SocketAddr>,
    fast_open: bool,
    resolver: Option<Rc<Resolver>>,
    suite: CipherSuite,
    timeout: Duration,
    conns: ConnTable,
}

impl TcpRelay {
    pub fn new_local(
        listener: TcpListener,
        config: &LocalConfig,
        suite: CipherSuite,
    ) -> io::Result<TcpRelay> {
        let listen_addr = listener.local_addr()?;
        Ok(TcpRelay {
            listener,
            listen_addr,
            is_local: true,
            server_addr: Some(config.server),
            fast_open: config.fast_open,
            resolver: None,
            suite,
            timeout: config.timeout,
            conns: Rc::new(RefCell::new(HashMap::new())),
        })
    }

    pub fn new_server(
        listener: TcpListener,
        config: &ServerConfig,
        suite: CipherSuite,
        resolver: Rc<Resolver>,
    ) -> io::Result<TcpRelay> {
        let listen_addr = listener.local_addr()?;
        Ok(TcpRelay {
            listener,
            listen_addr,
            is_local: false,
            server_addr: None,
            fast_open: false,
            resolver: Some(resolver),
            suite,
            timeout: config.timeout,
            conns: Rc::new(RefCell::new(HashMap::new())),
        })
    }

    pub fn register(relay: &Rc<RefCell<TcpRelay>>, lp: &mut EventLoop) -> io::Result<()> {
        let fd = relay.borrow().listener.as_raw_fd();
        lp.add(fd, POLL_IN | POLL_ERR, relay.clone())?;
        lp.add_periodic(relay.clone());
        Ok(())
    }

    fn accept_one(&mut self, lp: &mut EventLoop) -> bool {
        let (stream, peer) = match self.listener.accept() {
            Ok(pair) => pair,
            Err(ref err) if err.kind() == io::ErrorKind::WouldBlock => return false,
            Err(ref err) if err.kind() == io::ErrorKind::Interrupted => return true,
            Err(err) => {
                error!("accept on {} failed: {}", self.listen_addr, err);
                return false;
            }
        };

        if let Err(err) = self.new_connection(lp, stream, peer) {
            debug!("{} setup failed: {}", peer, err);
        }
        true
    }

    fn new_connection(
        &mut self,
        lp: &mut EventLoop,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> io::Result<()> {
        stream.set_nonblocking(true)?;
        let _ = stream.set_nodelay(true);
        let fd = stream.as_raw_fd();
        let encryptor = self.suite.encryptor()?;

        let stage = if self.is_local {
            Stage::HandshakeMethod
        } else {
            Stage::ReadHeader
        };

        let conn = Rc::new(RefCell::new(TcpConnection {
            is_local: self.is_local,
            stage,
            peer,
            listen_addr: self.listen_addr,
            server_addr: self.server_addr,
            fast_open: self.fast_open,
            resolver: self.resolver.clone(),
            encryptor,
            local: Some(stream),
            local_fd: fd,
            remote: None,
            remote_fd: -1,
            handshake: Vec::new(),
            local_pending: Vec::new(),
            remote_pending: Vec::new(),
            local_interest: POLL_IN | POLL_ERR,
            remote_interest: POLL_NULL,
            target: None,
            up: 0,
            down: 0,
            last_active: Instant::now(),
            draining: false,
            discarding: false,
            destroyed: false,
            self_weak: Weak::new(),
            conns: Rc::clone(&self.conns),
        }));
        conn.borrow_mut().self_weak = Rc::downgrade(&conn);

        lp.add(fd, POLL_IN | POLL_ERR, conn.clone())?;
        self.conns.borrow_mut().insert(fd, conn);
        debug!("accepted {}", peer);
        Ok(())
    }

    fn sweep_idle(&mut self, lp: &mut EventLoop) {
        let now = Instant::now();
        // destroy unlinks each entry, so pick the victims before touching them
        let stale: Vec<Rc<RefCell<TcpConnection>>> = {
            let conns = self.conns.borrow();
            conns
                .values()
                .filter(|conn| {
                    let conn = conn.borrow();
                    !conn.destroyed && now.duration_since(conn.last_active) >= self.timeout
                })
                .cloned()
                .collect()
        };
        for conn in stale {
            let mut conn = conn.borrow_mut();
            debug!("{} timed out", conn.peer);
            conn.destroy(lp);
        }
    }
}

impl EventHandler for TcpRelay {
    fn handle_event(&mut self, lp: &mut EventLoop, fd: RawFd, events: u32) {
        if events & POLL_ERR != 0 {
            error!("listener error on {}", self.listen_addr);
            let _ = lp.remove(fd);
            return;
        }
        while self.accept_one(lp) {}
    }

    fn handle_periodic(&mut self, lp: &mut EventLoop) {
        self.sweep_idle(lp);
    }
}

enum Stage {
    /// Local: waiting for the socks5 method selection.
    HandshakeMethod,
    /// Local: username/password subnegotiation, accepted whatever it is.
    HandshakeAuth,
    /// Local: waiting for the CONNECT or UDP ASSOCIATE request.
    HandshakeRequest,
    /// Local: request answered, parked until the client drops the
    /// association.
    UdpAssociate,
    /// Server: decrypting the leading target address.
    ReadHeader,
    /// Server: parked on the resolver.
    Dns,
    /// Nonblocking connect in flight, completion arrives as writability.
    Connecting,
    Streaming,
    Destroyed,
}

struct TcpConnection {
    is_local: bool,
    stage: Stage,
    peer: SocketAddr,
    listen_addr: SocketAddr,
    server_addr: Option<SocketAddr>,
    fast_open: bool,
    resolver: Option<Rc<Resolver>>,
    encryptor: Encryptor,

    /// Accepted side: the socks5 application, or on the server the
    /// encrypted client.
    local: Option<TcpStream>,
    local_fd: RawFd,
    /// Outbound side: the server, or on the server the target host.
    remote: Option<TcpStream>,
    remote_fd: RawFd,

    handshake: Vec<u8>,
    local_pending: Vec<u8>,
    remote_pending: Vec<u8>,
    local_interest: u32,
    remote_interest: u32,

    target: Option<Address>,
    up: u64,
    down: u64,
    last_active: Instant,
    draining: bool,
    /// The outbound side failed; client bytes are read and dropped until
    /// the client closes, so the socket never dies with unread input.
    discarding: bool,
    destroyed: bool,
    self_weak: Weak<RefCell<TcpConnection>>,
    conns: ConnTable,
}

impl TcpConnection {
    fn on_local_read(&mut self, lp: &mut EventLoop) {
        let mut buf = [0u8; BUF_SIZE];
        let stream = match self.local.as_ref() {
            Some(stream) => stream,
            None => return,
        };
        let n = match read_chunk(stream, &mut buf) {
            Ok(None) => return,
            Ok(Some(0)) => {
                self.on_eof(lp);
                return;
            }
            Ok(Some(n)) => n,
            Err(err) => {
                debug!("{} read failed: {}", self.peer, err);
                self.destroy(lp);
                return;
            }
        };

        if self.discarding {
            return;
        }

        let data = &buf[..n];
        match self.stage {
            Stage::HandshakeMethod => self.on_method_select(lp, data),
            Stage::HandshakeAuth => self.on_auth(lp, data),
            Stage::HandshakeRequest => self.on_request(lp, data),
            Stage::ReadHeader => self.on_header(lp, data),
            // only watched to notice the close, payload goes over UDP
            Stage::UdpAssociate => {}
            Stage::Dns | Stage::Connecting | Stage::Streaming => self.on_upstream(lp, data),
            Stage::Destroyed => {}
        }
    }

    fn on_remote_read(&mut self, lp: &mut EventLoop) {
        let mut buf = [0u8; BUF_SIZE];
        let stream = match self.remote.as_ref() {
            Some(stream) => stream,
            None => return,
        };
        let n = match read_chunk(stream, &mut buf) {
            Ok(None) => return,
            Ok(Some(0)) => {
                self.on_eof(lp);
                return;
            }
            Ok(Some(n)) => n,
            Err(err) => {
                debug!("{} read failed: {}", self.peer, err);
                self.destroy(lp);
                return;
            }
        };

        self.on_downstream(lp, &buf[..n]);
    }

    // +----+----------+----------+
    // |VER | NMETHODS | METHODS  |
    // +----+----------+----------+
    // | 1  |    1     | 1 to 255 |
    // +----+----------+----------+
    fn on_method_select(&mut self, lp: &mut EventLoop, data: &[u8]) {
        self.handshake.extend_from_slice(data);
        if self.handshake.len() < 2 {
            return;
        }
        if self.handshake[0] != socks5::VERSION {
            debug!("{} is not a socks5 client", self.peer);
            self.destroy(lp);
            return;
        }

        let count = self.handshake[1] as usize;
        if self.handshake.len() < 2 + count {
            return;
        }

        let methods = &self.handshake[2..2 + count];
        let choice = if methods.contains(&socks5::AUTH_METHOD_NONE) {
            socks5::AUTH_METHOD_NONE
        } else if methods.contains(&socks5::AUTH_METHOD_USER_PASS) {
            socks5::AUTH_METHOD_USER_PASS
        } else {
            socks5::AUTH_METHOD_NO_ACCEPTABLE
        };

        self.handshake.drain(..2 + count);
        self.local_pending.extend_from_slice(&[socks5::VERSION, choice]);

        match choice {
            socks5::AUTH_METHOD_NONE => self.stage = Stage::HandshakeRequest,
            socks5::AUTH_METHOD_USER_PASS => self.stage = Stage::HandshakeAuth,
            _ => {
                debug!("{} offered no acceptable auth method", self.peer);
                // flush the refusal, then close
                self.draining = true;
                return;
            }
        }

        if !self.handshake.is_empty() {
            self.advance_handshake(lp);
        }
    }

    // +----+------+----------+------+----------+
    // |VER | ULEN |  UNAME   | PLEN |  PASSWD  |
    // +----+------+----------+------+----------+
    // | 1  |  1   | 1 to 255 |  1   | 1 to 255 |
    // +----+------+----------+------+----------+
    fn on_auth(&mut self, lp: &mut EventLoop, data: &[u8]) {
        self.handshake.extend_from_slice(data);
        let buf = &self.handshake;
        if buf.is_empty() {
            return;
        }
        if buf[0] != socks5::AUTH_USER_PASS_VERSION {
            debug!("{} sent auth version {:#04x}", self.peer, buf[0]);
            self.destroy(lp);
            return;
        }
        if buf.len() < 2 {
            return;
        }
        let ulen = buf[1] as usize;
        if buf.len() < 2 + ulen + 1 {
            return;
        }
        let plen = buf[2 + ulen] as usize;
        let total = 2 + ulen + 1 + plen;
        if buf.len() < total {
            return;
        }

        // any credentials are accepted
        self.handshake.drain(..total);
        self.local_pending
            .extend_from_slice(&[socks5::AUTH_USER_PASS_VERSION, socks5::AUTH_SUCCEEDED]);
        self.stage = Stage::HandshakeRequest;

        if !self.handshake.is_empty() {
            self.advance_handshake(lp);
        }
    }

    // +----+-----+-------+------+----------+----------+
    // |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
    // +----+-----+-------+------+----------+----------+
    // | 1  |  1  | X'00' |  1   | Variable |    2     |
    // +----+-----+-------+------+----------+----------+
    fn on_request(&mut self, lp: &mut EventLoop, data: &[u8]) {
        self.handshake.extend_from_slice(data);
        if self.handshake.is_empty() {
            return;
        }
        if self.handshake[0] != socks5::VERSION {
            debug!("{} sent version {:#04x}", self.peer, self.handshake[0]);
            self.destroy(lp);
            return;
        }
        if self.handshake.len() < 4 {
            return;
        }

        let cmd = self.handshake[1];
        if cmd != socks5::CMD_TCP_CONNECT && cmd != socks5::CMD_UDP_ASSOCIATE {
            debug!("{} sent unsupported command {:#04x}", self.peer, cmd);
            self.destroy(lp);
            return;
        }

        let atyp = self.handshake[3];
        if !known_addr_type(atyp) {
            debug!("{} sent address type {:#04x}, dropped", self.peer, atyp);
            self.destroy(lp);
            return;
        }

        let parsed = Address::parse(&self.handshake[3..]);
        let (target, consumed) = match parsed {
            Some(pair) => pair,
            None => {
                if let Some(frame) = frame_len(&self.handshake[3..]) {
                    if self.handshake.len() >= 3 + frame {
                        // complete yet unparseable, drop without a reply
                        self.destroy(lp);
                    }
                }
                return;
            }
        };
        let total = 3 + consumed;

        if cmd == socks5::CMD_UDP_ASSOCIATE {
            // the udp relay listens on the same port as this listener
            Reply::new(self.listen_addr).get(socks5::REPLY_SUCCEEDED, &mut self.local_pending);
            self.handshake.clear();
            self.stage = Stage::UdpAssociate;
            debug!("{} udp associate", self.peer);
            return;
        }

        info!("{} request {}", self.peer, target);
        Reply::new(self.listen_addr).get(socks5::REPLY_SUCCEEDED, &mut self.local_pending);

        // address header plus whatever payload rode in with the request
        let mut plain = Vec::with_capacity(socks5::MAX_ADDR_LEN + self.handshake.len() - total);
        target.write_to(&mut plain);
        plain.extend_from_slice(&self.handshake[total..]);
        self.handshake.clear();

        let wire = match self.encryptor.encrypt(&plain) {
            Ok(wire) => wire,
            Err(err) => {
                debug!("{}: {}", self.peer, err);
                self.destroy(lp);
                return;
            }
        };
        self.remote_pending = wire;
        self.target = Some(target);

        let server = match self.server_addr {
            Some(addr) => addr,
            None => {
                self.destroy(lp);
                return;
            }
        };
        self.start_connect(lp, server);
    }

    // [ATYP | DST.ADDR | DST.PORT] in front of the decrypted stream
    fn on_header(&mut self, lp: &mut EventLoop, data: &[u8]) {
        let plain = match self.encryptor.decrypt(data) {
            Ok(plain) => plain,
            // short iv; dropped without a byte in response
            Err(err) => {
                debug!("{}: {}", self.peer, err);
                self.destroy(lp);
                return;
            }
        };
        self.handshake.extend_from_slice(&plain);
        if self.handshake.is_empty() {
            return;
        }

        let atyp = self.handshake[0];
        if !known_addr_type(atyp) {
            debug!("{} sent address type {:#04x}, dropped", self.peer, atyp);
            self.destroy(lp);
            return;
        }

        let parsed = Address::parse(&self.handshake);
        let (target, consumed) = match parsed {
            Some(pair) => pair,
            None => {
                if let Some(frame) = frame_len(&self.handshake) {
                    if self.handshake.len() >= frame {
                        self.destroy(lp);
                    }
                }
                return;
            }
        };

        info!("{} request {}", self.peer, target);
        let early = self.handshake[consumed..].to_vec();
        self.handshake.clear();
        self.remote_pending = early;
        self.target = Some(target.clone());

        match target {
            Address::Ip(addr) => self.start_connect(lp, addr),
            Address::Domain(domain, _) => {
                let resolver = match self.resolver.clone() {
                    Some(resolver) => resolver,
                    None => {
                        self.destroy(lp);
                        return;
                    }
                };
                self.stage = Stage::Dns;
                let waiter: Weak<RefCell<dyn DnsCallback>> = self.self_weak.clone();
                if let Err(err) = resolver.resolve(&domain, waiter) {
                    debug!("{} resolve {} failed: {}", self.peer, domain, err);
                    self.destroy(lp);
                }
            }
        }
    }

    /// Payload moving from the accepted side toward the outbound side.
    /// Before the outbound socket exists it just piles onto the pending
    /// buffer; interest bookkeeping keeps that bounded.
    fn on_upstream(&mut self, lp: &mut EventLoop, data: &[u8]) {
        self.up += data.len() as u64;
        let out = if self.is_local {
            self.encryptor.encrypt(data)
        } else {
            self.encryptor.decrypt(data)
        };
        let out = match out {
            Ok(out) => out,
            Err(err) => {
                debug!("{}: {}", self.peer, err);
                self.destroy(lp);
                return;
            }
        };
        self.forward_to_remote(lp, out);
    }

    fn on_downstream(&mut self, lp: &mut EventLoop, data: &[u8]) {
        self.down += data.len() as u64;
        let out = if self.is_local {
            self.encryptor.decrypt(data)
        } else {
            self.encryptor.encrypt(data)
        };
        let out = match out {
            Ok(out) => out,
            Err(err) => {
                debug!("{}: {}", self.peer, err);
                self.destroy(lp);
                return;
            }
        };
        self.forward_to_local(lp, out);
    }

    fn forward_to_remote(&mut self, lp: &mut EventLoop, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        if !matches!(self.stage, Stage::Streaming) || !self.remote_pending.is_empty() {
            self.remote_pending.extend_from_slice(&data);
            return;
        }

        let written = match self.remote.as_ref() {
            Some(stream) => write_chunk(stream, &data),
            None => {
                self.remote_pending = data;
                return;
            }
        };
        match written {
            Ok(n) if n < data.len() => self.remote_pending.extend_from_slice(&data[n..]),
            Ok(_) => {}
            Err(err) => {
                debug!("{} write failed: {}", self.peer, err);
                self.destroy(lp);
            }
        }
    }

    fn forward_to_local(&mut self, lp: &mut EventLoop, data: Vec<u8>) {
        if data.is_empty() {
            return;
        }
        if !self.local_pending.is_empty() {
            self.local_pending.extend_from_slice(&data);
            return;
        }

        let written = match self.local.as_ref() {
            Some(stream) => write_chunk(stream, &data),
            None => return,
        };
        match written {
            Ok(n) if n < data.len() => self.local_pending.extend_from_slice(&data[n..]),
            Ok(_) => {}
            Err(err) => {
                debug!("{} write failed: {}", self.peer, err);
                self.destroy(lp);
            }
        }
    }

    fn flush_local(&mut self, lp: &mut EventLoop) {
        if !self.local_pending.is_empty() {
            let written = match self.local.as_ref() {
                Some(stream) => write_chunk(stream, &self.local_pending),
                None => return,
            };
            match written {
                Ok(n) => {
                    self.local_pending.drain(..n);
                }
                Err(err) => {
                    debug!("{} write failed: {}", self.peer, err);
                    self.destroy(lp);
                    return;
                }
            }
        }
        self.maybe_half_close();
        self.maybe_finish_drain(lp);
    }

    fn flush_remote(&mut self, lp: &mut EventLoop) {
        if !self.remote_pending.is_empty() {
            let written = match self.remote.as_ref() {
                Some(stream) => write_chunk(stream, &self.remote_pending),
                None => return,
            };
            match written {
                Ok(n) => {
                    self.remote_pending.drain(..n);
                }
                Err(err) => {
                    debug!("{} write failed: {}", self.peer, err);
                    self.destroy(lp);
                    return;
                }
            }
        }
        self.maybe_finish_drain(lp);
    }

    fn start_connect(&mut self, lp: &mut EventLoop, addr: SocketAddr) {
        let connected = if self.is_local && self.fast_open && !self.remote_pending.is_empty() {
            net::tcp_connect_fast_open(&addr, &self.remote_pending).map(|(stream, sent)| {
                self.remote_pending.drain(..sent);
                stream
            })
        } else {
            net::tcp_connect(&addr)
        };

        let stream = match connected {
            Ok(stream) => stream,
            Err(err) => {
                debug!("{} connect {} failed: {}", self.peer, addr, err);
                self.abort_connect(lp);
                return;
            }
        };
        let _ = stream.set_nodelay(true);

        self.remote_fd = stream.as_raw_fd();
        self.remote = Some(stream);
        self.stage = Stage::Connecting;
        self.remote_interest = POLL_OUT | POLL_ERR;

        let handler = match self.self_weak.upgrade() {
            Some(handler) => handler,
            None => {
                self.destroy(lp);
                return;
            }
        };
        if let Err(err) = lp.add(self.remote_fd, self.remote_interest, handler) {
            error!("watch outbound socket: {}", err);
            self.destroy(lp);
        }
    }

    fn finish_connect(&mut self, lp: &mut EventLoop) {
        if let Err(err) = net::take_socket_error(self.remote_fd) {
            if let Some(ref target) = self.target {
                debug!("{} connect {} failed: {}", self.peer, target, err);
            }
            self.abort_connect(lp);
            return;
        }

        self.stage = Stage::Streaming;
        if let Some(ref target) = self.target {
            debug!("{} connected to {}", self.peer, target);
        }
        self.flush_remote(lp);
    }

    fn advance_handshake(&mut self, lp: &mut EventLoop) {
        // a client may pipeline the next frame into the same segment
        match self.stage {
            Stage::HandshakeAuth => self.on_auth(lp, &[]),
            Stage::HandshakeRequest => self.on_request(lp, &[]),
            _ => {}
        }
    }

    /// One side finished sending. Whatever is buffered still goes out,
    /// then both sockets close.
    fn on_eof(&mut self, lp: &mut EventLoop) {
        self.draining = true;
        self.maybe_finish_drain(lp);
    }

    fn maybe_finish_drain(&mut self, lp: &mut EventLoop) {
        if self.draining && self.local_pending.is_empty() && self.remote_pending.is_empty() {
            self.destroy(lp);
        }
    }

    /// The upstream connect failed. The outbound side is gone for good;
    /// anything already queued toward the client still goes out, followed
    /// by a half close, and the read side keeps draining the client until
    /// its own close arrives. Closing with unread input would reset the
    /// socket and could wipe the queued reply off the client's end.
    fn abort_connect(&mut self, lp: &mut EventLoop) {
        if self.remote.is_some() {
            let _ = lp.remove(self.remote_fd);
            self.remote = None;
            self.remote_fd = -1;
            self.remote_interest = POLL_NULL;
        }
        self.remote_pending.clear();
        self.stage = Stage::Streaming;
        self.discarding = true;
        self.maybe_half_close();
        self.maybe_finish_drain(lp);
    }

    /// Sends the FIN as soon as nothing is left to write toward the
    /// client; only meaningful while input is being discarded.
    fn maybe_half_close(&mut self) {
        if self.discarding && self.local_pending.is_empty() {
            if let Some(ref stream) = self.local {
                let _ = stream.shutdown(Shutdown::Write);
            }
        }
    }

    /// Reading from a side pauses while the opposite write buffer has
    /// unsent bytes; writability is only watched while something is
    /// buffered.
    fn refresh_interests(&mut self, lp: &mut EventLoop) {
        if self.destroyed {
            return;
        }

        let mut li = POLL_ERR;
        if !self.draining && self.remote_pending.is_empty() {
            li |= POLL_IN;
        }
        if !self.local_pending.is_empty() {
            li |= POLL_OUT;
        }
        if li != self.local_interest {
            if lp.modify(self.local_fd, li).is_err() {
                self.destroy(lp);
                return;
            }
            self.local_interest = li;
        }

        if self.remote.is_some() {
            let mut ri = POLL_ERR;
            match self.stage {
                Stage::Connecting => ri |= POLL_OUT,
                Stage::Streaming => {
                    if !self.draining && self.local_pending.is_empty() {
                        ri |= POLL_IN;
                    }
                    if !self.remote_pending.is_empty() {
                        ri |= POLL_OUT;
                    }
                }
                _ => {}
            }
            if ri != self.remote_interest {
                if lp.modify(self.remote_fd, ri).is_err() {
                    self.destroy(lp);
                    return;
                }
                self.remote_interest = ri;
            }
        }
    }

    fn destroy(&mut self, lp: &mut EventLoop) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        self.stage = Stage::Destroyed;

        // unregister before the sockets close, fd numbers get reused
        if self.remote.is_some() {
            let _ = lp.remove(self.remote_fd);
        }
        let _ = lp.remove(self.local_fd);
        self.remote = None;
        self.local = None;
        self.conns.borrow_mut().remove(&self.local_fd);

        debug!("{} closed, up {} down {}", self.peer, self.up, self.down);
    }
}

impl EventHandler for TcpConnection {
    fn handle_event(&mut self, lp: &mut EventLoop, fd: RawFd, events: u32) {
        if self.destroyed {
            return;
        }
        self.last_active = Instant::now();

        if events & POLL_ERR != 0 {
            // epoll reports a refused connect as an error event on the
            // outbound fd, not as plain writability
            if fd == self.remote_fd && matches!(self.stage, Stage::Connecting) {
                self.finish_connect(lp);
                if !self.destroyed {
                    self.refresh_interests(lp);
                }
                return;
            }
            if let Err(err) = net::take_socket_error(fd) {
                debug!("{} socket error: {}", self.peer, err);
            }
            self.destroy(lp);
            return;
        }
        // hup with pending input surfaces through read returning zero
        if events & POLL_HUP != 0 && events & POLL_IN == 0 {
            self.destroy(lp);
            return;
        }

        if fd == self.local_fd {
            if events & POLL_IN != 0 {
                self.on_local_read(lp);
            }
            if self.destroyed {
                return;
            }
            if events & POLL_OUT != 0 {
                self.flush_local(lp);
            }
        } else if fd == self.remote_fd {
            if events & POLL_IN != 0 {
                self.on_remote_read(lp);
            }
            if self.destroyed {
                return;
            }
            if events & POLL_OUT != 0 {
                if matches!(self.stage, Stage::Connecting) {
                    self.finish_connect(lp);
                } else {
                    self.flush_remote(lp);
                }
            }
        }

        if !self.destroyed {
            self.refresh_interests(lp);
        }
    }
}

impl DnsCallback for TcpConnection {
    fn handle_dns_resolved(
        &mut self,
        lp: &mut EventLoop,
        hostname: &str,
        result: io::Result<IpAddr>,
    ) {
        if self.destroyed || !matches!(self.stage, Stage::Dns) {
            return;
        }

        match result {
            Ok(ip) => {
                let port = self.target.as_ref().map(|t| t.port()).unwrap_or(0);
                self.start_connect(lp, SocketAddr::new(ip, port));
            }
            Err(err) => {
                debug!("{} resolve {} failed: {}", self.peer, hostname, err);
                self.abort_connect(lp);
            }
        }

        if !self.destroyed {
            self.refresh_interests(lp);
        }
    }
}

fn known_addr_type(atyp: u8) -> bool {
    atyp == socks5::ADDR_TYPE_IPV4
        || atyp == socks5::ADDR_TYPE_DOMAIN_NAME
        || atyp == socks5::ADDR_TYPE_IPV6
}

/// Full frame length of an address header once enough bytes exist to
/// know it, `None` while even that is undecidable.
fn frame_len(buf: &[u8]) -> Option<usize> {
    match *buf.first()? {
        socks5::ADDR_TYPE_IPV4 => Some(1 + 4 + 2),
        socks5::ADDR_TYPE_IPV6 => Some(1 + 16 + 2),
        socks5::ADDR_TYPE_DOMAIN_NAME => buf.get(1).map(|&len| 2 + len as usize + 2),
        _ => None,
    }
}

fn read_chunk(mut stream: &TcpStream, buf: &mut [u8]) -> io::Result<Option<usize>> {
    match stream.read(buf) {
        Ok(n) => Ok(Some(n)),
        Err(ref err)
            if err.kind() == io::ErrorKind::WouldBlock
                || err.kind() == io::ErrorKind::Interrupted =>
        {
            Ok(None)
        }
        Err(err) => Err(err),
    }
}

fn write_chunk(mut stream: &TcpStream, buf: &[u8]) -> io::Result<usize> {
    match stream.write(buf) {
        Ok(n) => Ok(n),
        Err(ref err)
            if err.kind() == io::ErrorKind::WouldBlock
                || err.kind() == io::ErrorKind::Interrupted =>
        {
            Ok(0)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use crate::config::LocalConfig;
    use crate::crypto::{CipherSuite, KeyCache, Method};

    fn local_relay() -> (Rc<RefCell<TcpRelay>>, EventLoop, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();

        let config = LocalConfig {
            listen: addr,
            server: "127.0.0.1:1".parse().unwrap(),
            password: "hunter2".to_string(),
            method: Method::new("rc4-md5").unwrap(),
            timeout: Duration::from_secs(60),
            fast_open: false,
        };
        let mut keys = KeyCache::new();
        let suite = CipherSuite::new(config.method, &config.password, &mut keys);

        let mut lp = EventLoop::new().unwrap();
        let relay = Rc::new(RefCell::new(
            TcpRelay::new_local(listener, &config, suite).unwrap(),
        ));
        TcpRelay::register(&relay, &mut lp).unwrap();
        (relay, lp, addr)
    }

    fn conn_count(relay: &Rc<RefCell<TcpRelay>>) -> usize {
        relay.borrow().conns.borrow().len()
    }

    #[test]
    fn test_closed_conn_leaves_table_at_once() {
        let (relay, mut lp, addr) = local_relay();

        let client = TcpStream::connect(addr).unwrap();
        for _ in 0..50 {
            lp.run_once(Some(Duration::from_millis(20))).unwrap();
            if conn_count(&relay) == 1 {
                break;
            }
        }
        assert_eq!(conn_count(&relay), 1);

        // closing must unlink the entry as soon as the eof is seen,
        // not on the next idle sweep
        drop(client);
        for _ in 0..50 {
            lp.run_once(Some(Duration::from_millis(20))).unwrap();
            if conn_count(&relay) == 0 {
                break;
            }
        }
        assert_eq!(conn_count(&relay), 0);
    }
}
