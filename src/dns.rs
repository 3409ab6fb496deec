//! Hostname resolution off the event loop.
//!
//! `getaddrinfo` blocks, so lookups run on a dedicated thread. Answers
//! come back over a channel paired with a self-pipe byte that wakes the
//! loop, and callbacks always fire from loop context on a later round,
//! never from inside `resolve`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use crate::cache::SessionCache;
use crate::eventloop::{EventHandler, EventLoop, POLL_ERR, POLL_IN};
use crate::net;

const CACHE_TTL: Duration = Duration::from_secs(300);

type Answer = (u64, String, io::Result<IpAddr>);

/// Implemented by connections parked on a lookup. Delivered at most
/// once; waiters that died in the meantime are skipped.
pub trait DnsCallback {
    fn handle_dns_resolved(
        &mut self,
        lp: &mut EventLoop,
        hostname: &str,
        result: io::Result<IpAddr>,
    );
}

struct Inner {
    next_token: u64,
    waiters: HashMap<u64, Weak<RefCell<dyn DnsCallback>>>,
}

pub struct Resolver {
    requests: mpsc::Sender<(u64, String)>,
    answers: mpsc::Receiver<Answer>,
    wake: OwnedFd,
    inner: RefCell<Inner>,
}

impl Resolver {
    pub fn new() -> io::Result<Resolver> {
        let (wake_read, wake_write) = net::pipe()?;
        let (request_tx, request_rx) = mpsc::channel();
        let (answer_tx, answer_rx) = mpsc::channel();

        thread::Builder::new()
            .name("resolver".to_string())
            .spawn(move || worker(request_rx, answer_tx, wake_write))?;

        Ok(Resolver {
            requests: request_tx,
            answers: answer_rx,
            wake: wake_read,
            inner: RefCell::new(Inner {
                next_token: 0,
                waiters: HashMap::new(),
            }),
        })
    }

    /// Watch the wakeup pipe so answers get dispatched.
    pub fn register(resolver: &Rc<Resolver>, lp: &mut EventLoop) -> io::Result<()> {
        let handle = Rc::new(RefCell::new(ResolverHandle(resolver.clone())));
        lp.add(resolver.wake.as_raw_fd(), POLL_IN | POLL_ERR, handle)
    }

    /// Queue a lookup. The waiter is held weakly, so a connection torn
    /// down before the answer arrives is simply never called.
    pub fn resolve(
        &self,
        hostname: &str,
        waiter: Weak<RefCell<dyn DnsCallback>>,
    ) -> io::Result<()> {
        let token = {
            let mut inner = self.inner.borrow_mut();
            let token = inner.next_token;
            inner.next_token = inner.next_token.wrapping_add(1);
            inner.waiters.insert(token, waiter);
            token
        };

        self.requests
            .send((token, hostname.to_string()))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "resolver thread is gone"))
    }

    fn dispatch_ready(&self, lp: &mut EventLoop) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.wake.as_raw_fd(), buf.as_mut_ptr() as *mut _, 64) };
            if n <= 0 {
                break;
            }
        }

        while let Ok((token, hostname, result)) = self.answers.try_recv() {
            // drop the borrow before the callback, waiters may resolve
            // again from inside it
            let waiter = self.inner.borrow_mut().waiters.remove(&token);
            if let Some(waiter) = waiter.and_then(|w| w.upgrade()) {
                waiter.borrow_mut().handle_dns_resolved(lp, &hostname, result);
            }
        }
    }
}

struct ResolverHandle(Rc<Resolver>);

impl EventHandler for ResolverHandle {
    fn handle_event(&mut self, lp: &mut EventLoop, _fd: RawFd, _events: u32) {
        self.0.dispatch_ready(lp);
    }
}

fn worker(
    requests: mpsc::Receiver<(u64, String)>,
    answers: mpsc::Sender<Answer>,
    wake: OwnedFd,
) {
    let mut cache: SessionCache<String, IpAddr> = SessionCache::new(CACHE_TTL);

    while let Ok((token, hostname)) = requests.recv() {
        cache.sweep(|_, _| {});
        let cached = cache.get(&hostname).copied();
        let result = match cached {
            Some(ip) => Ok(ip),
            None => lookup(&hostname).map(|ip| {
                cache.set(hostname.clone(), ip);
                ip
            }),
        };

        if answers.send((token, hostname, result)).is_err() {
            break;
        }
        // a full pipe is fine, the loop is waking up anyway
        let _ = unsafe { libc::write(wake.as_raw_fd(), b"!".as_ptr() as *const _, 1) };
    }
}

fn lookup(hostname: &str) -> io::Result<IpAddr> {
    let addrs: Vec<SocketAddr> = (hostname, 0u16).to_socket_addrs()?.collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .map(|addr| addr.ip())
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::Other,
                format!("no address records for {}", hostname),
            )
        })
}

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct Sink {
        got: Option<(String, io::Result<IpAddr>)>,
    }

    impl DnsCallback for Sink {
        fn handle_dns_resolved(
            &mut self,
            _lp: &mut EventLoop,
            hostname: &str,
            result: io::Result<IpAddr>,
        ) {
            self.got = Some((hostname.to_string(), result));
        }
    }

    #[test]
    fn test_resolve_localhost() {
        let mut lp = EventLoop::new().unwrap();
        let resolver = Rc::new(Resolver::new().unwrap());
        Resolver::register(&resolver, &mut lp).unwrap();

        let sink = Rc::new(RefCell::new(Sink::default()));
        let handler: Rc<RefCell<dyn DnsCallback>> = sink.clone();
        resolver.resolve("localhost", Rc::downgrade(&handler)).unwrap();

        for _ in 0..100 {
            lp.run_once(Some(Duration::from_millis(50))).unwrap();
            if sink.borrow().got.is_some() {
                break;
            }
        }

        let got = sink.borrow_mut().got.take().expect("no answer delivered");
        assert_eq!(got.0, "localhost");
        assert!(got.1.unwrap().is_loopback());
    }

    #[test]
    fn test_dead_waiter_is_skipped() {
        let mut lp = EventLoop::new().unwrap();
        let resolver = Rc::new(Resolver::new().unwrap());
        Resolver::register(&resolver, &mut lp).unwrap();

        let sink = Rc::new(RefCell::new(Sink::default()));
        let handler: Rc<RefCell<dyn DnsCallback>> = sink.clone();
        resolver.resolve("localhost", Rc::downgrade(&handler)).unwrap();
        drop(handler);
        drop(sink);

        // answer arrives, nobody is waiting, nothing blows up
        for _ in 0..100 {
            lp.run_once(Some(Duration::from_millis(50))).unwrap();
            if resolver.inner.borrow().waiters.is_empty() {
                break;
            }
        }
        assert!(resolver.inner.borrow().waiters.is_empty());
    }
}
