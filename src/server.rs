use std::cell::RefCell;
use std::io;
use std::net::{TcpListener, UdpSocket};
use std::os::fd::AsRawFd;
use std::rc::Rc;
use std::thread;

use crate::config::ServerConfig;
use crate::crypto::{CipherSuite, KeyCache};
use crate::dns::Resolver;
use crate::eventloop::EventLoop;
use crate::net;
use crate::tcprelay::TcpRelay;
use crate::udprelay::UdpRelay;

/// Remote end of the tunnel, unseals traffic and relays it to the targets.
pub struct Server {
    config: ServerConfig,
}

impl Server {
    pub fn new(config: ServerConfig) -> Server {
        Server { config }
    }

    pub fn serve(&self) -> io::Result<()> {
        let config = &self.config;

        let listener = TcpListener::bind(config.listen)?;
        listener.set_nonblocking(true)?;
        if config.fast_open {
            if let Err(e) = net::listen_fast_open(listener.as_raw_fd()) {
                warn!("tcp fast open unavailable, {}", e);
            }
        }
        let udp = UdpSocket::bind(config.listen)?;

        info!(
            "listening on server {}, cipher {}, {} workers",
            config.listen,
            config.method,
            config.workers
        );

        // Every worker polls the same listening sockets, the kernel spreads
        // connections across whoever is in accept at the time.
        for i in 1..config.workers {
            let config = self.config.clone();
            let listener = listener.try_clone()?;
            let udp = udp.try_clone()?;
            thread::Builder::new()
                .name(format!("worker-{}", i))
                .spawn(move || {
                    if let Err(e) = run_worker(&config, listener, udp) {
                        error!("worker {} exited, {}", i, e);
                    }
                })?;
        }

        run_worker(config, listener, udp)
    }
}

fn run_worker(config: &ServerConfig, listener: TcpListener, udp: UdpSocket) -> io::Result<()> {
    let mut lp = EventLoop::new()?;
    let mut keys = KeyCache::new();
    let suite = CipherSuite::new(config.method, &config.password, &mut keys);

    let resolver = Rc::new(Resolver::new()?);
    Resolver::register(&resolver, &mut lp)?;

    let tcp_relay = Rc::new(RefCell::new(TcpRelay::new_server(
        listener,
        config,
        suite.clone(),
        resolver.clone(),
    )?));
    TcpRelay::register(&tcp_relay, &mut lp)?;

    let udp_relay = Rc::new(RefCell::new(UdpRelay::new_server(udp, config, suite, resolver)?));
    UdpRelay::register(&udp_relay, &mut lp)?;

    lp.run()
}
