use std::cell::RefCell;
use std::io;
use std::net::{TcpListener, UdpSocket};
use std::os::fd::AsRawFd;
use std::rc::Rc;

use crate::config::LocalConfig;
use crate::crypto::{CipherSuite, KeyCache};
use crate::eventloop::EventLoop;
use crate::net;
use crate::tcprelay::TcpRelay;
use crate::udprelay::UdpRelay;

/// Local end of the tunnel, a socks5 proxy that forwards through the server.
pub struct Local {
    config: LocalConfig,
}

impl Local {
    pub fn new(config: LocalConfig) -> Local {
        Local { config }
    }

    pub fn serve(&self) -> io::Result<()> {
        let config = &self.config;

        let mut lp = EventLoop::new()?;
        let mut keys = KeyCache::new();
        let suite = CipherSuite::new(config.method, &config.password, &mut keys);

        let listener = TcpListener::bind(config.listen)?;
        listener.set_nonblocking(true)?;
        if config.fast_open {
            if let Err(e) = net::listen_fast_open(listener.as_raw_fd()) {
                warn!("tcp fast open unavailable, {}", e);
            }
        }
        // udp associate hands clients this same port.
        let udp = UdpSocket::bind(config.listen)?;

        let tcp_relay = Rc::new(RefCell::new(TcpRelay::new_local(
            listener,
            config,
            suite.clone(),
        )?));
        TcpRelay::register(&tcp_relay, &mut lp)?;

        let udp_relay = Rc::new(RefCell::new(UdpRelay::new_local(udp, config, suite)?));
        UdpRelay::register(&udp_relay, &mut lp)?;

        info!(
            "listening for socks5 proxy on local {}, cipher {}",
            config.listen,
            config.method
        );

        lp.run()
    }
}
