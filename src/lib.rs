#[macro_use]
extern crate log;

mod cache;
mod dns;
mod eventloop;
mod net;
mod socks5;
mod tcprelay;
mod udprelay;

pub mod config;
pub mod crypto;
pub mod local;
pub mod server;
pub mod util;

pub use crate::local::Local;
pub use crate::server::Server;

/// Read size of the tcp pumps, one encrypted chunk at most this big.
const BUF_SIZE: usize = 32 * 1024;

/// Large enough for any datagram a client can hand us.
const UDP_BUF_SIZE: usize = 64 * 1024;
