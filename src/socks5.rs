//! Socks5 protocol definition ([RFC1928](https://tools.ietf.org/rfc/rfc1928.txt))

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

pub const VERSION: u8 = 0x05;

pub const AUTH_METHOD_NONE: u8 = 0x00;
pub const AUTH_METHOD_USER_PASS: u8 = 0x02;
pub const AUTH_METHOD_NO_ACCEPTABLE: u8 = 0xff;

// RFC1929 username/password sub-negotiation
pub const AUTH_USER_PASS_VERSION: u8 = 0x01;
pub const AUTH_SUCCEEDED: u8 = 0x00;

pub const CMD_TCP_CONNECT: u8 = 0x01;
pub const CMD_UDP_ASSOCIATE: u8 = 0x03;

pub const ADDR_TYPE_IPV4: u8 = 0x01;
pub const ADDR_TYPE_DOMAIN_NAME: u8 = 0x03;
pub const ADDR_TYPE_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;

// +------+----------+----------+
// | ATYP |   ADDR   |   PORT   |
// +------+----------+----------+
// |  1   | Variable |    2     |
// +------+----------+----------+
pub const MAX_ADDR_LEN: usize = 1 + 1 + 255 + 2;

// UDP datagrams start with RSV(2) + FRAG(1) before the address
pub const UDP_HEAD_LEN: usize = 3;

/// Target address carried in a socks5 request and, on the encrypted hop,
/// in front of every connection (TCP) or datagram (UDP).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl Address {
    /// Decode one address header off the front of `buf`, returning it and
    /// the number of bytes consumed. Anything malformed is `None`; the
    /// callers drop such traffic without a reply.
    pub fn parse(buf: &[u8]) -> Option<(Address, usize)> {
        let atyp = *buf.first()?;
        match atyp {
            ADDR_TYPE_IPV4 => {
                if buf.len() < 1 + 4 + 2 {
                    return None;
                }
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&buf[1..5]);
                let port = (u16::from(buf[5]) << 8) | u16::from(buf[6]);
                let addr = SocketAddr::new(Ipv4Addr::from(octets).into(), port);
                Some((Address::Ip(addr), 7))
            }
            ADDR_TYPE_IPV6 => {
                if buf.len() < 1 + 16 + 2 {
                    return None;
                }
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[1..17]);
                let port = (u16::from(buf[17]) << 8) | u16::from(buf[18]);
                let addr = SocketAddr::new(Ipv6Addr::from(octets).into(), port);
                Some((Address::Ip(addr), 19))
            }
            ADDR_TYPE_DOMAIN_NAME => {
                let len = *buf.get(1)? as usize;
                if buf.len() < 2 + len + 2 {
                    return None;
                }
                let domain = String::from_utf8(buf[2..2 + len].to_vec()).ok()?;
                let port = (u16::from(buf[2 + len]) << 8) | u16::from(buf[2 + len + 1]);
                Some((Address::Domain(domain, port), 2 + len + 2))
            }
            _ => None,
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        match *self {
            Address::Ip(SocketAddr::V4(ref a)) => {
                out.push(ADDR_TYPE_IPV4);
                out.extend_from_slice(&a.ip().octets());
                out.extend_from_slice(&a.port().to_be_bytes());
            }
            Address::Ip(SocketAddr::V6(ref a)) => {
                out.push(ADDR_TYPE_IPV6);
                out.extend_from_slice(&a.ip().octets());
                out.extend_from_slice(&a.port().to_be_bytes());
            }
            Address::Domain(ref domain, port) => {
                out.push(ADDR_TYPE_DOMAIN_NAME);
                out.push(domain.len() as u8);
                out.extend_from_slice(domain.as_bytes());
                out.extend_from_slice(&port.to_be_bytes());
            }
        }
    }

    #[inline]
    pub fn port(&self) -> u16 {
        match *self {
            Address::Ip(ref addr) => addr.port(),
            Address::Domain(_, port) => port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Address::Ip(ref addr) => write!(fmt, "{}", addr),
            Address::Domain(ref domain, port) => write!(fmt, "{}:{}", domain, port),
        }
    }
}

// +----+-----+-------+------+----------+----------+
// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
// +----+-----+-------+------+----------+----------+
// | 1  |  1  | X'00' |  1   | Variable |    2     |
// +----+-----+-------+------+----------+----------+
//
// BND.ADDR use IP V4 or V6, 16 is ipv6 bytes
pub const REPLY_LEN: usize = 1 + 1 + 1 + 1 + 16 + 2;

pub struct Reply {
    len: usize,
    buffer: [u8; REPLY_LEN],
}

impl Reply {
    pub fn new(addr: SocketAddr) -> Reply {
        let mut buf = [0u8; REPLY_LEN];

        // VER - protocol version
        buf[0] = VERSION;

        // RSV - reserved
        buf[2] = 0;

        let pos = match addr {
            SocketAddr::V4(ref a) => {
                buf[3] = ADDR_TYPE_IPV4;
                buf[4..8].copy_from_slice(&a.ip().octets()[..]);
                8
            }
            SocketAddr::V6(ref a) => {
                buf[3] = ADDR_TYPE_IPV6;
                buf[4..20].copy_from_slice(&a.ip().octets()[..]);
                20
            }
        };
        buf[pos] = (addr.port() >> 8) as u8;
        buf[pos + 1] = addr.port() as u8;

        Reply {
            len: pos + 2,
            buffer: buf,
        }
    }

    pub fn get(&self, rtype: u8, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.buffer[..self.len]);
        let pos = out.len() - self.len;
        // REP
        out[pos + 1] = rtype;
    }
}

#[cfg(test)]
mod test {
    use std::net::SocketAddr;

    use super::*;

    #[test]
    fn test_parse_ipv4() {
        let buf = [ADDR_TYPE_IPV4, 127, 0, 0, 1, 0x1f, 0x90, 0xaa, 0xbb];
        let (addr, used) = Address::parse(&buf).unwrap();
        assert_eq!(used, 7);
        assert_eq!(addr, Address::Ip("127.0.0.1:8080".parse().unwrap()));
        assert_eq!(addr.port(), 8080);
    }

    #[test]
    fn test_parse_ipv6() {
        let mut buf = vec![ADDR_TYPE_IPV6];
        buf.extend_from_slice(&[0u8; 15]);
        buf.push(1);
        buf.extend_from_slice(&443u16.to_be_bytes());

        let (addr, used) = Address::parse(&buf).unwrap();
        assert_eq!(used, 19);
        assert_eq!(addr, Address::Ip("[::1]:443".parse().unwrap()));
    }

    #[test]
    fn test_parse_domain() {
        let mut buf = vec![ADDR_TYPE_DOMAIN_NAME, 11];
        buf.extend_from_slice(b"example.com");
        buf.extend_from_slice(&80u16.to_be_bytes());
        buf.extend_from_slice(b"payload");

        let (addr, used) = Address::parse(&buf).unwrap();
        assert_eq!(used, 2 + 11 + 2);
        assert_eq!(addr, Address::Domain("example.com".to_string(), 80));
        assert_eq!(format!("{}", addr), "example.com:80");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        // unknown ATYP
        assert!(Address::parse(&[0x02, 1, 2, 3, 4, 0, 80]).is_none());
        // truncated
        assert!(Address::parse(&[]).is_none());
        assert!(Address::parse(&[ADDR_TYPE_IPV4, 127, 0, 0]).is_none());
        assert!(Address::parse(&[ADDR_TYPE_DOMAIN_NAME, 30, b'a', b'b']).is_none());
        // domain must be utf-8
        assert!(Address::parse(&[ADDR_TYPE_DOMAIN_NAME, 2, 0xff, 0xfe, 0, 80]).is_none());
    }

    #[test]
    fn test_roundtrip() {
        let cases = vec![
            Address::Ip("10.1.2.3:65535".parse().unwrap()),
            Address::Ip("[2001:db8::7]:53".parse().unwrap()),
            Address::Domain("localhost".to_string(), 1080),
        ];

        for addr in cases {
            let mut out = Vec::new();
            addr.write_to(&mut out);
            let (parsed, used) = Address::parse(&out).unwrap();
            assert_eq!(used, out.len());
            assert_eq!(parsed, addr);
        }
    }

    #[test]
    fn test_reply() {
        let addr: SocketAddr = "127.0.0.1:1080".parse().unwrap();
        let reply = Reply::new(addr);

        let mut out = Vec::new();
        reply.get(REPLY_SUCCEEDED, &mut out);
        assert_eq!(
            out,
            vec![VERSION, REPLY_SUCCEEDED, 0, ADDR_TYPE_IPV4, 127, 0, 0, 1, 0x04, 0x38]
        );

        let mut out = vec![0xee];
        reply.get(0x07, &mut out);
        assert_eq!(out[0], 0xee);
        assert_eq!(out[1], VERSION);
        assert_eq!(out[2], 0x07);
    }
}
