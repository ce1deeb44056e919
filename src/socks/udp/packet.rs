//! SOCKS5 UDP encapsulation
//!
//! ```text
//! +----+------+------+----------+----------+----------+
//! |RSV | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +----+------+------+----------+----------+----------+
//! | 2  |  1   |  1   | Variable |    2     | Variable |
//! +----+------+------+----------+----------+----------+
//! ```

use crate::error::Socks5Error;
use crate::socks::consts::*;
use crate::socks::types::TargetAddr;
use bytes::Buf;
use std::net::{Ipv4Addr, Ipv6Addr};

/// Parsed header of an encapsulated datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpHeader {
    /// Fragment number; only 0 is relayed
    pub frag: u8,
    /// Destination (client to relay) or source (relay to client)
    pub addr: TargetAddr,
    /// Header length; the payload starts here
    pub len: usize,
}

fn malformed(reason: impl Into<String>) -> Socks5Error {
    Socks5Error::MalformedDatagram(reason.into())
}

/// Parse the header of `frame`; the RSV field is not checked
pub fn parse_udp_header(frame: &[u8]) -> Result<UdpHeader, Socks5Error> {
    if frame.len() < MIN_UDP_HEADER_LEN {
        return Err(malformed(format!("{} bytes", frame.len())));
    }

    let mut buf = &frame[2..];
    let frag = buf.get_u8();
    let atyp = buf.get_u8();

    let addr = match atyp {
        SOCKS5_ADDR_TYPE_IPV4 => {
            let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            buf.advance(4);
            TargetAddr::ipv4(ip, buf.get_u16())
        }
        SOCKS5_ADDR_TYPE_DOMAIN => {
            let len = buf.get_u8() as usize;
            if len == 0 || buf.remaining() < len + 2 {
                return Err(malformed("truncated domain"));
            }
            let domain = String::from_utf8(buf[..len].to_vec())
                .map_err(|_| malformed("domain is not UTF-8"))?;
            buf.advance(len);
            TargetAddr::domain(domain, buf.get_u16())
        }
        SOCKS5_ADDR_TYPE_IPV6 => {
            if buf.remaining() < 18 {
                return Err(malformed("truncated IPv6 address"));
            }
            let mut ip = [0u8; 16];
            buf.copy_to_slice(&mut ip);
            TargetAddr::ipv6(Ipv6Addr::from(ip), buf.get_u16())
        }
        other => return Err(malformed(format!("address type {}", other))),
    };

    Ok(UdpHeader {
        frag,
        addr,
        len: frame.len() - buf.remaining(),
    })
}

/// Encapsulate `data` for `addr` as a standalone (FRAG 0) datagram
pub fn encode_udp_packet(addr: &TargetAddr, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MIN_UDP_HEADER_LEN + data.len());
    buf.extend_from_slice(&[0, 0, 0]);
    addr.write_to(&mut buf);
    buf.extend_from_slice(data);
    buf
}
