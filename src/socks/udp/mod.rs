//! SOCKS5 UDP ASSOCIATE support
//!
//! The relay socket never parses payloads beyond the header check; whole
//! encapsulated frames travel through the tunnel.

mod packet;
mod relay;

pub use packet::{encode_udp_packet, parse_udp_header, UdpHeader};
pub use relay::UdpRelay;
