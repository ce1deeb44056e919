//! SOCKS5 front-end protocol
//!
//! Implements the local side of SOCKS5: method negotiation, username and
//! password authentication, request parsing, replies, and the UDP relay
//! socket used by UDP ASSOCIATE. What happens to a parsed request is up
//! to the [`SocksHandler`] given to the [`SocksServer`].

mod auth;
mod command;
pub mod consts;
mod server;
mod types;
mod udp;

pub use auth::{authenticate, AuthMethod};
pub use command::{parse_request, reply, reply_bytes};
pub use server::{SocksHandler, SocksServer};
pub use types::{SocksCommand, TargetAddr};
pub use udp::{encode_udp_packet, parse_udp_header, UdpHeader, UdpRelay};
