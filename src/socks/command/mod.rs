//! SOCKS5 request parsing and replies

mod parser;
mod reply;

pub use parser::parse_request;
pub use reply::{reply, reply_bytes};
