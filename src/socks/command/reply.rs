//! SOCKS5 reply builder

use crate::error::Socks5ReplyCode;
use crate::socks::consts::*;
use crate::socks::types::TargetAddr;
use anyhow::Result;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Encode a reply
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// Without a bind address `0.0.0.0:0` is sent.
pub fn reply_bytes(code: Socks5ReplyCode, bind: Option<SocketAddr>) -> Vec<u8> {
    let bind = bind.unwrap_or_else(|| SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)));
    let mut buf = vec![SOCKS5_VERSION, code.into(), SOCKS5_RESERVED];
    TargetAddr::Ip(bind).write_to(&mut buf);
    buf
}

/// Send a reply
pub async fn reply<S>(stream: &mut S, code: Socks5ReplyCode, bind: Option<SocketAddr>) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&reply_bytes(code, bind)).await?;
    stream.flush().await?;
    Ok(())
}
