//! SOCKS5 request parser

use crate::error::Socks5Error;
use crate::socks::consts::*;
use crate::socks::types::{SocksCommand, TargetAddr};
use anyhow::{Context, Result};
use std::net::{Ipv4Addr, Ipv6Addr};
use tokio::io::{AsyncRead, AsyncReadExt};

/// Read one request from the client
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | CMD |  RSV  | ATYP | DST.ADDR | DST.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
///
/// An unknown command still yields the address so the caller can reply
/// before closing; it is reported as `Err(CommandNotSupported)` in the
/// first tuple element.
pub async fn parse_request<S>(
    stream: &mut S,
) -> Result<(Result<SocksCommand, Socks5Error>, TargetAddr)>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .await
        .context("Failed to read request header")?;

    let [version, cmd, _reserved, addr_type] = header;
    if version != SOCKS5_VERSION {
        return Err(Socks5Error::UnsupportedVersion(version).into());
    }

    let target = read_address(stream, addr_type).await?;
    let command = SocksCommand::from_byte(cmd).ok_or(Socks5Error::CommandNotSupported(cmd));

    Ok((command, target))
}

async fn read_address<S>(stream: &mut S, addr_type: u8) -> Result<TargetAddr>
where
    S: AsyncRead + Unpin,
{
    let addr = match addr_type {
        SOCKS5_ADDR_TYPE_IPV4 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await?;
            TargetAddr::ipv4(Ipv4Addr::from(ip), stream.read_u16().await?)
        }
        SOCKS5_ADDR_TYPE_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            if len == 0 || len > MAX_DOMAIN_LEN {
                return Err(Socks5Error::InvalidDomain(format!("length {}", len)).into());
            }
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| Socks5Error::InvalidDomain("not UTF-8".to_string()))?;
            TargetAddr::domain(domain, stream.read_u16().await?)
        }
        SOCKS5_ADDR_TYPE_IPV6 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await?;
            TargetAddr::ipv6(Ipv6Addr::from(ip), stream.read_u16().await?)
        }
        other => return Err(Socks5Error::AddressTypeNotSupported(other).into()),
    };
    Ok(addr)
}
