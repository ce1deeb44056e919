//! UDP ASSOCIATE bridge
//!
//! Moves SOCKS5-encapsulated datagrams between a client-facing
//! [`UdpRelay`] and the tunnel's UDP delivery. Frames cross the tunnel with
//! their SOCKS5 header intact; the relay resolves the address from it.
//!
//! The association lives as long as the client's TCP control connection.

use super::relay::ProxyHandler;
use crate::error::{Socks5Error, Socks5ReplyCode};
use crate::socks::{parse_udp_header, reply, TargetAddr, UdpRelay};
use crate::tunnel::StreamRequest;
use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tracing::debug;

/// Prepare a client datagram for the tunnel
///
/// Fragments and frames too short for a header are refused. RSV is zeroed.
pub(crate) fn client_frame(frame: &[u8]) -> Result<Bytes, Socks5Error> {
    let header = parse_udp_header(frame)?;
    if header.frag != 0 {
        return Err(Socks5Error::MalformedDatagram(format!(
            "fragment {} not supported",
            header.frag
        )));
    }
    let mut out = frame.to_vec();
    out[0] = 0;
    out[1] = 0;
    Ok(Bytes::from(out))
}

/// Prepare a tunnel datagram for the client: RSV and FRAG forced to zero
pub(crate) fn remote_frame(frame: &[u8]) -> Option<Vec<u8>> {
    if frame.len() < 3 {
        return None;
    }
    let mut out = frame.to_vec();
    out[..3].fill(0);
    Some(out)
}

/// Serve one UDP ASSOCIATE request on `control`
pub(crate) async fn associate(
    handler: &ProxyHandler,
    mut control: TcpStream,
    target: TargetAddr,
) -> Result<()> {
    let request = StreamRequest::udp(target.host(), target.port());
    let mut lease = match handler.open(request).await {
        Ok(lease) => lease,
        Err(e) => {
            reply(&mut control, Socks5ReplyCode::GeneralFailure, None).await?;
            return Err(e.into());
        }
    };

    let prepared = async {
        let mut delivery = lease
            .take_udp()
            .ok_or_else(|| anyhow!("tunnel returned a non-UDP stream"))?;
        delivery.ready().await?;

        let local_ip = control.local_addr()?.ip();
        let client_ip = control.peer_addr()?.ip();
        let relay = UdpRelay::bind(local_ip, client_ip).await?;
        Ok::<_, anyhow::Error>((delivery, relay))
    };
    let (delivery, relay) = match prepared.await {
        Ok(prepared) => prepared,
        Err(e) => {
            reply(&mut control, Socks5ReplyCode::GeneralFailure, None).await?;
            return Err(e.context(format!("UDP association for {}", target)));
        }
    };

    let relay_addr = relay.local_addr()?;
    reply(&mut control, Socks5ReplyCode::Succeeded, Some(relay_addr)).await?;
    debug!("UDP association on {} for {}", relay_addr, lease.key());

    let (to_remote, mut from_remote) = delivery.into_parts();
    let (mut bytes_in, mut bytes_out) = (0u64, 0u64);
    let mut probe = [0u8; 64];

    let outcome = loop {
        tokio::select! {
            frame = relay.client_message() => match frame {
                Ok(frame) => match client_frame(&frame) {
                    Ok(frame) => {
                        bytes_out += frame.len() as u64;
                        if to_remote.send(frame).await.is_err() {
                            break Ok(());
                        }
                    }
                    Err(e) => debug!("[udp] dropped client datagram: {}", e),
                },
                Err(e) => break Err(e).context("UDP relay socket failed"),
            },
            frame = from_remote.recv() => match frame {
                Some(frame) => match remote_frame(&frame) {
                    Some(frame) => {
                        bytes_in += frame.len() as u64;
                        if let Err(e) = relay.reply_msg(&frame).await {
                            break Err(e).context("UDP relay socket failed");
                        }
                    }
                    None => debug!("[udp] dropped {} byte remote datagram", frame.len()),
                },
                None => break Ok(()),
            },
            read = control.read(&mut probe) => match read {
                Ok(0) | Err(_) => break Ok(()),
                Ok(_) => {}
            },
        }
    };

    lease.record(bytes_in, bytes_out);
    outcome
}
