//! Client-facing UDP relay socket
//!
//! One socket per association. The client address is learned from the
//! first datagram whose source IP matches the client's TCP connection;
//! anything else is dropped.

use crate::socks::consts::MAX_UDP_PACKET;
use anyhow::{Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use std::io;
use std::net::{IpAddr, SocketAddr};
use tokio::net::UdpSocket;
use tracing::{debug, trace};

/// UDP socket serving one SOCKS5 UDP association
#[derive(Debug)]
pub struct UdpRelay {
    socket: UdpSocket,
    client_ip: IpAddr,
    client: Mutex<Option<SocketAddr>>,
}

impl UdpRelay {
    /// Bind an ephemeral port on `local_ip` for the client at `client_ip`
    pub async fn bind(local_ip: IpAddr, client_ip: IpAddr) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0))
            .await
            .with_context(|| format!("Failed to bind UDP relay on {}", local_ip))?;
        debug!(
            "UDP relay bound on {:?} for {}",
            socket.local_addr().ok(),
            client_ip
        );
        Ok(UdpRelay {
            socket,
            client_ip,
            client: Mutex::new(None),
        })
    }

    /// Address announced in the UDP ASSOCIATE reply
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Client address, once a datagram arrived
    pub fn client(&self) -> Option<SocketAddr> {
        *self.client.lock()
    }

    /// Next encapsulated datagram from the client
    pub async fn client_message(&self) -> io::Result<Bytes> {
        let mut buf = vec![0u8; MAX_UDP_PACKET];
        loop {
            let (n, from) = self.socket.recv_from(&mut buf).await?;
            if from.ip() != self.client_ip && !self.client_ip.is_loopback() {
                trace!("UDP relay dropped datagram from stranger {}", from);
                continue;
            }

            let mut client = self.client.lock();
            match *client {
                Some(known) if known != from => {
                    trace!("UDP relay dropped datagram from {} (client is {})", from, known);
                    continue;
                }
                Some(_) => {}
                None => *client = Some(from),
            }
            drop(client);

            buf.truncate(n);
            return Ok(Bytes::from(buf));
        }
    }

    /// Send an encapsulated datagram to the client
    ///
    /// Dropped if the client has not spoken yet.
    pub async fn reply_msg(&self, frame: &[u8]) -> io::Result<()> {
        let Some(client) = self.client() else {
            trace!("UDP relay has no client yet; reply dropped");
            return Ok(());
        };
        self.socket.send_to(frame, client).await?;
        Ok(())
    }
}
