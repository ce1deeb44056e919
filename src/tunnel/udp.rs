//! UDP carriage handle
//!
//! A UDP stream is a pair of datagram channels plus a readiness flag. The
//! local side must not send until the tunnel reports ready.

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// The tunnel dropped the delivery before (or after) it became ready
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("UDP delivery closed")]
pub struct UdpDeliveryClosed;

/// Local end of a UDP stream
#[derive(Debug)]
pub struct UdpDelivery {
    ready: watch::Receiver<bool>,
    to_remote: mpsc::Sender<Bytes>,
    from_remote: mpsc::Receiver<Bytes>,
}

/// Tunnel end of a UDP stream
#[derive(Debug)]
pub struct UdpDeliveryRemote {
    ready: watch::Sender<bool>,
    /// Datagrams sent by the local client
    pub from_client: mpsc::Receiver<Bytes>,
    /// Datagrams for the local client
    pub to_client: mpsc::Sender<Bytes>,
}

impl UdpDelivery {
    /// Create a connected pair of ends with `capacity` datagrams of buffering
    pub fn pair(capacity: usize) -> (UdpDelivery, UdpDeliveryRemote) {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (to_remote, from_client) = mpsc::channel(capacity);
        let (to_client, from_remote) = mpsc::channel(capacity);

        (
            UdpDelivery {
                ready: ready_rx,
                to_remote,
                from_remote,
            },
            UdpDeliveryRemote {
                ready: ready_tx,
                from_client,
                to_client,
            },
        )
    }

    /// Current readiness
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the tunnel can carry datagrams
    pub async fn ready(&mut self) -> Result<(), UdpDeliveryClosed> {
        self.ready
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| UdpDeliveryClosed)
    }

    /// Split into the outbound sender and inbound receiver
    pub fn into_parts(self) -> (mpsc::Sender<Bytes>, mpsc::Receiver<Bytes>) {
        (self.to_remote, self.from_remote)
    }
}

impl UdpDeliveryRemote {
    /// Announce that datagrams can flow
    pub fn mark_ready(&self) {
        self.ready.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_ready_after_mark() {
        let (mut local, remote) = UdpDelivery::pair(4);
        assert!(!local.is_ready());

        let waiter = tokio::spawn(async move {
            local.ready().await.unwrap();
            local
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        remote.mark_ready();

        let local = waiter.await.unwrap();
        assert!(local.is_ready());
    }

    #[tokio::test]
    async fn test_ready_fails_when_remote_dropped() {
        let (mut local, remote) = UdpDelivery::pair(4);
        drop(remote);
        assert_eq!(local.ready().await, Err(UdpDeliveryClosed));
    }

    #[tokio::test]
    async fn test_datagrams_flow_both_ways() {
        let (local, mut remote) = UdpDelivery::pair(4);
        remote.mark_ready();
        let (tx, mut rx) = local.into_parts();

        tx.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(remote.from_client.recv().await.unwrap(), "ping");

        remote.to_client.send(Bytes::from_static(b"pong")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "pong");
    }
}
