//! Multiplexing tunnel over a carrier [`Transport`]
//!
//! One carrier connection per session. A driver task owns the framed
//! carrier; every logical stream gets a pump task that turns its local half
//! into `Data`/`Close` frames.

use super::{
    CarrierStatus, Connector, SharingMode, StreamRequest, TunnelSession, TunnelStream,
    UdpDelivery, UdpDeliveryRemote,
};
use crate::config::TunnelConfig;
use crate::protocol::{
    decode_frame, encode_frame, framed, random_key, read_message, write_message, Ack, Auth,
    CarrierFramed, Challenge, Digest, Frame, Hello, Protocol, StreamId, CURRENT_PROTO_VERSION,
};
use crate::transport::{RelayAddr, Transport};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Frames queued from stream pumps to the driver
const COMMAND_CHANNEL_CAPACITY: usize = 256;

/// Datagrams buffered per UDP stream between the pump and the bridge
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Bytes a stream may hold on the way to its local side; a TCP stream over
/// the limit is reset, a UDP datagram over it is dropped
const STREAM_BUFFER_LIMIT: usize = 4 * 1024 * 1024;

/// In-memory pipe size between a TCP stream handle and its pump
const DUPLEX_BUFFER: usize = 64 * 1024;

/// Largest payload read from a local stream per frame
const READ_CHUNK: usize = 16 * 1024;

type Streams = Arc<DashMap<StreamId, StreamSlot>>;

struct StreamSlot {
    protocol: Protocol,
    inbound: mpsc::UnboundedSender<Bytes>,
    queued: Arc<AtomicUsize>,
    reset: CancellationToken,
    opened: Option<oneshot::Sender<Result<(), String>>>,
}

/// Result of handing a relay chunk to a stream
enum Offer {
    Queued,
    Full,
    Gone,
}

impl StreamSlot {
    fn new(
        protocol: Protocol,
        opened: oneshot::Sender<Result<(), String>>,
    ) -> (StreamSlot, Inbox) {
        let (inbound, rx) = mpsc::unbounded_channel();
        let queued = Arc::new(AtomicUsize::new(0));
        let reset = CancellationToken::new();
        let slot = StreamSlot {
            protocol,
            inbound,
            queued: queued.clone(),
            reset: reset.clone(),
            opened: Some(opened),
        };
        (slot, Inbox { rx, queued, reset })
    }

    /// Queue `payload` without waiting on the local side
    fn offer(&self, payload: Bytes) -> Offer {
        let len = payload.len();
        let before = self.queued.fetch_add(len, Ordering::AcqRel);
        if before > 0 && before + len > STREAM_BUFFER_LIMIT {
            self.queued.fetch_sub(len, Ordering::AcqRel);
            return Offer::Full;
        }
        match self.inbound.send(payload) {
            Ok(()) => Offer::Queued,
            Err(_) => Offer::Gone,
        }
    }
}

/// Pump side of a stream's inbound queue
struct Inbox {
    rx: mpsc::UnboundedReceiver<Bytes>,
    queued: Arc<AtomicUsize>,
    reset: CancellationToken,
}

impl Inbox {
    async fn recv(&mut self) -> Option<Bytes> {
        let chunk = self.rx.recv().await?;
        self.queued.fetch_sub(chunk.len(), Ordering::AcqRel);
        Some(chunk)
    }
}

enum Command {
    Send(Frame),
    Shutdown { code: u16, reason: String },
}

/// [`Connector`] that opens carriers with transport `T`
pub struct MuxConnector<T: Transport> {
    relays: DashMap<String, RelayAddr>,
    _transport: PhantomData<fn() -> T>,
}

impl<T: Transport> MuxConnector<T> {
    /// Create a connector
    pub fn new() -> Self {
        MuxConnector {
            relays: DashMap::new(),
            _transport: PhantomData,
        }
    }

    fn relay_addr(&self, server: &str) -> RelayAddr {
        self.relays
            .entry(server.to_string())
            .or_insert_with(|| RelayAddr::new(server))
            .clone()
    }
}

impl<T: Transport> Default for MuxConnector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Transport> std::fmt::Debug for MuxConnector<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxConnector")
            .field("relays", &self.relays.len())
            .finish()
    }
}

#[async_trait]
impl<T: Transport> Connector for MuxConnector<T> {
    async fn connect(
        &self,
        config: &TunnelConfig,
        mode: SharingMode,
    ) -> Result<Arc<dyn TunnelSession>> {
        let transport = T::new(&config.transport)?;
        let addr = self.relay_addr(&config.server);

        let hello = Hello::Open {
            version: CURRENT_PROTO_VERSION,
            user: config.user.clone(),
            mode,
            algo: config.algo.clone(),
            key: random_key(config.key_length),
            deflate: config.deflate,
        };

        let (conn, session) = tokio::time::timeout(
            config.connect_timeout(),
            handshake(&transport, &addr, &hello, config),
        )
        .await
        .with_context(|| format!("Tunnel handshake with {} timed out", addr))??;

        debug!("Tunnel to {} established ({})", addr, mode);

        Ok(MuxSession::spawn(conn, session, transport, addr, config.clone()))
    }
}

/// Connect and run the hello/challenge/auth exchange
/// The relay answered the handshake with something other than `Ack::Ok`
#[derive(Debug, Error)]
#[error("Relay refused tunnel: {0}")]
struct Refused(Ack);

async fn handshake<T: Transport>(
    transport: &T,
    addr: &RelayAddr,
    hello: &Hello,
    config: &TunnelConfig,
) -> Result<(CarrierFramed<T::Stream>, Digest)> {
    let stream = transport.connect(addr).await?;
    let mut conn = framed(stream);

    write_message(&mut conn, hello).await?;
    let Challenge(nonce) = read_message(&mut conn).await?;
    write_message(&mut conn, &Auth::new(&config.user, &config.pass, &nonce)).await?;

    match read_message::<_, Ack>(&mut conn).await? {
        Ack::Ok(session) => Ok((conn, session)),
        other => Err(Refused(other).into()),
    }
}

/// Session over one multiplexed carrier
#[derive(Debug)]
pub struct MuxSession {
    cmd_tx: mpsc::Sender<Command>,
    status_rx: watch::Receiver<CarrierStatus>,
    streams: Streams,
    next_id: AtomicU32,
    open_timeout: Duration,
}

impl std::fmt::Debug for StreamSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamSlot")
            .field("protocol", &self.protocol)
            .field("queued", &self.queued.load(Ordering::Relaxed))
            .field("pending", &self.opened.is_some())
            .finish()
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Command::Send(frame) => write!(f, "Send({:?})", frame.stream_id()),
            Command::Shutdown { code, .. } => write!(f, "Shutdown({})", code),
        }
    }
}

impl MuxSession {
    fn spawn<T: Transport>(
        conn: CarrierFramed<T::Stream>,
        session: Digest,
        transport: T,
        addr: RelayAddr,
        config: TunnelConfig,
    ) -> Arc<dyn TunnelSession> {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (status_tx, status_rx) = watch::channel(CarrierStatus::Connected);
        let streams: Streams = Arc::new(DashMap::new());
        let open_timeout = config.connect_timeout();

        let driver = Driver {
            conn,
            cmd_rx,
            status_tx,
            streams: streams.clone(),
            backlog: VecDeque::new(),
            transport,
            addr,
            session,
            config,
        };
        tokio::spawn(driver.run());

        Arc::new(MuxSession {
            cmd_tx,
            status_rx,
            streams,
            next_id: AtomicU32::new(1),
            open_timeout,
        })
    }

    fn forget(&self, id: StreamId) {
        if self.streams.remove(&id).is_some() {
            let _ = self.cmd_tx.try_send(Command::Send(Frame::Close { id }));
        }
    }
}

#[async_trait]
impl TunnelSession for MuxSession {
    async fn open_stream(&self, request: &StreamRequest) -> Result<TunnelStream> {
        if self.status_rx.borrow().is_closed() {
            bail!("Tunnel closed");
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (opened_tx, opened_rx) = oneshot::channel();
        let (slot, inbox) = StreamSlot::new(request.protocol, opened_tx);
        self.streams.insert(id, slot);

        let open = Frame::Open {
            id,
            protocol: request.protocol,
            addr: request.addr.clone(),
            port: request.port,
        };
        if self.cmd_tx.send(Command::Send(open)).await.is_err() {
            self.streams.remove(&id);
            bail!("Tunnel closed");
        }

        match request.protocol {
            Protocol::Tcp => {
                match tokio::time::timeout(self.open_timeout, opened_rx).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(reason))) => {
                        self.streams.remove(&id);
                        bail!("Relay refused stream to {}: {}", request, reason);
                    }
                    Ok(Err(_)) => bail!("Tunnel closed before stream to {} opened", request),
                    Err(_) => {
                        self.forget(id);
                        bail!("Timed out opening stream to {}", request);
                    }
                }

                let (local, remote) = tokio::io::duplex(DUPLEX_BUFFER);
                tokio::spawn(pump_tcp(
                    id,
                    remote,
                    inbox,
                    self.cmd_tx.clone(),
                    self.streams.clone(),
                ));
                Ok(TunnelStream::Tcp(Box::new(local)))
            }
            Protocol::Udp => {
                let (delivery, remote) = UdpDelivery::pair(STREAM_CHANNEL_CAPACITY);
                tokio::spawn(pump_udp(
                    id,
                    remote,
                    opened_rx,
                    self.open_timeout,
                    inbox,
                    self.cmd_tx.clone(),
                    self.streams.clone(),
                ));
                Ok(TunnelStream::Udp(delivery))
            }
        }
    }

    async fn close(&self, code: u16, reason: &str) {
        let _ = self
            .cmd_tx
            .send(Command::Shutdown {
                code,
                reason: reason.to_string(),
            })
            .await;

        let mut status = self.status_rx.clone();
        let _ = status.wait_for(CarrierStatus::is_closed).await;
    }

    fn status(&self) -> watch::Receiver<CarrierStatus> {
        self.status_rx.clone()
    }
}

/// Pipe a local TCP handle to `Data` frames and back
async fn pump_tcp(
    id: StreamId,
    remote: DuplexStream,
    mut inbox: Inbox,
    cmd_tx: mpsc::Sender<Command>,
    streams: Streams,
) {
    let (mut rd, mut wr) = tokio::io::split(remote);
    let reset = inbox.reset.clone();

    let upstream = async {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = rd.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            let frame = Frame::Data {
                id,
                payload: Bytes::copy_from_slice(&buf[..n]),
            };
            if cmd_tx.send(Command::Send(frame)).await.is_err() {
                break;
            }
        }
        Ok::<_, std::io::Error>(())
    };

    let downstream = async {
        while let Some(chunk) = inbox.recv().await {
            wr.write_all(&chunk).await?;
        }
        wr.shutdown().await?;
        Ok::<_, std::io::Error>(())
    };

    tokio::select! {
        _ = reset.cancelled() => {
            debug!("Stream {} reset: local side not reading", id);
            return;
        }
        result = upstream => {
            if let Err(e) = result {
                trace!("Stream {} local read ended: {}", id, e);
            }
        }
        result = downstream => {
            if let Err(e) = result {
                trace!("Stream {} local write ended: {}", id, e);
            }
        }
    }

    if streams.remove(&id).is_some() {
        let _ = cmd_tx.send(Command::Send(Frame::Close { id })).await;
    }
}

/// Wait for the relay to accept a UDP stream, then pipe datagrams
async fn pump_udp(
    id: StreamId,
    mut remote: UdpDeliveryRemote,
    opened: oneshot::Receiver<Result<(), String>>,
    open_timeout: Duration,
    mut inbox: Inbox,
    cmd_tx: mpsc::Sender<Command>,
    streams: Streams,
) {
    match tokio::time::timeout(open_timeout, opened).await {
        Ok(Ok(Ok(()))) => remote.mark_ready(),
        Ok(Ok(Err(reason))) => {
            debug!("Relay refused UDP stream {}: {}", id, reason);
            streams.remove(&id);
            return;
        }
        _ => {
            if streams.remove(&id).is_some() {
                let _ = cmd_tx.send(Command::Send(Frame::Close { id })).await;
            }
            return;
        }
    }

    loop {
        tokio::select! {
            datagram = remote.from_client.recv() => match datagram {
                Some(payload) => {
                    if cmd_tx.send(Command::Send(Frame::Data { id, payload })).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            datagram = inbox.recv() => match datagram {
                Some(payload) => {
                    if remote.to_client.send(payload).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
        }
    }

    if streams.remove(&id).is_some() {
        let _ = cmd_tx.send(Command::Send(Frame::Close { id })).await;
    }
}

enum PumpEnd {
    Shutdown(Option<String>),
    Lost(String),
}

struct Driver<T: Transport> {
    conn: CarrierFramed<T::Stream>,
    cmd_rx: mpsc::Receiver<Command>,
    status_tx: watch::Sender<CarrierStatus>,
    streams: Streams,
    backlog: VecDeque<Frame>,
    transport: T,
    addr: RelayAddr,
    session: Digest,
    config: TunnelConfig,
}

impl<T: Transport> Driver<T> {
    async fn run(mut self) {
        let reason = loop {
            match self.pump().await {
                PumpEnd::Shutdown(reason) => break reason,
                PumpEnd::Lost(err) => {
                    let Some(grace) = self.config.keep_broken_tunnel() else {
                        break Some(err);
                    };
                    warn!("Carrier to {} lost: {}; reconnecting", self.addr, err);
                    self.status_tx.send_replace(CarrierStatus::Reconnecting);
                    match self.reconnect(grace).await {
                        Ok(conn) => {
                            info!("Carrier to {} restored", self.addr);
                            self.conn = conn;
                            self.status_tx.send_replace(CarrierStatus::Connected);
                        }
                        Err(e) => break Some(e),
                    }
                }
            }
        };

        // Dropping the slots ends every stream pump
        self.streams.clear();
        debug!(
            "Tunnel to {} closed: {}",
            self.addr,
            reason.as_deref().unwrap_or("no reason")
        );
        self.status_tx.send_replace(CarrierStatus::Closed(reason));
    }

    async fn send(&mut self, frame: &Frame) -> Result<()> {
        let buf = encode_frame(frame, self.config.deflate)?;
        self.conn.send(buf).await?;
        Ok(())
    }

    async fn pump(&mut self) -> PumpEnd {
        while let Some(frame) = self.backlog.pop_front() {
            if let Err(e) = self.send(&frame).await {
                self.backlog.push_front(frame);
                return PumpEnd::Lost(format!("{:#}", e));
            }
        }

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Send(frame)) => {
                        if let Err(e) = self.send(&frame).await {
                            self.backlog.push_back(frame);
                            return PumpEnd::Lost(format!("{:#}", e));
                        }
                    }
                    Some(Command::Shutdown { code, reason }) => {
                        let _ = self.send(&Frame::Shutdown { code, reason: reason.clone() }).await;
                        let _ = SinkExt::<Bytes>::close(&mut self.conn).await;
                        return PumpEnd::Shutdown(Some(reason));
                    }
                    None => {
                        let _ = SinkExt::<Bytes>::close(&mut self.conn).await;
                        return PumpEnd::Shutdown(None);
                    }
                },
                incoming = self.conn.next() => match incoming {
                    Some(Ok(buf)) => match decode_frame(&buf) {
                        Ok(frame) => {
                            if let Some(end) = self.dispatch(frame).await {
                                return end;
                            }
                        }
                        Err(e) => return PumpEnd::Lost(format!("{:#}", e)),
                    },
                    Some(Err(e)) => return PumpEnd::Lost(e.to_string()),
                    None => return PumpEnd::Lost("carrier closed by relay".to_string()),
                },
            }
        }
    }

    async fn dispatch(&mut self, frame: Frame) -> Option<PumpEnd> {
        match frame {
            Frame::OpenAck { id, error } => {
                let waiter = self
                    .streams
                    .get_mut(&id)
                    .and_then(|mut slot| slot.opened.take());
                let failed = error.is_some();
                if let Some(waiter) = waiter {
                    let _ = waiter.send(error.map_or(Ok(()), Err));
                }
                if failed {
                    self.streams.remove(&id);
                }
            }
            Frame::Data { id, payload } => {
                let offered = self
                    .streams
                    .get(&id)
                    .map(|slot| (slot.offer(payload), slot.protocol));
                match offered {
                    Some((Offer::Queued, _)) => {}
                    Some((Offer::Full, Protocol::Udp)) => {
                        trace!("Stream {} backlog full, datagram dropped", id)
                    }
                    Some((Offer::Full, Protocol::Tcp)) | Some((Offer::Gone, _)) => {
                        if let Err(e) = self.reset(id).await {
                            return Some(PumpEnd::Lost(format!("{:#}", e)));
                        }
                    }
                    None => trace!("Data for unknown stream {}", id),
                }
            }
            Frame::Close { id } => {
                self.streams.remove(&id);
            }
            Frame::Ping => {
                if let Err(e) = self.send(&Frame::Pong).await {
                    return Some(PumpEnd::Lost(format!("{:#}", e)));
                }
            }
            Frame::Pong => {}
            Frame::Shutdown { code, reason } => {
                return Some(PumpEnd::Shutdown(Some(format!(
                    "relay shutdown ({}): {}",
                    code, reason
                ))));
            }
            Frame::Open { id, .. } => warn!("Relay tried to open stream {}; ignored", id),
        }
        None
    }

    /// Drop a stream and tell the relay
    async fn reset(&mut self, id: StreamId) -> Result<()> {
        if let Some((_, slot)) = self.streams.remove(&id) {
            slot.reset.cancel();
            self.send(&Frame::Close { id }).await?;
        }
        Ok(())
    }

    /// Re-establish the carrier within `grace`, holding outgoing frames meanwhile
    async fn reconnect(&mut self, grace: Duration) -> Result<CarrierFramed<T::Stream>, String> {
        let deadline = Instant::now() + grace;
        let policy = ExponentialBackoff {
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(5),
            max_elapsed_time: Some(grace),
            ..Default::default()
        };

        let transport = &self.transport;
        let addr = &self.addr;
        let config = &self.config;
        let hello = &Hello::Resume {
            version: CURRENT_PROTO_VERSION,
            session: self.session,
        };

        let attempt = backoff::future::retry(policy, move || async move {
            match handshake(transport, addr, hello, config).await {
                Ok((conn, _)) => Ok(conn),
                // A refusal will not change on retry
                Err(e) if e.is::<Refused>() => {
                    debug!("Relay {} refused resume: {:#}", addr, e);
                    Err(backoff::Error::permanent(e))
                }
                Err(e) => {
                    debug!("Reconnect to {} failed: {:#}", addr, e);
                    Err(backoff::Error::transient(e))
                }
            }
        });
        tokio::pin!(attempt);

        loop {
            tokio::select! {
                result = &mut attempt => {
                    return result.map_err(|e| format!("reconnect failed: {:#}", e));
                }
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(Command::Send(frame)) => self.backlog.push_back(frame),
                    Some(Command::Shutdown { reason, .. }) => return Err(reason),
                    None => return Err("tunnel dropped".to_string()),
                },
                _ = tokio::time::sleep_until(deadline) => {
                    return Err(format!("carrier not restored within {:?}", grace));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{random_digest, read_hello};
    use crate::transport::TcpTransport;
    use tokio::net::{TcpListener, TcpStream};

    /// Accept one carrier, check credentials and echo every stream
    async fn echo_relay(listener: TcpListener, pass: &'static str) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = framed(stream);

        let user = match read_hello(&mut conn).await.unwrap() {
            Hello::Open { user, .. } => user,
            Hello::Resume { .. } => panic!("unexpected resume"),
        };
        let nonce = random_digest();
        write_message(&mut conn, &Challenge(nonce)).await.unwrap();
        let auth: Auth = read_message(&mut conn).await.unwrap();
        if auth != Auth::new(&user, pass, &nonce) {
            write_message(&mut conn, &Ack::AuthFailed).await.unwrap();
            return;
        }
        write_message(&mut conn, &Ack::Ok(random_digest())).await.unwrap();

        while let Some(Ok(buf)) = conn.next().await {
            let reply = match decode_frame(&buf).unwrap() {
                Frame::Open { id, .. } => Frame::OpenAck { id, error: None },
                Frame::Data { id, payload } => Frame::Data { id, payload },
                Frame::Ping => Frame::Pong,
                Frame::Shutdown { .. } => break,
                _ => continue,
            };
            conn.send(encode_frame(&reply, false).unwrap()).await.unwrap();
        }
    }

    /// Relay side of the handshake, answering with `ack`
    async fn accept_carrier(
        listener: &TcpListener,
        ack: Ack,
    ) -> (CarrierFramed<TcpStream>, Hello) {
        let (stream, _) = listener.accept().await.unwrap();
        let mut conn = framed(stream);
        let hello = read_hello(&mut conn).await.unwrap();
        write_message(&mut conn, &Challenge(random_digest()))
            .await
            .unwrap();
        let _: Auth = read_message(&mut conn).await.unwrap();
        write_message(&mut conn, &ack).await.unwrap();
        (conn, hello)
    }

    async fn next_frame(conn: &mut CarrierFramed<TcpStream>) -> Frame {
        let buf = conn.next().await.unwrap().unwrap();
        decode_frame(&buf).unwrap()
    }

    async fn relay_config(pass: &'static str) -> TunnelConfig {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(echo_relay(listener, "secret"));

        let mut config = TunnelConfig::new(addr.to_string());
        config.user = "alice".to_string();
        config.pass = pass.to_string();
        config
    }

    #[tokio::test]
    async fn test_tcp_stream_echo() {
        let config = relay_config("secret").await;
        let connector = MuxConnector::<TcpTransport>::new();
        let session = connector
            .connect(&config, SharingMode::Shared)
            .await
            .unwrap();

        let stream = session
            .open_stream(&StreamRequest::tcp("example.com", 80))
            .await
            .unwrap();
        let TunnelStream::Tcp(mut stream) = stream else {
            panic!("expected tcp stream");
        };

        stream.write_all(b"hello tunnel").await.unwrap();
        let mut buf = [0u8; 12];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello tunnel");

        session.close(1000, "Closing proxy").await;
        assert!(session.status().borrow().is_closed());
    }

    #[tokio::test]
    async fn test_udp_stream_becomes_ready() {
        let config = relay_config("secret").await;
        let connector = MuxConnector::<TcpTransport>::new();
        let session = connector
            .connect(&config, SharingMode::Exclusive)
            .await
            .unwrap();

        let stream = session
            .open_stream(&StreamRequest::udp("8.8.8.8", 53))
            .await
            .unwrap();
        let TunnelStream::Udp(mut delivery) = stream else {
            panic!("expected udp stream");
        };

        delivery.ready().await.unwrap();
        let (tx, mut rx) = delivery.into_parts();
        tx.send(Bytes::from_static(b"query")).await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), "query");
    }

    #[tokio::test]
    async fn test_stalled_reader_does_not_block_other_streams() {
        let config = relay_config("secret").await;
        let connector = MuxConnector::<TcpTransport>::new();
        let session = connector
            .connect(&config, SharingMode::Shared)
            .await
            .unwrap();

        let TunnelStream::Tcp(slow) = session
            .open_stream(&StreamRequest::tcp("slow.example", 80))
            .await
            .unwrap()
        else {
            panic!("expected tcp stream");
        };
        let TunnelStream::Tcp(mut fast) = session
            .open_stream(&StreamRequest::tcp("fast.example", 80))
            .await
            .unwrap()
        else {
            panic!("expected tcp stream");
        };

        // The echo comes back on `slow`, which is never read
        let (_slow_rd, mut slow_wr) = tokio::io::split(slow);
        let writer = tokio::spawn(async move {
            let bulk = vec![7u8; 32 * 1024 * 1024];
            slow_wr.write_all(&bulk).await
        });
        tokio::time::sleep(Duration::from_millis(200)).await;

        fast.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), fast.read_exact(&mut buf))
            .await
            .expect("fast stream stalled behind slow one")
            .unwrap();
        assert_eq!(&buf, b"hello");

        // Overflowing its backlog resets the slow stream
        let written = tokio::time::timeout(Duration::from_secs(10), writer)
            .await
            .unwrap()
            .unwrap();
        assert!(written.is_err());
        assert_eq!(*session.status().borrow(), CarrierStatus::Connected);
    }

    #[tokio::test]
    async fn test_wrong_password_is_refused() {
        let config = relay_config("wrong").await;
        let connector = MuxConnector::<TcpTransport>::new();
        let err = connector
            .connect(&config, SharingMode::Shared)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Incorrect credentials"));
    }

    #[tokio::test]
    async fn test_relay_disconnect_closes_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut conn = framed(stream);
            read_hello(&mut conn).await.unwrap();
            write_message(&mut conn, &Challenge(random_digest()))
                .await
                .unwrap();
            let _: Auth = read_message(&mut conn).await.unwrap();
            write_message(&mut conn, &Ack::Ok(random_digest()))
                .await
                .unwrap();
            // Carrier drops here
        });

        let config = TunnelConfig::new(addr.to_string());
        let connector = MuxConnector::<TcpTransport>::new();
        let session = connector
            .connect(&config, SharingMode::Shared)
            .await
            .unwrap();

        let mut status = session.status();
        let closed = status.wait_for(CarrierStatus::is_closed).await.unwrap();
        assert!(matches!(&*closed, CarrierStatus::Closed(Some(_))));
    }

    #[tokio::test]
    async fn test_resume_replays_backlog() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let session_id = random_digest();
        let (go_tx, go_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            let (mut conn, _) = accept_carrier(&listener, Ack::Ok(session_id)).await;
            let Frame::Open { id, .. } = next_frame(&mut conn).await else {
                panic!("expected open");
            };
            let ack = Frame::OpenAck { id, error: None };
            conn.send(encode_frame(&ack, false).unwrap()).await.unwrap();
            let echo = next_frame(&mut conn).await;
            conn.send(encode_frame(&echo, false).unwrap()).await.unwrap();
            drop(conn);

            // Hold the second carrier back until the client has queued data
            go_rx.await.unwrap();
            let (mut conn, hello) = accept_carrier(&listener, Ack::Ok(session_id)).await;
            match hello {
                Hello::Resume { session, .. } => assert_eq!(session, session_id),
                Hello::Open { .. } => panic!("expected resume"),
            }
            loop {
                match next_frame(&mut conn).await {
                    Frame::Data { id, payload } => {
                        let echo = Frame::Data { id, payload };
                        conn.send(encode_frame(&echo, false).unwrap()).await.unwrap();
                    }
                    Frame::Shutdown { .. } => break,
                    _ => {}
                }
            }
        });

        let mut config = TunnelConfig::new(addr.to_string());
        config.keep_broken_tunnel = 5;
        let connector = MuxConnector::<TcpTransport>::new();
        let session = connector
            .connect(&config, SharingMode::Shared)
            .await
            .unwrap();
        let TunnelStream::Tcp(mut stream) = session
            .open_stream(&StreamRequest::tcp("example.com", 80))
            .await
            .unwrap()
        else {
            panic!("expected tcp stream");
        };

        let mut buf = [0u8; 3];
        stream.write_all(b"one").await.unwrap();
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"one");

        let mut status = session.status();
        tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(|s| *s == CarrierStatus::Reconnecting),
        )
        .await
        .unwrap()
        .unwrap();

        stream.write_all(b"two").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        go_tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"two");
        assert_eq!(*session.status().borrow(), CarrierStatus::Connected);

        session.close(1000, "Closing proxy").await;
    }

    #[tokio::test]
    async fn test_unknown_session_ends_grace_early() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (conn, _) = accept_carrier(&listener, Ack::Ok(random_digest())).await;
            drop(conn);
            let (_conn, hello) = accept_carrier(&listener, Ack::UnknownSession).await;
            assert!(matches!(hello, Hello::Resume { .. }));
            // Any further attempt would hang here until the grace period ran out
            std::future::pending::<()>().await;
        });

        let mut config = TunnelConfig::new(addr.to_string());
        config.keep_broken_tunnel = 30;
        let connector = MuxConnector::<TcpTransport>::new();
        let session = connector
            .connect(&config, SharingMode::Shared)
            .await
            .unwrap();

        let mut status = session.status();
        let closed = tokio::time::timeout(
            Duration::from_secs(5),
            status.wait_for(CarrierStatus::is_closed),
        )
        .await
        .expect("refused resume kept retrying")
        .unwrap();
        match &*closed {
            CarrierStatus::Closed(Some(reason)) => assert!(reason.contains("Unknown session")),
            other => panic!("unexpected status {:?}", other),
        }
    }
}
