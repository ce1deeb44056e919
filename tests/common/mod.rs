//! Test utilities and mocks for Tunsocks
//!
//! A mock relay that speaks the carrier protocol and really connects to
//! the requested targets, local echo servers to aim at, a connector that
//! always fails, and SOCKS5 client helpers.

#![allow(dead_code)]

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tunsocks::config::{ProxyConfig, TunnelConfig};
use tunsocks::protocol::{
    decode_frame, encode_frame, framed, random_digest, read_hello, read_message, write_message,
    Ack, Auth, Challenge, Frame, Hello, Protocol, SharingMode, StreamId,
};
use tunsocks::socks::{encode_udp_packet, parse_udp_header, TargetAddr};
use tunsocks::tunnel::{Connector, TunnelSession};

pub const RELAY_USER: &str = "alice";
pub const RELAY_PASS: &str = "secret";

/// Relay accepting any number of carriers
pub struct MockRelay {
    pub addr: SocketAddr,
    carriers: Arc<AtomicUsize>,
    modes: Arc<parking_lot::Mutex<Vec<SharingMode>>>,
}

impl MockRelay {
    /// Start a relay on an ephemeral loopback port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let carriers = Arc::new(AtomicUsize::new(0));
        let modes = Arc::new(parking_lot::Mutex::new(Vec::new()));

        tokio::spawn({
            let carriers = carriers.clone();
            let modes = modes.clone();
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    carriers.fetch_add(1, Ordering::SeqCst);
                    let modes = modes.clone();
                    tokio::spawn(async move {
                        let _ = serve_carrier(stream, modes).await;
                    });
                }
            }
        });

        MockRelay {
            addr,
            carriers,
            modes,
        }
    }

    /// Carriers accepted so far
    pub fn carriers(&self) -> usize {
        self.carriers.load(Ordering::SeqCst)
    }

    /// Sharing modes announced by the carriers, in order
    pub fn modes(&self) -> Vec<SharingMode> {
        self.modes.lock().clone()
    }

    /// Tunnel settings pointing at this relay
    pub fn tunnel_config(&self) -> TunnelConfig {
        let mut config = TunnelConfig::new(self.addr.to_string());
        config.user = RELAY_USER.to_string();
        config.pass = RELAY_PASS.to_string();
        config
    }

    /// Proxy profile pointing at this relay
    pub fn proxy_config(&self, name: &str) -> ProxyConfig {
        ProxyConfig::new(name, self.tunnel_config())
    }
}

async fn serve_carrier(
    stream: TcpStream,
    modes: Arc<parking_lot::Mutex<Vec<SharingMode>>>,
) -> anyhow::Result<()> {
    let mut conn = framed(stream);

    let hello = read_hello(&mut conn).await?;
    let nonce = random_digest();
    write_message(&mut conn, &Challenge(nonce)).await?;
    let auth: Auth = read_message(&mut conn).await?;

    // Sessions do not outlive their carrier here
    let user = match hello {
        Hello::Open { user, mode, .. } => {
            modes.lock().push(mode);
            user
        }
        Hello::Resume { .. } => {
            write_message(&mut conn, &Ack::UnknownSession).await?;
            return Ok(());
        }
    };
    if user != RELAY_USER || auth != Auth::new(&user, RELAY_PASS, &nonce) {
        write_message(&mut conn, &Ack::AuthFailed).await?;
        return Ok(());
    }
    write_message(&mut conn, &Ack::Ok(random_digest())).await?;

    let (mut sink, mut source) = conn.split::<Bytes>();
    let (out_tx, mut out_rx) = mpsc::channel::<Frame>(64);
    tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(buf) = encode_frame(&frame, false) else {
                break;
            };
            if sink.send(buf).await.is_err() {
                break;
            }
        }
    });

    let mut streams: HashMap<StreamId, mpsc::Sender<Bytes>> = HashMap::new();
    while let Some(Ok(buf)) = source.next().await {
        match decode_frame(&buf)? {
            Frame::Open {
                id,
                protocol: Protocol::Tcp,
                addr,
                port,
            } => match TcpStream::connect((addr.as_str(), port)).await {
                Ok(target) => {
                    let (tx, rx) = mpsc::channel(64);
                    streams.insert(id, tx);
                    out_tx.send(Frame::OpenAck { id, error: None }).await?;
                    tokio::spawn(pump_tcp(id, target, rx, out_tx.clone()));
                }
                Err(e) => {
                    out_tx
                        .send(Frame::OpenAck {
                            id,
                            error: Some(e.to_string()),
                        })
                        .await?;
                }
            },
            Frame::Open {
                id,
                protocol: Protocol::Udp,
                ..
            } => {
                let socket = UdpSocket::bind("127.0.0.1:0").await?;
                let (tx, rx) = mpsc::channel(64);
                streams.insert(id, tx);
                out_tx.send(Frame::OpenAck { id, error: None }).await?;
                tokio::spawn(pump_udp(id, socket, rx, out_tx.clone()));
            }
            Frame::Data { id, payload } => {
                if let Some(tx) = streams.get(&id) {
                    let _ = tx.send(payload).await;
                }
            }
            Frame::Close { id } => {
                streams.remove(&id);
            }
            Frame::Ping => out_tx.send(Frame::Pong).await?,
            Frame::Shutdown { .. } => break,
            _ => {}
        }
    }
    Ok(())
}

async fn pump_tcp(
    id: StreamId,
    mut target: TcpStream,
    mut inbound: mpsc::Receiver<Bytes>,
    out_tx: mpsc::Sender<Frame>,
) {
    let mut buf = vec![0u8; 16 * 1024];
    loop {
        tokio::select! {
            chunk = inbound.recv() => match chunk {
                Some(chunk) => {
                    if target.write_all(&chunk).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            read = target.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let payload = Bytes::copy_from_slice(&buf[..n]);
                    if out_tx.send(Frame::Data { id, payload }).await.is_err() {
                        break;
                    }
                }
            },
        }
    }
    let _ = out_tx.send(Frame::Close { id }).await;
}

/// Datagrams arrive SOCKS5-encapsulated and leave the same way
async fn pump_udp(
    id: StreamId,
    socket: UdpSocket,
    mut inbound: mpsc::Receiver<Bytes>,
    out_tx: mpsc::Sender<Frame>,
) {
    let mut buf = vec![0u8; 65535];
    loop {
        tokio::select! {
            frame = inbound.recv() => match frame {
                Some(frame) => {
                    let Ok(header) = parse_udp_header(&frame) else {
                        continue;
                    };
                    if let TargetAddr::Ip(target) = header.addr {
                        let _ = socket.send_to(&frame[header.len..], target).await;
                    }
                }
                None => break,
            },
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, from)) => {
                    // Non-zero RSV/FRAG to check the bridge resets them
                    let mut frame = encode_udp_packet(&TargetAddr::from(from), &buf[..n]);
                    frame[0] = 0xFF;
                    frame[2] = 0xFF;
                    let payload = Bytes::from(frame);
                    if out_tx.send(Frame::Data { id, payload }).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }
    let _ = out_tx.send(Frame::Close { id }).await;
}

/// Connector whose tunnels never come up
#[derive(Debug, Default)]
pub struct FailingConnector {
    pub attempts: AtomicUsize,
}

#[async_trait]
impl Connector for FailingConnector {
    async fn connect(
        &self,
        _config: &TunnelConfig,
        _mode: SharingMode,
    ) -> anyhow::Result<Arc<dyn TunnelSession>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        bail!("relay unreachable")
    }
}

/// TCP echo server on an ephemeral port
pub async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// UDP echo server on an ephemeral port
pub async fn start_udp_echo() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 65535];
        while let Ok((n, from)) = socket.recv_from(&mut buf).await {
            let _ = socket.send_to(&buf[..n], from).await;
        }
    });
    addr
}

async fn socks_handshake(proxy: SocketAddr) -> TcpStream {
    let mut stream = TcpStream::connect(proxy).await.unwrap();
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    stream.read_exact(&mut method).await.unwrap();
    assert_eq!(method, [0x05, 0x00]);
    stream
}

async fn read_reply(stream: &mut TcpStream) -> (u8, SocketAddr) {
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await.unwrap();
    let addr = match head[3] {
        0x01 => {
            let mut ip = [0u8; 4];
            stream.read_exact(&mut ip).await.unwrap();
            SocketAddr::from((ip, stream.read_u16().await.unwrap()))
        }
        0x04 => {
            let mut ip = [0u8; 16];
            stream.read_exact(&mut ip).await.unwrap();
            SocketAddr::from((ip, stream.read_u16().await.unwrap()))
        }
        other => panic!("unexpected reply address type {}", other),
    };
    (head[1], addr)
}

/// CONNECT through the proxy; returns the stream and the reply code
pub async fn socks_connect(proxy: SocketAddr, target: &TargetAddr) -> (TcpStream, u8) {
    let mut stream = socks_handshake(proxy).await;
    let mut request = vec![0x05, 0x01, 0x00];
    target.write_to(&mut request);
    stream.write_all(&request).await.unwrap();
    let (code, _) = read_reply(&mut stream).await;
    (stream, code)
}

/// UDP ASSOCIATE; returns the control stream, reply code and relay address
pub async fn socks_udp_associate(proxy: SocketAddr) -> (TcpStream, u8, SocketAddr) {
    let mut stream = socks_handshake(proxy).await;
    let mut request = vec![0x05, 0x03, 0x00];
    TargetAddr::from(SocketAddr::from(([0, 0, 0, 0], 0))).write_to(&mut request);
    stream.write_all(&request).await.unwrap();
    let (code, addr) = read_reply(&mut stream).await;
    (stream, code, addr)
}

/// Send `msg` and expect it back
pub async fn assert_echo(stream: &mut TcpStream, msg: &[u8]) {
    stream.write_all(msg).await.unwrap();
    let mut buf = vec![0u8; msg.len()];
    tokio::time::timeout(Duration::from_secs(5), stream.read_exact(&mut buf))
        .await
        .expect("echo timed out")
        .unwrap();
    assert_eq!(buf, msg);
}

/// Poll `check` until it holds or five seconds pass
pub async fn wait_until<F: Fn() -> bool>(check: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
