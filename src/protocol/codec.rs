//! Carrier framing
//!
//! Every message is a length-delimited frame holding a bincode payload.
//! After the handshake, [`Frame`]s carry a one-byte prefix telling whether
//! the rest is deflated.

use super::types::{Frame, Hello, CURRENT_PROTO_VERSION};
use anyhow::{anyhow, bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::trace;

/// Largest frame accepted on the carrier
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Payloads shorter than this are never compressed
const DEFLATE_THRESHOLD: usize = 256;

const FLAG_PLAIN: u8 = 0;
const FLAG_DEFLATE: u8 = 1;

/// Framed carrier connection
pub type CarrierFramed<S> = Framed<S, LengthDelimitedCodec>;

/// Wrap a carrier stream in the length-delimited codec
pub fn framed<S: AsyncRead + AsyncWrite>(stream: S) -> CarrierFramed<S> {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec();
    Framed::new(stream, codec)
}

/// Write one handshake message
pub async fn write_message<S, T>(conn: &mut CarrierFramed<S>, msg: &T) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: Serialize,
{
    let buf = bincode::serialize(msg).with_context(|| "Failed to serialize message")?;
    conn.send(Bytes::from(buf))
        .await
        .with_context(|| "Failed to write message")?;
    Ok(())
}

/// Read one handshake message
pub async fn read_message<S, T>(conn: &mut CarrierFramed<S>) -> Result<T>
where
    S: AsyncRead + AsyncWrite + Unpin,
    T: DeserializeOwned,
{
    let buf = conn
        .next()
        .await
        .ok_or_else(|| anyhow!("Carrier closed during handshake"))?
        .with_context(|| "Failed to read message")?;
    bincode::deserialize(&buf).with_context(|| "Failed to deserialize message")
}

/// Read a [`Hello`] and check its protocol version
pub async fn read_hello<S>(conn: &mut CarrierFramed<S>) -> Result<Hello>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let hello: Hello = read_message(conn).await?;
    if hello.version() != CURRENT_PROTO_VERSION {
        bail!(
            "Protocol version mismatched. Expected {}, got {}.",
            CURRENT_PROTO_VERSION,
            hello.version()
        );
    }
    Ok(hello)
}

/// Encode a [`Frame`], deflating large payloads when `deflate` is set
pub fn encode_frame(frame: &Frame, deflate: bool) -> Result<Bytes> {
    let raw = bincode::serialize(frame).with_context(|| "Failed to serialize frame")?;

    let mut out = BytesMut::with_capacity(raw.len() + 1);
    if deflate && raw.len() >= DEFLATE_THRESHOLD {
        let mut encoder = DeflateEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::fast());
        encoder.write_all(&raw)?;
        let compressed = encoder.finish()?;
        if compressed.len() < raw.len() {
            out.put_u8(FLAG_DEFLATE);
            out.extend_from_slice(&compressed);
            trace!("Deflated frame {} -> {} bytes", raw.len(), compressed.len());
            return Ok(out.freeze());
        }
    }

    out.put_u8(FLAG_PLAIN);
    out.extend_from_slice(&raw);
    Ok(out.freeze())
}

/// Decode a [`Frame`] produced by [`encode_frame`]
pub fn decode_frame(buf: &[u8]) -> Result<Frame> {
    let (flag, body) = buf
        .split_first()
        .ok_or_else(|| anyhow!("Empty frame"))?;

    match *flag {
        FLAG_PLAIN => bincode::deserialize(body).with_context(|| "Failed to deserialize frame"),
        FLAG_DEFLATE => {
            let mut raw = Vec::with_capacity(body.len() * 2);
            DeflateDecoder::new(body)
                .take(MAX_FRAME_LEN as u64 * 4)
                .read_to_end(&mut raw)
                .with_context(|| "Failed to inflate frame")?;
            bincode::deserialize(&raw).with_context(|| "Failed to deserialize frame")
        }
        other => bail!("Unknown frame flag: {}", other),
    }
}
