//! JSON-lines framing for control commands
//!
//! ```text
//! -> {"id":1,"action":"startSocks","host":"127.0.0.1","port":1080}
//! <- {"id":1,"error":null}
//! -> {"id":2,"action":"closeSocks"}
//! <- {"id":2,"error":"socks server is not running"}
//! ```

use crate::context::AppContext;
use anyhow::Result;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec, LinesCodecError};
use tracing::{debug, warn};

/// Longest accepted command line
const MAX_LINE_LENGTH: usize = 64 * 1024;

/// One command from the supervisor
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlRequest {
    /// Echoed back in the response
    #[serde(default)]
    pub id: Value,
    /// `startSocks` or `closeSocks`
    pub action: String,
    /// Listen host for `startSocks`
    #[serde(default)]
    pub host: Option<String>,
    /// Listen port for `startSocks`
    #[serde(default)]
    pub port: Option<u16>,
}

/// Answer to one command; `error` is null on success
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ControlResponse {
    /// Id of the request
    pub id: Value,
    /// Failure message
    pub error: Option<String>,
}

impl ControlResponse {
    fn new(id: Value, result: Result<(), String>) -> Self {
        ControlResponse {
            id,
            error: result.err(),
        }
    }
}

async fn dispatch(ctx: &AppContext, request: ControlRequest) -> ControlResponse {
    debug!("control: {} (id {})", request.action, request.id);
    let result = match request.action.as_str() {
        "startSocks" => ctx
            .start_socks(request.host, request.port)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string()),
        "closeSocks" => ctx.close_socks().await.map_err(|e| e.to_string()),
        other => Err(format!("unknown action: {}", other)),
    };
    ControlResponse::new(request.id, result)
}

async fn handle_line(ctx: &AppContext, line: &str) -> ControlResponse {
    let value: Value = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return ControlResponse::new(Value::Null, Err(format!("invalid command: {}", e))),
    };
    let id = value.get("id").cloned().unwrap_or(Value::Null);

    match serde_json::from_value::<ControlRequest>(value) {
        Ok(request) => dispatch(ctx, request).await,
        Err(e) => ControlResponse::new(id, Err(format!("invalid command: {}", e))),
    }
}

/// Answer commands read from `reader` on `writer` until EOF
pub async fn serve<R, W>(ctx: &AppContext, reader: R, writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_LINE_LENGTH));
    let mut responses = FramedWrite::new(writer, LinesCodec::new());

    while let Some(line) = lines.next().await {
        let response = match line {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => handle_line(ctx, &line).await,
            Err(LinesCodecError::MaxLineLengthExceeded) => {
                warn!("control: command line too long");
                ControlResponse::new(Value::Null, Err("command too long".to_string()))
            }
            Err(LinesCodecError::Io(e)) => return Err(e.into()),
        };
        responses.send(serde_json::to_string(&response)?).await?;
    }

    debug!("control: input closed");
    Ok(())
}
