//! Wire messages and `Content-Length` framing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DapError;
use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProtocolMessage {
    Request(Request),
    Response(Response),
    Event(Event),
}

impl ProtocolMessage {
    pub fn seq(&self) -> u64 {
        match self {
            Self::Request(r) => r.seq,
            Self::Response(r) => r.seq,
            Self::Event(e) => e.seq,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub seq: u64,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub seq: u64,
    pub request_seq: u64,
    pub command: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Response {
    /// Human-readable failure reason: the adapter's formatted error body
    /// when present, else the short `message`.
    pub fn error_message(&self) -> String {
        let formatted = self
            .body
            .as_ref()
            .and_then(|b| b.get("error"))
            .and_then(|e| e.get("format"))
            .and_then(Value::as_str);
        formatted
            .or(self.message.as_deref())
            .unwrap_or("unknown adapter error")
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default)]
    pub seq: u64,
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

/// Largest body accepted from an adapter.
pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// Reads one framed message. Header names are case-insensitive and
/// unknown headers are skipped.
pub async fn read_message<R>(reader: &mut R) -> Result<ProtocolMessage>
where
    R: AsyncBufRead + Unpin,
{
    let frame = read_frame(reader).await?;
    decode_message(&frame)
}

/// Reads the raw body of one framed message without decoding it.
pub async fn read_frame<R>(reader: &mut R) -> Result<Vec<u8>>
where
    R: AsyncBufRead + Unpin,
{
    let mut content_length: Option<usize> = None;

    loop {
        let mut line = String::new();
        let bytes_read = reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Err(DapError::TransportClosed);
        }

        let trimmed = line.trim_end_matches(&['\r', '\n'][..]);
        if trimmed.is_empty() {
            if content_length.is_some() {
                break;
            }
            continue;
        }

        if let Some((key, value)) = trimmed.split_once(':') {
            if key.trim().eq_ignore_ascii_case("content-length") {
                let parsed = value.trim().parse::<usize>().map_err(|e| {
                    DapError::Protocol(format!("invalid Content-Length value: {e}"))
                })?;
                content_length = Some(parsed);
            }
        }
    }

    let length = content_length
        .ok_or_else(|| DapError::Protocol("missing required Content-Length header".into()))?;
    if length > MAX_MESSAGE_SIZE {
        return Err(DapError::Protocol(format!(
            "Content-Length {length} exceeds the {MAX_MESSAGE_SIZE} byte limit"
        )));
    }

    let mut body = Vec::with_capacity(length.min(64 * 1024));
    let read = (&mut *reader)
        .take(length as u64)
        .read_to_end(&mut body)
        .await?;
    if read < length {
        return Err(DapError::TransportClosed);
    }
    Ok(body)
}

pub fn decode_message(frame: &[u8]) -> Result<ProtocolMessage> {
    Ok(serde_json::from_slice(frame)?)
}

pub async fn write_message<W>(writer: &mut W, message: &ProtocolMessage) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let body = serde_json::to_vec(message)?;
    let header = format!("Content-Length: {}\r\n\r\n", body.len());
    writer.write_all(header.as_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}
