//! Form-feed framed JSON, shared by the socket brokers.
//!
//! A frame is one compact JSON document followed by a single `\f` (0x0C).
//! Form feed never appears unescaped inside JSON text, so it can delimit
//! documents on a raw byte stream.
//!
//! ```text
//! → {"type":"getAccessToken","data":{"scopes":"499b84ac-1321-427f-aa17-267ca6975798/.default"}}\f
//! ← {"type":"accessToken","data":"eyJ0eXAi..."}\f
//! ← {"type":"error","error":"Failed to get access token: ..."}\f
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Frame terminator.
pub const FRAME_DELIMITER: u8 = 0x0c;

/// Largest accepted frame body, delimiter excluded.
pub const MAX_FRAME_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame exceeds {0} bytes")]
    TooLarge(usize),
    #[error("connection closed mid-frame ({0} bytes buffered)")]
    Truncated(usize),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read one frame body (delimiter stripped).
///
/// Returns `Ok(None)` on a clean EOF between frames.
pub async fn read_frame<R>(reader: &mut R, max_bytes: usize) -> Result<Option<Vec<u8>>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX).saturating_add(1);
    let n = reader
        .take(limit)
        .read_until(FRAME_DELIMITER, &mut buf)
        .await?;

    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&FRAME_DELIMITER) {
        buf.pop();
        return Ok(Some(buf));
    }
    if buf.len() > max_bytes {
        return Err(FrameError::TooLarge(max_bytes));
    }
    Err(FrameError::Truncated(buf.len()))
}

/// Serialize `msg` as one frame and flush it.
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(msg)?;
    bytes.push(FRAME_DELIMITER);
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

/// Scope used when a token request names none.
pub const DEFAULT_SCOPE: &str = "499b84ac-1321-427f-aa17-267ca6975798/.default";

/// Requests understood by the credential broker.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type")]
pub enum BrokerRequest {
    #[serde(rename = "getAccessToken")]
    GetAccessToken {
        #[serde(default)]
        data: TokenRequestData,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TokenRequestData {
    /// Space-separated scopes.
    #[serde(default)]
    pub scopes: Option<String>,
}

impl TokenRequestData {
    /// Requested scopes, or [`DEFAULT_SCOPE`] when absent or blank.
    pub fn scope_list(&self) -> Vec<String> {
        let scopes: Vec<String> = self
            .scopes
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(ToString::to_string)
            .collect();
        if scopes.is_empty() {
            vec![DEFAULT_SCOPE.to_string()]
        } else {
            scopes
        }
    }
}

/// Responses written by the credential broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum BrokerResponse {
    #[serde(rename = "accessToken")]
    AccessToken { data: String },
    #[serde(rename = "error")]
    Error { error: String },
}

impl BrokerResponse {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            error: message.into(),
        }
    }
}

/// Why a frame could not be turned into a [`BrokerRequest`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("invalid JSON")]
    NotJson,
    #[error("missing message type")]
    MissingType,
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("malformed {0} request: {1}")]
    Malformed(String, String),
}

/// Decode a frame body: check the `type` discriminator first, then decode
/// the full variant.
pub fn decode_request(body: &[u8]) -> Result<BrokerRequest, RequestError> {
    let value: Value = serde_json::from_slice(body).map_err(|_| RequestError::NotJson)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(RequestError::MissingType)?
        .to_string();
    if kind != "getAccessToken" {
        return Err(RequestError::UnknownType(kind));
    }
    BrokerRequest::deserialize(value).map_err(|e| RequestError::Malformed(kind, e.to_string()))
}
