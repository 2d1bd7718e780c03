//! Sandbox protocol - newline-delimited JSON between host and sandbox
//!
//! Every frame is one JSON object terminated by `\n`.
//!
//! ```text
//! host ──► {"op":"read","args":{"path":"src/main.rs"}}\n
//! host ◄── {"ok":true,"data":"fn main() {}\n"}\n
//! host ──► {"op":"edit","args":{"path":"a.txt","old_text":"x","new_text":"y"}}\n
//! host ◄── {"ok":false,"error":"old_text not found in a.txt"}\n
//! ```
//!
//! One request is in flight per connection. The server handles one
//! connection at a time.

pub mod client;
pub mod server;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use client::ProtocolClient;
pub use server::SandboxServer;

/// Default TCP port of the in-sandbox server
pub const DEFAULT_PORT: u16 = 7070;

/// Largest accepted frame, newline included
pub const MAX_FRAME_BYTES: usize = 32 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Op {
    Ls,
    Read,
    Write,
    Edit,
    Glob,
    Grep,
    Exec,
}

impl Op {
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Ls => "ls",
            Op::Read => "read",
            Op::Write => "write",
            Op::Edit => "edit",
            Op::Glob => "glob",
            Op::Grep => "grep",
            Op::Exec => "exec",
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub op: Op,
    #[serde(default)]
    pub args: Value,
}

impl Request {
    pub fn new<A: Serialize>(op: Op, args: &A) -> Result<Self, ProtocolError> {
        Ok(Self {
            op,
            args: serde_json::to_value(args).map_err(|e| ProtocolError::Codec(e.to_string()))?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Response {
    pub fn success(data: Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }

    /// Decode the payload, turning `ok: false` into [`ProtocolError::Operation`]
    pub fn into_result<T: DeserializeOwned>(self) -> Result<T, ProtocolError> {
        if !self.ok {
            return Err(ProtocolError::Operation(
                self.error.unwrap_or_else(|| "operation failed".to_string()),
            ));
        }
        serde_json::from_value(self.data.unwrap_or(Value::Null))
            .map_err(|e| ProtocolError::Codec(format!("unexpected response payload: {}", e)))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LsArgs {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadArgs {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteArgs {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditArgs {
    pub path: String,
    pub old_text: String,
    pub new_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobArgs {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GrepArgs {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub glob: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecArgs {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Error)]
pub enum ProtocolError {
    #[error("connection error: {0}")]
    Io(String),
    #[error("connection closed by peer")]
    Closed,
    #[error("timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("malformed frame: {0}")]
    Codec(String),
    /// The server executed the request and reported a failure
    #[error("{0}")]
    Operation(String),
}

impl ProtocolError {
    /// Whether the channel itself failed, as opposed to the operation
    pub fn is_transport(&self) -> bool {
        !matches!(self, ProtocolError::Operation(_))
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(e: std::io::Error) -> Self {
        ProtocolError::Io(e.to_string())
    }
}

/// Read one frame; `Ok(None)` on a clean end of stream
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = Vec::new();
    let n = (&mut *reader)
        .take(MAX_FRAME_BYTES as u64 + 1)
        .read_until(b'\n', &mut buf)
        .await?;
    if n == 0 {
        return Ok(None);
    }
    if buf.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::Codec(format!(
            "frame exceeds {} bytes",
            MAX_FRAME_BYTES
        )));
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    serde_json::from_slice(&buf)
        .map(Some)
        .map_err(|e| ProtocolError::Codec(e.to_string()))
}

/// Write one frame and flush it
pub async fn write_frame<W, T>(writer: &mut W, frame: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut bytes = serde_json::to_vec(frame).map_err(|e| ProtocolError::Codec(e.to_string()))?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    #[test]
    fn test_request_wire_shape() {
        let request = Request::new(
            Op::Edit,
            &EditArgs {
                path: "a.txt".into(),
                old_text: "x".into(),
                new_text: "y".into(),
            },
        )
        .unwrap();
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            json!({"op": "edit", "args": {"path": "a.txt", "old_text": "x", "new_text": "y"}})
        );
    }

    #[test]
    fn test_response_wire_shape() {
        let json = serde_json::to_string(&Response::failure("nope")).unwrap();
        assert_eq!(json, r#"{"ok":false,"error":"nope"}"#);
        let json = serde_json::to_string(&Response::success(json!(null))).unwrap();
        assert_eq!(json, r#"{"ok":true,"data":null}"#);
    }

    #[test]
    fn test_into_result() {
        let text: String = Response::success(json!("hi")).into_result().unwrap();
        assert_eq!(text, "hi");
        Response::success(json!(null)).into_result::<()>().unwrap();
        let err = Response::failure("bad").into_result::<String>().unwrap_err();
        assert!(!err.is_transport());
        assert_eq!(err.to_string(), "bad");
    }

    #[tokio::test]
    async fn test_frames_split_on_newlines() {
        let mut wire = Vec::new();
        write_frame(&mut wire, &Response::success(json!("line\nbreak"))).await.unwrap();
        write_frame(&mut wire, &Response::failure("second")).await.unwrap();
        // Embedded newlines are escaped, so each frame is one line
        assert_eq!(wire.iter().filter(|b| **b == b'\n').count(), 2);

        let mut reader = BufReader::new(wire.as_slice());
        let first: Response = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(first.data, Some(json!("line\nbreak")));
        let second: Response = read_frame(&mut reader).await.unwrap().unwrap();
        assert_eq!(second.error.as_deref(), Some("second"));
        let end: Option<Response> = read_frame(&mut reader).await.unwrap();
        assert!(end.is_none());
    }

    #[tokio::test]
    async fn test_malformed_frame() {
        let mut reader = BufReader::new(&b"{not json}\n"[..]);
        let err = read_frame::<_, Request>(&mut reader).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Codec(_)));
    }
}
