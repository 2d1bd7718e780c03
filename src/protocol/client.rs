//! Host side of the sandbox protocol
//!
//! One persistent TCP connection per sandbox. Requests are strictly
//! sequential; callers serialize access (the sandbox backend holds the
//! client behind a mutex).

use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{read_frame, write_frame, Op, ProtocolError, Request, Response};

#[derive(Debug)]
pub struct ProtocolClient {
    addr: SocketAddr,
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl ProtocolClient {
    /// Open a connection to the in-sandbox server
    ///
    /// # Arguments
    /// * `addr` - Published address of the server
    /// * `connect_timeout` - Bound on the TCP handshake
    pub async fn connect(addr: SocketAddr, connect_timeout: Duration) -> Result<Self, ProtocolError> {
        let stream = timeout(connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ProtocolError::Timeout(connect_timeout))??;
        stream.set_nodelay(true)?;
        let (read, write) = stream.into_split();
        debug!(addr = %addr, "Connected to sandbox server");
        Ok(Self {
            addr,
            reader: BufReader::new(read),
            writer: write,
        })
    }

    /// Connect with retry logic for when the server may still be starting
    ///
    /// # Arguments
    /// * `addr` - Published address of the server
    /// * `max_retries` - Maximum number of connection attempts
    /// * `retry_delay_ms` - Delay between retries in milliseconds
    pub async fn connect_with_retry(
        addr: SocketAddr,
        max_retries: u32,
        retry_delay_ms: u64,
    ) -> Result<Self, ProtocolError> {
        let mut last_error = None;

        for attempt in 0..max_retries {
            match Self::connect(addr, Duration::from_secs(2)).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    if attempt == 0 {
                        debug!(addr = %addr, error = %e, "Sandbox server not reachable yet");
                    }
                    last_error = Some(e);
                    if attempt + 1 < max_retries {
                        tokio::time::sleep(Duration::from_millis(retry_delay_ms)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| ProtocolError::Io("max retries reached".to_string())))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Send one request and wait for its response
    ///
    /// A deadline or transport error leaves the connection in an unknown
    /// position; the caller must drop the client afterwards.
    pub async fn call(&mut self, request: &Request, deadline: Duration) -> Result<Response, ProtocolError> {
        let addr = self.addr;
        let exchange = async {
            write_frame(&mut self.writer, request).await?;
            match read_frame::<_, Response>(&mut self.reader).await? {
                Some(response) => Ok(response),
                None => Err(ProtocolError::Closed),
            }
        };
        let result = timeout(deadline, exchange).await;
        match result {
            Ok(result) => result,
            Err(_) => {
                warn!(addr = %addr, op = %request.op, "Sandbox request timed out");
                Err(ProtocolError::Timeout(deadline))
            }
        }
    }

    /// Typed request: encode `args`, decode `data`
    pub async fn request<A, T>(&mut self, op: Op, args: &A, deadline: Duration) -> Result<T, ProtocolError>
    where
        A: Serialize,
        T: DeserializeOwned,
    {
        let request = Request::new(op, args)?;
        self.call(&request, deadline).await?.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::process::ExecLimits;
    use crate::backend::ExecOutput;
    use crate::protocol::{ExecArgs, ReadArgs, SandboxServer, WriteArgs};
    use tokio::net::TcpListener;

    async fn spawn_server(root: &std::path::Path) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = SandboxServer::new(
            root,
            ExecLimits {
                timeout: Duration::from_secs(10),
                max_output_bytes: 4096,
            },
            100,
        );
        tokio::spawn(async move { server.serve(listener).await });
        addr
    }

    #[tokio::test]
    async fn test_round_trips_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let addr = spawn_server(dir.path()).await;
        let mut client = ProtocolClient::connect_with_retry(addr, 5, 50).await.unwrap();
        let deadline = Duration::from_secs(5);

        client
            .request::<_, ()>(
                Op::Write,
                &WriteArgs {
                    path: "notes/a.txt".into(),
                    content: "alpha\nbeta\n".into(),
                },
                deadline,
            )
            .await
            .unwrap();
        let text: String = client
            .request(
                Op::Read,
                &ReadArgs {
                    path: "notes/a.txt".into(),
                    offset: Some(1),
                    limit: Some(1),
                },
                deadline,
            )
            .await
            .unwrap();
        assert_eq!(text, "beta");

        let out: ExecOutput = client
            .request(
                Op::Exec,
                &ExecArgs {
                    command: "cat notes/a.txt | wc -l".into(),
                    workdir: None,
                    timeout_secs: None,
                },
                deadline,
            )
            .await
            .unwrap();
        assert_eq!(out.stdout.trim(), "2");
    }

    #[tokio::test]
    async fn test_operation_error_is_not_transport() {
        let dir = tempfile::tempdir().unwrap();
        let addr = spawn_server(dir.path()).await;
        let mut client = ProtocolClient::connect(addr, Duration::from_secs(2)).await.unwrap();
        let err = client
            .request::<_, String>(
                Op::Read,
                &ReadArgs {
                    path: "missing.txt".into(),
                    offset: None,
                    limit: None,
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(!err.is_transport());
    }

    #[tokio::test]
    async fn test_refused_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = ProtocolClient::connect_with_retry(addr, 2, 10).await.unwrap_err();
        assert!(err.is_transport());
    }
}
