//! In-sandbox protocol server
//!
//! Runs inside the container (see the `sandbox_agent` binary) and serves
//! filesystem and exec requests against the sandbox's working directory. The
//! same dispatch is used for one-shot requests issued through container exec,
//! so the fast path and the fallback path can never disagree.

use std::path::Path;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use super::{
    read_frame, write_frame, EditArgs, ExecArgs, GlobArgs, GrepArgs, LsArgs, Op, ProtocolError,
    ReadArgs, Request, Response, WriteArgs,
};
use crate::backend::fs::HostFilesystem;
use crate::backend::process::{run_shell, ExecLimits};
use crate::backend::FsError;

#[derive(Debug, Clone)]
pub struct SandboxServer {
    fs: HostFilesystem,
    limits: ExecLimits,
}

impl SandboxServer {
    /// # Arguments
    /// * `root` - Directory relative request paths resolve against
    /// * `limits` - Default exec deadline and output cap
    /// * `max_results` - Bound on glob and grep matches
    pub fn new(root: impl Into<std::path::PathBuf>, limits: ExecLimits, max_results: usize) -> Self {
        Self {
            fs: HostFilesystem::new(root, max_results),
            limits,
        }
    }

    pub fn root(&self) -> &Path {
        self.fs.root()
    }

    /// Execute one request. Never fails: errors become `ok: false` responses.
    pub async fn handle(&self, request: Request) -> Response {
        let op = request.op;
        debug!(op = %op, "Handling request");
        match op {
            Op::Ls => {
                self.fs_op(request.args, op, |fs, a: LsArgs| fs.ls_sync(&a.path))
                    .await
            }
            Op::Read => {
                self.fs_op(request.args, op, |fs, a: ReadArgs| {
                    fs.read_sync(&a.path, a.offset, a.limit)
                })
                .await
            }
            Op::Write => {
                self.fs_op(request.args, op, |fs, a: WriteArgs| {
                    fs.write_sync(&a.path, &a.content)
                })
                .await
            }
            Op::Edit => {
                self.fs_op(request.args, op, |fs, a: EditArgs| {
                    fs.edit_sync(&a.path, &a.old_text, &a.new_text)
                })
                .await
            }
            Op::Glob => {
                self.fs_op(request.args, op, |fs, a: GlobArgs| {
                    fs.glob_sync(&a.pattern, a.path.as_deref())
                })
                .await
            }
            Op::Grep => {
                self.fs_op(request.args, op, |fs, a: GrepArgs| {
                    fs.grep_sync(&a.pattern, a.path.as_deref(), a.glob.as_deref())
                })
                .await
            }
            Op::Exec => match parse_args::<ExecArgs>(request.args, op) {
                Ok(args) => self.exec(args).await,
                Err(response) => response,
            },
        }
    }

    async fn fs_op<A, T, F>(&self, args: Value, op: Op, f: F) -> Response
    where
        A: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
        F: FnOnce(&HostFilesystem, A) -> Result<T, FsError> + Send + 'static,
    {
        let args = match parse_args::<A>(args, op) {
            Ok(args) => args,
            Err(response) => return response,
        };
        let fs = self.fs.clone();
        match tokio::task::spawn_blocking(move || f(&fs, args)).await {
            Ok(Ok(data)) => match serde_json::to_value(data) {
                Ok(value) => Response::success(value),
                Err(e) => Response::failure(format!("failed to encode {} result: {}", op, e)),
            },
            Ok(Err(e)) => Response::failure(e.to_string()),
            Err(e) => Response::failure(format!("{} task failed: {}", op, e)),
        }
    }

    async fn exec(&self, args: ExecArgs) -> Response {
        let workdir = match args.workdir.as_deref() {
            Some(dir) => self.fs.resolve(dir),
            None => self.fs.root().to_path_buf(),
        };
        let mut limits = self.limits;
        if let Some(secs) = args.timeout_secs {
            limits.timeout = Duration::from_secs(secs);
        }
        match run_shell(&args.command, &workdir, limits).await {
            Ok(output) => match serde_json::to_value(output) {
                Ok(value) => Response::success(value),
                Err(e) => Response::failure(format!("failed to encode exec result: {}", e)),
            },
            Err(e) => Response::failure(format!("exec failed: {}", e)),
        }
    }

    /// Serve requests from one client until it disconnects
    ///
    /// A frame that cannot be decoded is answered with an error response and
    /// the connection is closed, since the stream position is no longer
    /// trustworthy.
    pub async fn serve_connection<S>(&self, stream: S) -> Result<(), ProtocolError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        loop {
            let request: Request = match read_frame(&mut reader).await {
                Ok(Some(request)) => request,
                Ok(None) => return Ok(()),
                Err(ProtocolError::Codec(message)) => {
                    warn!(error = %message, "Rejecting malformed frame");
                    write_frame(&mut writer, &Response::failure(format!("malformed request: {}", message)))
                        .await?;
                    return Err(ProtocolError::Codec(message));
                }
                Err(e) => return Err(e),
            };
            let response = self.handle(request).await;
            write_frame(&mut writer, &response).await?;
        }
    }

    /// Accept clients one at a time, forever
    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, root = %self.root().display(), "Sandbox server ready");
        loop {
            let (stream, peer) = listener.accept().await?;
            info!(peer = %peer, "Client connected");
            match self.serve_connection(stream).await {
                Ok(()) => info!(peer = %peer, "Client disconnected"),
                Err(e) => warn!(peer = %peer, error = %e, "Connection ended with error"),
            }
        }
    }

    /// Handle a single request given as a JSON line and return the response line
    pub async fn one_shot(&self, line: &str) -> String {
        let response = match serde_json::from_str::<Request>(line.trim()) {
            Ok(request) => self.handle(request).await,
            Err(e) => Response::failure(format!("malformed request: {}", e)),
        };
        serde_json::to_string(&response)
            .unwrap_or_else(|_| r#"{"ok":false,"error":"failed to encode response"}"#.to_string())
    }
}

fn parse_args<A: DeserializeOwned>(args: Value, op: Op) -> Result<A, Response> {
    serde_json::from_value(args)
        .map_err(|e| Response::failure(format!("invalid arguments for {}: {}", op, e)))
}
