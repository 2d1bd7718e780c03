//! Container daemon API client
//!
//! Speaks the Docker Engine HTTP API over its Unix domain socket.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, StatusCode};
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use super::DockerError;

type HyperClient = Client<UnixConnector, Full<Bytes>>;

/// What a sandbox container is created with
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerSpec {
    pub image: String,
    pub cmd: Vec<String>,
    pub workdir: String,
    /// `host:container[:mode]` bind mounts
    pub binds: Vec<String>,
    /// Container TCP port published on host loopback with a daemon-chosen port
    pub publish_port: u16,
}

impl ContainerSpec {
    /// Body of `POST /containers/create`
    pub fn to_body(&self) -> Value {
        let port_key = format!("{}/tcp", self.publish_port);
        let mut exposed = serde_json::Map::new();
        exposed.insert(port_key.clone(), json!({}));
        let mut bindings = serde_json::Map::new();
        bindings.insert(port_key, json!([{ "HostIp": "127.0.0.1", "HostPort": "" }]));
        json!({
            "Image": self.image,
            "Cmd": self.cmd,
            "WorkingDir": self.workdir,
            "Tty": false,
            "ExposedPorts": exposed,
            "HostConfig": {
                "Binds": self.binds,
                "PortBindings": bindings
            }
        })
    }
}

/// Output of a command run through the exec API
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i64,
}

#[derive(Debug, Deserialize)]
struct CreatedResponse {
    #[serde(rename = "Id")]
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ExecInspect {
    exit_code: Option<i64>,
    running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerInspect {
    state: ContainerState,
    network_settings: NetworkSettings,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ContainerState {
    running: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct NetworkSettings {
    #[serde(default)]
    ports: HashMap<String, Option<Vec<PortBinding>>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PortBinding {
    host_ip: String,
    host_port: String,
}

/// Client for the container daemon's control API
pub struct DockerClient {
    client: HyperClient,
    socket_path: PathBuf,
}

impl DockerClient {
    /// Create a new daemon API client
    ///
    /// # Arguments
    /// * `socket_path` - Path to the daemon API Unix socket
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);

        Self {
            client,
            socket_path: socket_path.into(),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send a request and return status plus raw body
    async fn send(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<(StatusCode, Bytes), DockerError> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();
        let payload = match body {
            Some(value) => Bytes::from(
                serde_json::to_vec(&value).map_err(|e| DockerError::Decode(e.to_string()))?,
            ),
            None => Bytes::new(),
        };

        let req = hyper::Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(payload))
            .map_err(|e| DockerError::Connection(e.to_string()))?;

        let res = self
            .client
            .request(req)
            .await
            .map_err(|e| DockerError::Connection(e.to_string()))?;
        let status = res.status();
        let bytes = res
            .into_body()
            .collect()
            .await
            .map_err(|e| DockerError::Connection(e.to_string()))?
            .to_bytes();
        debug!(endpoint, status = status.as_u16(), "Daemon API call");
        Ok((status, bytes))
    }

    /// Send a request, treating any status outside `accept` as an error
    async fn send_expect(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
        accept: &[StatusCode],
    ) -> Result<Bytes, DockerError> {
        let (status, bytes) = self.send(method, endpoint, body).await?;
        if accept.contains(&status) {
            return Ok(bytes);
        }
        Err(api_error(endpoint, status, &bytes))
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<Value>,
    ) -> Result<T, DockerError> {
        let bytes = self
            .send_expect(method, endpoint, body, &[StatusCode::OK, StatusCode::CREATED])
            .await?;
        serde_json::from_slice(&bytes).map_err(|e| DockerError::Decode(e.to_string()))
    }

    /// Create a container and return its id
    pub async fn create_container(&self, name: &str, spec: &ContainerSpec) -> Result<String, DockerError> {
        let endpoint = format!("/containers/create?name={}", name);
        let created: CreatedResponse = self
            .send_json(Method::POST, &endpoint, Some(spec.to_body()))
            .await?;
        Ok(created.id)
    }

    pub async fn start_container(&self, id: &str) -> Result<(), DockerError> {
        let endpoint = format!("/containers/{}/start", id);
        self.send_expect(
            Method::POST,
            &endpoint,
            None,
            &[StatusCode::NO_CONTENT, StatusCode::NOT_MODIFIED],
        )
        .await?;
        Ok(())
    }

    pub async fn stop_container(&self, id: &str, grace_secs: u64) -> Result<(), DockerError> {
        let endpoint = format!("/containers/{}/stop?t={}", id, grace_secs);
        self.send_expect(
            Method::POST,
            &endpoint,
            None,
            &[StatusCode::NO_CONTENT, StatusCode::NOT_MODIFIED],
        )
        .await?;
        Ok(())
    }

    pub async fn restart_container(&self, id: &str, grace_secs: u64) -> Result<(), DockerError> {
        let endpoint = format!("/containers/{}/restart?t={}", id, grace_secs);
        self.send_expect(Method::POST, &endpoint, None, &[StatusCode::NO_CONTENT])
            .await?;
        Ok(())
    }

    /// Force-remove a container; a container that is already gone is not an error
    pub async fn remove_container(&self, id: &str) -> Result<(), DockerError> {
        let endpoint = format!("/containers/{}?force=true", id);
        self.send_expect(
            Method::DELETE,
            &endpoint,
            None,
            &[StatusCode::NO_CONTENT, StatusCode::NOT_FOUND],
        )
        .await?;
        Ok(())
    }

    /// Host address the container's `port/tcp` is published on
    ///
    /// # Returns
    /// `None` while the container is not running or the port is unpublished
    pub async fn published_port(&self, id: &str, port: u16) -> Result<Option<SocketAddr>, DockerError> {
        let endpoint = format!("/containers/{}/json", id);
        let inspect: ContainerInspect = self.send_json(Method::GET, &endpoint, None).await?;
        if !inspect.state.running {
            return Ok(None);
        }
        let key = format!("{}/tcp", port);
        let binding = inspect
            .network_settings
            .ports
            .get(&key)
            .and_then(|b| b.as_ref())
            .and_then(|b| b.first());
        let Some(binding) = binding else {
            return Ok(None);
        };
        let host = if binding.host_ip.is_empty() || binding.host_ip == "0.0.0.0" {
            "127.0.0.1"
        } else {
            binding.host_ip.as_str()
        };
        let addr = format!("{}:{}", host, binding.host_port)
            .parse()
            .map_err(|e| DockerError::Decode(format!("bad published port: {}", e)))?;
        Ok(Some(addr))
    }

    /// Run `argv` inside a running container and wait for it to finish
    ///
    /// # Arguments
    /// * `id` - Container id or name
    /// * `argv` - Program and arguments, run without a shell
    /// * `workdir` - Working directory inside the container
    ///
    /// # Returns
    /// Demultiplexed stdout/stderr and the exit code
    pub async fn exec(
        &self,
        id: &str,
        argv: &[String],
        workdir: Option<&str>,
    ) -> Result<ContainerExecOutput, DockerError> {
        let mut body = json!({
            "AttachStdout": true,
            "AttachStderr": true,
            "Tty": false,
            "Cmd": argv,
        });
        if let Some(dir) = workdir {
            body["WorkingDir"] = json!(dir);
        }
        let endpoint = format!("/containers/{}/exec", id);
        let created: CreatedResponse = self.send_json(Method::POST, &endpoint, Some(body)).await?;

        // Without an upgrade the daemon streams the multiplexed output as the body
        let start = format!("/exec/{}/start", created.id);
        let raw = self
            .send_expect(
                Method::POST,
                &start,
                Some(json!({ "Detach": false, "Tty": false })),
                &[StatusCode::OK],
            )
            .await?;
        let (stdout, stderr) = demux(&raw);

        let inspect: ExecInspect = self
            .send_json(Method::GET, &format!("/exec/{}/json", created.id), None)
            .await?;
        if inspect.running {
            return Err(DockerError::Decode("exec still running after output closed".into()));
        }

        Ok(ContainerExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }
}

fn api_error(endpoint: &str, status: StatusCode, body: &[u8]) -> DockerError {
    #[derive(Deserialize)]
    struct Message {
        message: String,
    }
    let message = serde_json::from_slice::<Message>(body)
        .map(|m| m.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
    if status == StatusCode::NOT_FOUND && endpoint.starts_with("/containers/") {
        if let Some(id) = endpoint.trim_start_matches("/containers/").split(['/', '?']).next() {
            return DockerError::NotFound(id.to_string());
        }
    }
    DockerError::Api {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        message,
    }
}

/// Split the daemon's multiplexed stream into stdout and stderr
///
/// Each frame is an 8-byte header `[stream, 0, 0, 0, len(u32 BE)]` followed
/// by `len` bytes. Stream 1 is stdout, 2 is stderr. A truncated trailing frame
/// keeps whatever bytes are present.
pub fn demux(raw: &[u8]) -> (Vec<u8>, Vec<u8>) {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut rest = raw;
    while rest.len() >= 8 {
        let stream = rest[0];
        let len = u32::from_be_bytes([rest[4], rest[5], rest[6], rest[7]]) as usize;
        let body = &rest[8..];
        let take = len.min(body.len());
        match stream {
            2 => stderr.extend_from_slice(&body[..take]),
            _ => stdout.extend_from_slice(&body[..take]),
        }
        rest = &body[take..];
    }
    (stdout, stderr)
}
