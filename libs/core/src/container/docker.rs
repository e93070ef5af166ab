//! Docker Engine API client over the unix socket.
//!
//! Reference: https://docs.docker.com/engine/api/v1.41/

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use hyper::body::{Buf, HttpBody};
use hyper::{Body, Client, Method, Request, Response, StatusCode};
use hyperlocal::{UnixClientExt, UnixConnector, Uri};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::{ContainerBackend, ContainerConfig, ContainerError, ContainerLogs, PullPolicy};

const API_VERSION: &str = "v1.41";

/// Docker client for Unix socket communication.
pub struct DockerClient {
    socket_path: PathBuf,
    client: Client<UnixConnector>,
}

impl std::fmt::Debug for DockerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DockerClient")
            .field("socket_path", &self.socket_path)
            .finish()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct CreateBody<'a> {
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cmd: Option<&'a [String]>,
    env: Vec<String>,
    host_config: HostConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct HostConfig {
    binds: Vec<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateResponse {
    id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitResponse {
    status_code: i64,
    #[serde(default)]
    error: Option<WaitError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct WaitError {
    #[serde(default)]
    message: String,
}

impl DockerClient {
    pub fn new<P: AsRef<Path>>(socket_path: P) -> Self {
        Self {
            socket_path: socket_path.as_ref().to_path_buf(),
            client: Client::unix(),
        }
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Response<Body>, ContainerError> {
        let uri = Uri::new(&self.socket_path, &format!("/{API_VERSION}{path}"));
        debug!(method = %method, path = path, "Docker API request");

        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(bytes) => builder
                .header("Content-Type", "application/json")
                .body(Body::from(bytes))?,
            None => builder.body(Body::empty())?,
        };
        Ok(self.client.request(request).await?)
    }

    /// Turn a non-success response into an error. 404 maps to `NotFound(what)`.
    async fn check(response: Response<Body>, what: &str) -> Result<Response<Body>, ContainerError> {
        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_MODIFIED {
            return Ok(response);
        }
        if status == StatusCode::NOT_FOUND {
            return Err(ContainerError::NotFound(what.to_string()));
        }
        let body = hyper::body::aggregate(response.into_body()).await?;
        Err(ContainerError::Api {
            status: status.as_u16(),
            message: api_message(body.chunk()),
        })
    }

    async fn image_exists(&self, image: &str) -> Result<bool, ContainerError> {
        let response = self
            .send(Method::GET, &format!("/images/{image}/json"), None)
            .await?;
        match Self::check(response, image).await {
            Ok(_) => Ok(true),
            Err(ContainerError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn pull(&self, image: &str) -> Result<(), ContainerError> {
        debug!(image = image, "Pulling container image");
        let response = self
            .send(
                Method::POST,
                &format!("/images/create?fromImage={}", encode(image)),
                None,
            )
            .await?;
        let response = Self::check(response, image).await?;

        // Progress messages; failures arrive in-band as {"error": ...}.
        let body = hyper::body::to_bytes(response.into_body()).await?;
        for line in body.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
            if let Ok(value) = serde_json::from_slice::<serde_json::Value>(line) {
                if let Some(error) = value.get("error").and_then(|e| e.as_str()) {
                    return Err(ContainerError::Api {
                        status: 200,
                        message: error.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn ensure_image(&self, image: &str, policy: PullPolicy) -> Result<(), ContainerError> {
        match policy {
            PullPolicy::Always => self.pull(image).await,
            PullPolicy::IfNotExist => {
                if self.image_exists(image).await? {
                    Ok(())
                } else {
                    self.pull(image).await
                }
            }
            PullPolicy::Never => {
                if self.image_exists(image).await? {
                    Ok(())
                } else {
                    Err(ContainerError::ImageMissing(image.to_string()))
                }
            }
        }
    }
}

#[async_trait]
impl ContainerBackend for DockerClient {
    async fn create(&self, config: &ContainerConfig) -> Result<String, ContainerError> {
        self.ensure_image(&config.image, config.pull).await?;

        let body = CreateBody {
            image: &config.image,
            cmd: config.command.as_deref(),
            env: config.env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            host_config: HostConfig {
                binds: config.mounts.iter().map(|m| m.to_bind()).collect(),
            },
        };
        let mut path = String::from("/containers/create");
        if !config.name.is_empty() {
            path.push_str(&format!("?name={}", encode(&config.name)));
        }
        let response = self
            .send(Method::POST, &path, Some(serde_json::to_vec(&body)?))
            .await?;
        let response = Self::check(response, &config.image).await?;
        let body = hyper::body::aggregate(response.into_body()).await?;
        let created: CreateResponse = serde_json::from_reader(body.reader())?;
        debug!(id = %created.id, image = %config.image, "Created container");
        Ok(created.id)
    }

    async fn start(&self, id: &str) -> Result<(), ContainerError> {
        let response = self
            .send(Method::POST, &format!("/containers/{id}/start"), None)
            .await?;
        Self::check(response, id).await?;
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, ContainerError> {
        let response = self
            .send(Method::POST, &format!("/containers/{id}/wait"), None)
            .await?;
        let response = Self::check(response, id).await?;
        let body = hyper::body::aggregate(response.into_body()).await?;
        let waited: WaitResponse = serde_json::from_reader(body.reader())?;
        match waited.error {
            Some(WaitError { message }) if !message.is_empty() => Err(ContainerError::Wait {
                id: id.to_string(),
                message,
            }),
            _ => Ok(waited.status_code),
        }
    }

    async fn logs(&self, id: &str) -> Result<ContainerLogs, ContainerError> {
        let response = self
            .send(
                Method::GET,
                &format!("/containers/{id}/logs?follow=1&stdout=1&stderr=1"),
                None,
            )
            .await?;
        let response = Self::check(response, id).await?;

        let (stdout_tx, stdout_rx) = tokio::io::duplex(64 * 1024);
        let (stderr_tx, stderr_rx) = tokio::io::duplex(64 * 1024);
        let id = id.to_string();
        tokio::spawn(async move {
            if let Err(e) = demux_body(response.into_body(), stdout_tx, stderr_tx).await {
                warn!(id = %id, error = %e, "Container log stream ended with error");
            }
        });

        Ok(ContainerLogs {
            stdout: Box::new(stdout_rx),
            stderr: Box::new(stderr_rx),
        })
    }

    async fn copy_from(&self, id: &str, src: &str, dst: &Path) -> Result<(), ContainerError> {
        let response = self
            .send(
                Method::GET,
                &format!("/containers/{id}/archive?path={}", encode(src)),
                None,
            )
            .await?;
        let response = Self::check(response, &format!("{id}:{src}")).await?;

        let staged = tempfile::tempfile()?;
        let mut out = tokio::fs::File::from_std(staged);
        let mut body = response.into_body();
        while let Some(chunk) = body.data().await {
            out.write_all(&chunk?).await?;
        }
        out.flush().await?;
        let mut staged = out.into_std().await;

        let dst = dst.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            use std::io::{Seek, SeekFrom};
            staged.seek(SeekFrom::Start(0))?;
            std::fs::create_dir_all(&dst)?;
            tar::Archive::new(staged).unpack(&dst)
        })
        .await
        .map_err(std::io::Error::other)??;
        Ok(())
    }

    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), ContainerError> {
        let response = self
            .send(
                Method::POST,
                &format!("/containers/{id}/stop?t={}", timeout.as_secs()),
                None,
            )
            .await?;
        Self::check(response, id).await?;
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), ContainerError> {
        let response = self
            .send(Method::DELETE, &format!("/containers/{id}?force=1&v=1"), None)
            .await?;
        match Self::check(response, id).await {
            Ok(_) | Err(ContainerError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

fn api_message(body: &[u8]) -> String {
    #[derive(Deserialize)]
    struct Message {
        message: String,
    }
    match serde_json::from_slice::<Message>(body) {
        Ok(m) => m.message,
        Err(_) => String::from_utf8_lossy(body).trim().to_string(),
    }
}

/// Percent-encode a query or path component.
fn encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{:02X}", b)),
        }
    }
    out
}

/// Stream a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogStream {
    Stdin,
    Stdout,
    Stderr,
}

/// Splits the multiplexed log format of containers without a TTY: each
/// frame has an 8 byte header (stream type, 3 padding bytes, big-endian
/// u32 length) followed by the payload.
#[derive(Debug, Default)]
struct Demuxer {
    buf: Vec<u8>,
}

impl Demuxer {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn next_frame(&mut self) -> Option<(LogStream, Vec<u8>)> {
        if self.buf.len() < 8 {
            return None;
        }
        let len = u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;
        if self.buf.len() < 8 + len {
            return None;
        }
        let stream = match self.buf[0] {
            0 => LogStream::Stdin,
            2 => LogStream::Stderr,
            _ => LogStream::Stdout,
        };
        let payload = self.buf[8..8 + len].to_vec();
        self.buf.drain(..8 + len);
        Some((stream, payload))
    }
}

async fn demux_body<W: AsyncWrite + Unpin>(
    mut body: Body,
    mut stdout: W,
    mut stderr: W,
) -> Result<(), ContainerError> {
    let mut demuxer = Demuxer::default();
    while let Some(chunk) = body.data().await {
        demuxer.push(&chunk?);
        while let Some((stream, payload)) = demuxer.next_frame() {
            match stream {
                LogStream::Stderr => stderr.write_all(&payload).await?,
                _ => stdout.write_all(&payload).await?,
            }
        }
    }
    stdout.shutdown().await?;
    stderr.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn frame(stream: u8, payload: &[u8]) -> Vec<u8> {
        let mut f = vec![stream, 0, 0, 0];
        f.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        f.extend_from_slice(payload);
        f
    }

    #[test]
    fn test_demuxer_handles_split_frames() {
        let mut data = frame(1, b"hello\n");
        data.extend(frame(2, b"oops\n"));

        let mut demuxer = Demuxer::default();
        demuxer.push(&data[..5]);
        assert!(demuxer.next_frame().is_none());
        demuxer.push(&data[5..]);

        assert_eq!(
            demuxer.next_frame(),
            Some((LogStream::Stdout, b"hello\n".to_vec()))
        );
        assert_eq!(
            demuxer.next_frame(),
            Some((LogStream::Stderr, b"oops\n".to_vec()))
        );
        assert!(demuxer.next_frame().is_none());
    }

    #[tokio::test]
    async fn test_demux_body_routes_streams() {
        let mut data = frame(1, b"out");
        data.extend(frame(2, b"err"));
        data.extend(frame(1, b"!"));

        let (out_tx, mut out_rx) = tokio::io::duplex(1024);
        let (err_tx, mut err_rx) = tokio::io::duplex(1024);
        demux_body(Body::from(data), out_tx, err_tx).await.unwrap();

        let mut out = String::new();
        out_rx.read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        err_rx.read_to_string(&mut err).await.unwrap();
        assert_eq!(out, "out!");
        assert_eq!(err, "err");
    }

    #[test]
    fn test_encode() {
        assert_eq!(encode("alpine:3.19"), "alpine%3A3.19");
        assert_eq!(encode("ghcr.io/a/b"), "ghcr.io%2Fa%2Fb");
    }

    #[test]
    fn test_api_message() {
        assert_eq!(api_message(br#"{"message":"no such container"}"#), "no such container");
        assert_eq!(api_message(b"plain text\n"), "plain text");
    }

    #[test]
    fn test_create_body_shape() {
        let cmd = vec!["sh".to_string(), "-c".to_string(), "true".to_string()];
        let body = CreateBody {
            image: "alpine",
            cmd: Some(&cmd),
            env: vec!["A=1".to_string()],
            host_config: HostConfig {
                binds: vec!["/a:/b:ro".to_string()],
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["Image"], "alpine");
        assert_eq!(json["Cmd"][2], "true");
        assert_eq!(json["HostConfig"]["Binds"][0], "/a:/b:ro");
    }
}
