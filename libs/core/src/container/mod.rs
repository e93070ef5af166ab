//! Container execution backend.
//!
//! Provisioning steps that run in a container go through the
//! [`ContainerBackend`] trait. [`DockerClient`] talks to the Docker Engine
//! API on its unix socket; [`MemoryContainers`] is a scripted in-process
//! backend for tests.

mod docker;
mod memory;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::AsyncRead;

pub use docker::DockerClient;
pub use memory::MemoryContainers;

/// Errors from the container backend.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("container API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("image not available locally and pull policy is never: {0}")]
    ImageMissing(String),

    #[error("container {id} failed: {message}")]
    Wait { id: String, message: String },
}

impl From<hyper::http::Error> for ContainerError {
    fn from(err: hyper::http::Error) -> Self {
        ContainerError::Api {
            status: 0,
            message: err.to_string(),
        }
    }
}

impl ContainerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ContainerError::NotFound(_))
    }
}

/// When to pull the container image before creating a container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PullPolicy {
    Always,
    #[default]
    IfNotExist,
    Never,
}

impl std::str::FromStr for PullPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "always" | "Always" => Ok(PullPolicy::Always),
            "if-not-exist" | "IfNotExist" => Ok(PullPolicy::IfNotExist),
            "never" | "Never" => Ok(PullPolicy::Never),
            other => Err(format!("unknown pull policy: {other}")),
        }
    }
}

/// A bind mount into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn read_only(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
            read_only: true,
        }
    }

    /// Docker `Binds` syntax.
    pub fn to_bind(&self) -> String {
        let mut bind = format!("{}:{}", self.source.display(), self.target);
        if self.read_only {
            bind.push_str(":ro");
        }
        bind
    }
}

/// What to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerConfig {
    pub name: String,
    pub image: String,
    pub env: BTreeMap<String, String>,
    /// Overrides the image command when set.
    pub command: Option<Vec<String>>,
    pub mounts: Vec<Mount>,
    pub pull: PullPolicy,
}

/// Output streams of a container.
pub struct ContainerLogs {
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
}

impl std::fmt::Debug for ContainerLogs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerLogs").finish_non_exhaustive()
    }
}

#[async_trait]
pub trait ContainerBackend: Send + Sync {
    /// Create a container and return its ID. Pulls the image as the
    /// configured policy requires.
    async fn create(&self, config: &ContainerConfig) -> Result<String, ContainerError>;

    async fn start(&self, id: &str) -> Result<(), ContainerError>;

    /// Wait for the container to exit and return its exit status.
    async fn wait(&self, id: &str) -> Result<i64, ContainerError>;

    /// Follow stdout and stderr until the container exits.
    async fn logs(&self, id: &str) -> Result<ContainerLogs, ContainerError>;

    /// Copy `src` out of the container into the directory `dst`.
    async fn copy_from(&self, id: &str, src: &str, dst: &Path) -> Result<(), ContainerError>;

    /// Stop the container, killing it after `timeout`.
    async fn stop(&self, id: &str, timeout: Duration) -> Result<(), ContainerError>;

    /// Remove the container. Removing a missing container succeeds.
    async fn remove(&self, id: &str) -> Result<(), ContainerError>;
}
