//! Scripted in-process container backend.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::{ContainerBackend, ContainerConfig, ContainerError, ContainerLogs};

#[derive(Debug, Default)]
struct State {
    next_id: u32,
    containers: HashMap<String, ContainerConfig>,
    created: Vec<ContainerConfig>,
    started: Vec<String>,
    stopped: Vec<String>,
    removed: Vec<String>,
}

/// Containers that "run" by replaying scripted output.
#[derive(Debug, Default)]
pub struct MemoryContainers {
    state: Mutex<State>,
    exit_code: i64,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    files: Vec<(String, String, Vec<u8>)>,
    hang: bool,
}

impl MemoryContainers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exit_code(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_output(mut self, stdout: &[u8], stderr: &[u8]) -> Self {
        self.stdout = stdout.to_vec();
        self.stderr = stderr.to_vec();
        self
    }

    /// A file at `relative` below container path `src`.
    pub fn with_file(mut self, src: &str, relative: &str, content: &[u8]) -> Self {
        self.files
            .push((src.to_string(), relative.to_string(), content.to_vec()));
        self
    }

    /// Containers never exit on their own.
    pub fn with_hang(mut self) -> Self {
        self.hang = true;
        self
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn created(&self) -> Vec<ContainerConfig> {
        self.lock().created.clone()
    }

    pub fn started(&self) -> Vec<String> {
        self.lock().started.clone()
    }

    pub fn stopped(&self) -> Vec<String> {
        self.lock().stopped.clone()
    }

    pub fn removed(&self) -> Vec<String> {
        self.lock().removed.clone()
    }

    fn require(&self, id: &str) -> Result<(), ContainerError> {
        if self.lock().containers.contains_key(id) {
            Ok(())
        } else {
            Err(ContainerError::NotFound(id.to_string()))
        }
    }
}

#[async_trait]
impl ContainerBackend for MemoryContainers {
    async fn create(&self, config: &ContainerConfig) -> Result<String, ContainerError> {
        let mut state = self.lock();
        state.next_id += 1;
        let id = format!("c{:04}", state.next_id);
        state.containers.insert(id.clone(), config.clone());
        state.created.push(config.clone());
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), ContainerError> {
        self.require(id)?;
        self.lock().started.push(id.to_string());
        Ok(())
    }

    async fn wait(&self, id: &str) -> Result<i64, ContainerError> {
        self.require(id)?;
        if self.hang {
            std::future::pending::<()>().await;
        }
        Ok(self.exit_code)
    }

    async fn logs(&self, id: &str) -> Result<ContainerLogs, ContainerError> {
        self.require(id)?;
        Ok(ContainerLogs {
            stdout: Box::new(std::io::Cursor::new(self.stdout.clone())),
            stderr: Box::new(std::io::Cursor::new(self.stderr.clone())),
        })
    }

    async fn copy_from(&self, id: &str, src: &str, dst: &Path) -> Result<(), ContainerError> {
        self.require(id)?;
        let base = Path::new(src)
            .file_name()
            .map(|n| dst.join(n))
            .unwrap_or_else(|| dst.to_path_buf());
        for (file_src, relative, content) in &self.files {
            if file_src != src {
                continue;
            }
            let path = base.join(relative);
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&path, content).await?;
        }
        Ok(())
    }

    async fn stop(&self, id: &str, _timeout: Duration) -> Result<(), ContainerError> {
        self.require(id)?;
        self.lock().stopped.push(id.to_string());
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), ContainerError> {
        let mut state = self.lock();
        if state.containers.remove(id).is_some() {
            state.removed.push(id.to_string());
        }
        Ok(())
    }
}
