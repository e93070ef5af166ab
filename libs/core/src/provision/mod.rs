//! Provisioning of running VMs.
//!
//! A provisioning file is TOML:
//!
//! ```toml
//! [env]
//! HTTP_PROXY = "http://proxy:3128"
//!
//! [values]
//! Version = "1.2"
//!
//! [[steps]]
//! shell = { script = "install-pkg app={{.Version}}" }
//!
//! [[steps]]
//! docker = { image = "ghcr.io/acme/test:{{.Version}}", copy = { source = "/out", dest = "results" } }
//!
//! [[steps]]
//! rsync = { source = "dist/*.rpm", dest = "/tmp/rpms" }
//! ```
//!
//! `{{.key}}` placeholders are filled from `[values]` after command line
//! overrides are applied. Steps run in order; within a step all VMs run
//! concurrently and the first failure cancels the rest.

mod docker;
mod output;
mod rsync;
mod shell;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::cancel::Cancel;
use crate::container::{ContainerBackend, ContainerError, PullPolicy};
use crate::ssh::{KnownHosts, SshClient, SshError, SshTarget};

pub use output::Output;

/// Errors from provisioning.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("failed to parse provisioning file: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unknown provisioning value {0:?}")]
    UnknownValue(String),

    #[error("unterminated placeholder in {0:?}")]
    Unterminated(String),

    #[error("invalid value override {0:?}: expected key=value")]
    InvalidOverride(String),

    #[error("invalid environment variable name {0:?}")]
    InvalidEnvName(String),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("container error: {0}")]
    Container(#[from] ContainerError),

    #[error("docker step requires a container backend")]
    NoContainerBackend,

    #[error("step {step} failed on {vm}: exit status {status}")]
    StepFailed { vm: String, step: usize, status: String },

    #[error("container for step {step} exited with status {status}")]
    ContainerFailed { step: usize, status: i64 },

    #[error("copying {source_path} out of the container timed out after {timeout:?}")]
    CopyTimeout { source_path: String, timeout: Duration },

    #[error("rsync to {vm} failed: {status}")]
    Rsync { vm: String, status: String },

    #[error("invalid pattern {pattern:?}: {source}")]
    Pattern {
        pattern: String,
        source: glob::PatternError,
    },

    #[error("pattern {0:?} matched no files")]
    NoMatch(String),

    #[error("provisioning cancelled")]
    Cancelled,

    #[error("provisioning task failed: {0}")]
    Task(String),
}

/// Run a shell script on every VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ShellStep {
    pub script: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Files copied out of the container after it exits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CopyOut {
    /// Path inside the container.
    pub source: String,
    /// Local directory.
    pub dest: PathBuf,
}

/// Run a container that reaches the VMs over SSH.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DockerStep {
    pub image: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub copy: Option<CopyOut>,
}

/// Copy local files matching a glob to every VM.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RsyncStep {
    pub source: String,
    pub dest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProvisionStep {
    Shell(ShellStep),
    Docker(DockerStep),
    Rsync(RsyncStep),
}

impl ProvisionStep {
    pub fn kind(&self) -> &'static str {
        match self {
            ProvisionStep::Shell(_) => "shell",
            ProvisionStep::Docker(_) => "docker",
            ProvisionStep::Rsync(_) => "rsync",
        }
    }
}

/// A provisioning file with placeholders resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ProvisionConfig {
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub values: BTreeMap<String, String>,
    #[serde(default)]
    pub steps: Vec<ProvisionStep>,
}

impl ProvisionConfig {
    /// Parse TOML, apply value overrides, then fill placeholders.
    pub fn from_toml(text: &str, overrides: &[(String, String)]) -> Result<Self, ProvisionError> {
        let mut config: ProvisionConfig = toml::from_str(text)?;
        for (key, value) in overrides {
            config.values.insert(key.clone(), value.clone());
        }
        config.render()
    }

    pub async fn load(path: &std::path::Path, overrides: &[(String, String)]) -> Result<Self, ProvisionError> {
        let text = tokio::fs::read_to_string(path).await?;
        Self::from_toml(&text, overrides)
    }

    /// Single shell step config, used for ad-hoc commands.
    pub fn shell(script: &str) -> Self {
        Self {
            steps: vec![ProvisionStep::Shell(ShellStep {
                script: script.to_string(),
                env: BTreeMap::new(),
            })],
            ..Self::default()
        }
    }

    fn render(mut self) -> Result<Self, ProvisionError> {
        let values = &self.values;
        let r = |s: &mut String| -> Result<(), ProvisionError> {
            *s = render(s, values)?;
            Ok(())
        };
        let render_env = |env: &mut BTreeMap<String, String>| -> Result<(), ProvisionError> {
            for (k, v) in env.iter_mut() {
                if !valid_env_name(k) {
                    return Err(ProvisionError::InvalidEnvName(k.clone()));
                }
                *v = render(v, values)?;
            }
            Ok(())
        };

        render_env(&mut self.env)?;
        for step in &mut self.steps {
            match step {
                ProvisionStep::Shell(s) => {
                    r(&mut s.script)?;
                    render_env(&mut s.env)?;
                }
                ProvisionStep::Docker(s) => {
                    r(&mut s.image)?;
                    render_env(&mut s.env)?;
                    if let Some(command) = &mut s.command {
                        for arg in command.iter_mut() {
                            r(arg)?;
                        }
                    }
                    if let Some(copy) = &mut s.copy {
                        r(&mut copy.source)?;
                    }
                }
                ProvisionStep::Rsync(s) => {
                    r(&mut s.source)?;
                    r(&mut s.dest)?;
                }
            }
        }
        Ok(self)
    }
}

/// Shell variable names: a letter or underscore, then letters, digits or underscores.
fn valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parse a `key=value` override.
pub fn parse_override(input: &str) -> Result<(String, String), ProvisionError> {
    match input.split_once('=') {
        Some((k, v)) if !k.trim().is_empty() => Ok((k.trim().to_string(), v.to_string())),
        _ => Err(ProvisionError::InvalidOverride(input.to_string())),
    }
}

/// Replace `{{.key}}` placeholders with entries of `values`.
pub fn render(template: &str, values: &BTreeMap<String, String>) -> Result<String, ProvisionError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| ProvisionError::Unterminated(template.to_string()))?;
        let key = after[..end].trim();
        let key = key.strip_prefix('.').unwrap_or(key);
        let value = values
            .get(key)
            .ok_or_else(|| ProvisionError::UnknownValue(key.to_string()))?;
        out.push_str(value);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Global env overlaid with step env; the step wins.
pub fn merge_env(
    global: &BTreeMap<String, String>,
    step: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    let mut merged = global.clone();
    merged.extend(step.iter().map(|(k, v)| (k.clone(), v.clone())));
    merged
}

/// Runs provisioning steps against VMs.
#[derive(Clone)]
pub struct Provisioner {
    ssh: SshClient,
    containers: Option<Arc<dyn ContainerBackend>>,
    pull_policy: PullPolicy,
    copy_timeout: Duration,
    retry_period: Duration,
    stdout: Output,
    stderr: Output,
}

impl std::fmt::Debug for Provisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provisioner")
            .field("ssh", &self.ssh)
            .field("pull_policy", &self.pull_policy)
            .field("copy_timeout", &self.copy_timeout)
            .finish_non_exhaustive()
    }
}

impl Provisioner {
    pub fn new(ssh: SshClient) -> Self {
        Self {
            ssh,
            containers: None,
            pull_policy: PullPolicy::default(),
            copy_timeout: Duration::from_secs(60),
            retry_period: Duration::from_secs(1),
            stdout: Output::Stdout,
            stderr: Output::Stderr,
        }
    }

    pub fn with_containers(mut self, backend: Arc<dyn ContainerBackend>, pull: PullPolicy) -> Self {
        self.containers = Some(backend);
        self.pull_policy = pull;
        self
    }

    pub fn with_copy_timeout(mut self, timeout: Duration) -> Self {
        self.copy_timeout = timeout;
        self
    }

    pub fn with_retry_period(mut self, period: Duration) -> Self {
        self.retry_period = period;
        self
    }

    pub fn with_output(mut self, stdout: Output, stderr: Output) -> Self {
        self.stdout = stdout;
        self.stderr = stderr;
        self
    }

    /// Run all steps of `config` against `targets`.
    pub async fn run(
        &self,
        targets: &[SshTarget],
        config: &ProvisionConfig,
        cancel: &Cancel,
    ) -> Result<(), ProvisionError> {
        let known_hosts = KnownHosts::write(targets)?;

        for (index, step) in config.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(ProvisionError::Cancelled);
            }
            info!(step = index, kind = step.kind(), vms = targets.len(), "Running provisioning step");
            match step {
                ProvisionStep::Shell(s) => {
                    let env = merge_env(&config.env, &s.env);
                    self.run_shell(index, targets, known_hosts.path(), &s.script, &env, cancel)
                        .await?
                }
                ProvisionStep::Docker(s) => {
                    let env = merge_env(&config.env, &s.env);
                    self.run_docker(index, targets, s, &env, cancel).await?
                }
                ProvisionStep::Rsync(s) => {
                    self.run_rsync(targets, known_hosts.path(), s, cancel).await?
                }
            }
        }
        Ok(())
    }
}

/// Await every task; the first failure aborts the others.
async fn join_fail_fast(mut tasks: JoinSet<Result<(), ProvisionError>>) -> Result<(), ProvisionError> {
    while let Some(joined) = tasks.join_next().await {
        let result = match joined {
            Ok(r) => r,
            Err(e) if e.is_cancelled() => continue,
            Err(e) => Err(ProvisionError::Task(e.to_string())),
        };
        if let Err(e) = result {
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
            warn!(error = %e, "Provisioning step failed, cancelled remaining VMs");
            return Err(e);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const FILE: &str = r#"
[env]
A = "global"
B = "global"

[values]
Version = "1.0"
Target = "/opt"

[[steps]]
shell = { script = "echo {{.Version}} > {{ .Target }}/v", env = { B = "step" } }

[[steps]]
docker = { image = "test:{{.Version}}", command = ["run", "{{.Target}}"], copy = { source = "/out", dest = "res" } }

[[steps]]
rsync = { source = "dist/*.rpm", dest = "{{.Target}}/rpms" }
"#;

    #[test]
    fn test_parse_and_render() {
        let config = ProvisionConfig::from_toml(FILE, &[]).unwrap();
        assert_eq!(config.steps.len(), 3);

        let ProvisionStep::Shell(shell) = &config.steps[0] else {
            panic!("expected shell step");
        };
        assert_eq!(shell.script, "echo 1.0 > /opt/v");

        let ProvisionStep::Docker(docker) = &config.steps[1] else {
            panic!("expected docker step");
        };
        assert_eq!(docker.image, "test:1.0");
        assert_eq!(docker.command.as_deref(), Some(&["run".to_string(), "/opt".to_string()][..]));
        assert_eq!(docker.copy.as_ref().unwrap().dest, PathBuf::from("res"));

        let ProvisionStep::Rsync(rsync) = &config.steps[2] else {
            panic!("expected rsync step");
        };
        assert_eq!(rsync.dest, "/opt/rpms");
    }

    #[test]
    fn test_overrides_win() {
        let overrides = vec![parse_override("Version=2.0").unwrap()];
        let config = ProvisionConfig::from_toml(FILE, &overrides).unwrap();
        let ProvisionStep::Shell(shell) = &config.steps[0] else {
            panic!("expected shell step");
        };
        assert_eq!(shell.script, "echo 2.0 > /opt/v");
    }

    #[test]
    fn test_step_env_overrides_global() {
        let config = ProvisionConfig::from_toml(FILE, &[]).unwrap();
        let ProvisionStep::Shell(shell) = &config.steps[0] else {
            panic!("expected shell step");
        };
        let env = merge_env(&config.env, &shell.env);
        assert_eq!(env["A"], "global");
        assert_eq!(env["B"], "step");
    }

    #[test]
    fn test_env_names_must_be_shell_identifiers() {
        let bad_global = "[env]\n\"A;touch /tmp/x\" = \"1\"\n";
        assert!(matches!(
            ProvisionConfig::from_toml(bad_global, &[]),
            Err(ProvisionError::InvalidEnvName(k)) if k == "A;touch /tmp/x"
        ));

        let bad_step = r#"
[[steps]]
shell = { script = "true", env = { "1X" = "v" } }
"#;
        assert!(matches!(
            ProvisionConfig::from_toml(bad_step, &[]),
            Err(ProvisionError::InvalidEnvName(k)) if k == "1X"
        ));

        let good = "[env]\n_OK1 = \"v\"\n";
        let config = ProvisionConfig::from_toml(good, &[]).unwrap();
        assert_eq!(config.env["_OK1"], "v");
        assert!(!valid_env_name(""));
    }

    #[test]
    fn test_render_errors() {
        let values = BTreeMap::new();
        assert!(matches!(
            render("{{.missing}}", &values),
            Err(ProvisionError::UnknownValue(k)) if k == "missing"
        ));
        assert!(matches!(
            render("open {{.x", &values),
            Err(ProvisionError::Unterminated(_))
        ));
        assert_eq!(render("no placeholders", &values).unwrap(), "no placeholders");
    }

    #[test]
    fn test_parse_override() {
        assert_eq!(
            parse_override("k=v=w").unwrap(),
            ("k".to_string(), "v=w".to_string())
        );
        assert!(parse_override("novalue").is_err());
        assert!(parse_override("=v").is_err());
    }

    #[test]
    fn test_unknown_step_kind() {
        let err = ProvisionConfig::from_toml("[[steps]]\nansible = { playbook = \"x\" }\n", &[]);
        assert!(matches!(err, Err(ProvisionError::Toml(_))));
    }

    #[tokio::test]
    async fn test_join_fail_fast_returns_first_error() {
        let mut tasks = JoinSet::new();
        tasks.spawn(async {
            std::future::pending::<()>().await;
            Ok(())
        });
        tasks.spawn(async { Err(ProvisionError::NoMatch("x".to_string())) });
        let err = join_fail_fast(tasks).await.unwrap_err();
        assert!(matches!(err, ProvisionError::NoMatch(_)));
    }
}
