//! Container runtime access
//!
//! The gateway never talks to the Docker API. It shells out to the
//! `docker` command line, and everything it needs from it sits behind
//! [`ContainerRuntime`].

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;

use dg_core::Environment;

use crate::error::RouterError;

/// Label carried by every container the gateway launches
pub const MARKER_LABEL: &str = "dockgate";

/// Labels identifying a session's container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerFilter {
    /// `user=<remote_user>`
    pub user: String,
    /// `image=<image_name>`
    pub image: String,
}

impl ContainerFilter {
    /// `--label=...` arguments for `docker run`
    pub fn run_labels(&self) -> Vec<String> {
        vec![
            format!("--label={}", MARKER_LABEL),
            format!("--label=user={}", self.user),
            format!("--label=image={}", self.image),
        ]
    }
}

/// Operations the gateway needs from the container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Executable used for `run` and `exec` invocations
    fn program(&self) -> &Path;

    /// Running containers matching the session labels, in runtime order
    async fn find_running(
        &self,
        filter: &ContainerFilter,
        env: &Environment,
    ) -> Result<Vec<String>, RouterError>;

    /// Containers carrying the marker label (`all` includes stopped ones)
    async fn list_managed(&self, all: bool) -> Result<Vec<String>, RouterError>;

    /// Kill a container with SIGKILL
    async fn kill(&self, id: &str) -> Result<(), RouterError>;

    /// Force-remove a container
    async fn remove(&self, id: &str) -> Result<(), RouterError>;
}

/// [`ContainerRuntime`] backed by the `docker` CLI
pub struct DockerCli {
    binary: PathBuf,
    timeout: Option<Duration>,
}

impl DockerCli {
    /// Create a runtime using `binary` (usually `docker`)
    pub fn new(binary: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[String], env: Option<&Environment>) -> Result<String, RouterError> {
        let mut command = tokio::process::Command::new(&self.binary);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(env) = env {
            command.envs(env.vars());
        }

        tracing::debug!("Executing '{} {}'", self.binary.display(), args.join(" "));

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, command.output())
                .await
                .map_err(|_| RouterError::Timeout)?,
            None => command.output().await,
        }
        .map_err(|e| RouterError::Runtime(format!("{}: {}", self.binary.display(), e)))?;

        if !output.status.success() {
            return Err(RouterError::Runtime(format!(
                "{} {} failed ({}): {}",
                self.binary.display(),
                args.first().map(String::as_str).unwrap_or_default(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn ids(stdout: &str) -> Vec<String> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect()
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    fn program(&self) -> &Path {
        &self.binary
    }

    async fn find_running(
        &self,
        filter: &ContainerFilter,
        env: &Environment,
    ) -> Result<Vec<String>, RouterError> {
        let args = vec![
            "ps".to_string(),
            format!("--filter=label={}", MARKER_LABEL),
            format!("--filter=label=image={}", filter.image),
            format!("--filter=label=user={}", filter.user),
            "--quiet".to_string(),
            "--no-trunc".to_string(),
        ];
        Ok(ids(&self.run(&args, Some(env)).await?))
    }

    async fn list_managed(&self, all: bool) -> Result<Vec<String>, RouterError> {
        let mut args = vec![
            "ps".to_string(),
            format!("--filter=label={}", MARKER_LABEL),
            "--quiet".to_string(),
            "--no-trunc".to_string(),
        ];
        if all {
            args.push("-a".to_string());
        }
        Ok(ids(&self.run(&args, None).await?))
    }

    async fn kill(&self, id: &str) -> Result<(), RouterError> {
        let args = ["kill", "-s", "9", id].map(String::from);
        self.run(&args, None).await.map(|_| ())
    }

    async fn remove(&self, id: &str) -> Result<(), RouterError> {
        let args = ["rm", "-f", id].map(String::from);
        self.run(&args, None).await.map(|_| ())
    }
}

/// Outcome of a startup cleanup
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    /// Containers killed
    pub killed: usize,
    /// Containers removed
    pub removed: usize,
}

/// Kill and remove every container carrying the marker label
///
/// Listing failures abort; individual kill/remove failures are logged and
/// skipped.
pub async fn cleanup(runtime: &dyn ContainerRuntime) -> Result<CleanupReport, RouterError> {
    let mut report = CleanupReport::default();

    for id in runtime.list_managed(false).await? {
        match runtime.kill(&id).await {
            Ok(()) => report.killed += 1,
            Err(e) => tracing::warn!("Failed to kill container {}: {}", id, e),
        }
    }

    for id in runtime.list_managed(true).await? {
        match runtime.remove(&id).await {
            Ok(()) => report.removed += 1,
            Err(e) => tracing::warn!("Failed to remove container {}: {}", id, e),
        }
    }

    tracing::info!(
        "Cleanup done: {} killed, {} removed",
        report.killed,
        report.removed
    );
    Ok(report)
}
