//! Container routing
//!
//! Turns a finalized session policy and a command into the exact process
//! invocation: run locally, join a running container with `docker exec`, or
//! launch a new one with `docker run`.

mod runtime;

pub use runtime::{cleanup, CleanupReport, ContainerFilter, ContainerRuntime, DockerCli, MARKER_LABEL};

use std::sync::Arc;

use dg_core::config::GatewayConfig;
use dg_core::{template, words, SessionPolicy};

use crate::error::RouterError;

/// Where the session process runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Directly on the gateway host
    Local,
    /// Inside an existing container
    Join(String),
    /// Inside a new container
    Launch,
}

/// A fully resolved process to start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    /// Executable
    pub program: String,
    /// Arguments, excluding the program
    pub args: Vec<String>,
    /// Session environment (non-empty entries)
    pub env: Vec<(String, String)>,
    /// How the target was chosen
    pub route: Route,
}

impl Invocation {
    /// Program and arguments joined for logging
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Router settings taken from the gateway configuration
#[derive(Debug, Clone)]
pub struct RouterSettings {
    /// Command used when nothing else is given
    pub default_shell: String,
    /// Inline `docker run` argument template
    pub run_args: String,
    /// Inline `docker exec` argument template
    pub exec_args: String,
    /// Never join running containers
    pub no_join: bool,
}

impl From<&GatewayConfig> for RouterSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            default_shell: config.default_shell.clone(),
            run_args: config.docker_run_args.clone(),
            exec_args: config.docker_exec_args.clone(),
            no_join: config.no_join,
        }
    }
}

/// Decides join vs launch vs local and builds the invocation
pub struct ContainerRouter {
    runtime: Arc<dyn ContainerRuntime>,
    settings: RouterSettings,
}

impl ContainerRouter {
    /// Create a router over a container runtime
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: RouterSettings) -> Self {
        Self { runtime, settings }
    }

    /// The underlying runtime
    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Build the invocation for a session
    ///
    /// When several running containers match, the first one listed by the
    /// runtime is joined.
    pub async fn route(
        &self,
        policy: &SessionPolicy,
        entrypoint: Option<&str>,
        command: Vec<String>,
    ) -> Result<Invocation, RouterError> {
        let entrypoint = entrypoint.filter(|ep| !ep.is_empty());
        let command = if entrypoint.is_none() && command.is_empty() {
            vec![self.settings.default_shell.clone()]
        } else {
            command
        };

        let env = policy
            .env
            .vars()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        if policy.is_local {
            let (program, args) = match entrypoint {
                Some(ep) => (ep.to_string(), command),
                None => {
                    let mut words = command.into_iter();
                    let program = words.next().ok_or(RouterError::NoCommand)?;
                    (program, words.collect())
                }
            };
            return Ok(Invocation {
                program,
                args,
                env,
                route: Route::Local,
            });
        }

        let filter = ContainerFilter {
            user: policy.remote_user.clone(),
            image: policy.image_name.clone(),
        };

        let existing = if self.settings.no_join {
            None
        } else {
            let running = self.runtime.find_running(&filter, &policy.env).await?;
            if running.len() > 1 {
                tracing::debug!(
                    "{} containers match {}/{}, joining the first",
                    running.len(),
                    filter.user,
                    filter.image
                );
            }
            running.into_iter().next()
        };

        let (args, route) = match existing {
            Some(id) => {
                let mut args = vec!["exec".to_string()];
                args.extend(self.extra_args(policy, &policy.docker_exec_args, &self.settings.exec_args)?);
                args.push(id.clone());
                args.extend(entrypoint.map(str::to_owned));
                args.extend(command);
                (args, Route::Join(id))
            }
            None => {
                let mut args = vec!["run".to_string()];
                args.extend(self.extra_args(policy, &policy.docker_run_args, &self.settings.run_args)?);
                args.extend(filter.run_labels());
                if let Some(user) = policy.user() {
                    args.push("-u".to_string());
                    args.push(user.to_string());
                }
                if let Some(ep) = entrypoint {
                    args.push("--entrypoint".to_string());
                    args.push(ep.to_string());
                }
                args.push(policy.image_name.clone());
                args.extend(command);
                (args, Route::Launch)
            }
        };

        Ok(Invocation {
            program: self.runtime.program().to_string_lossy().into_owned(),
            args,
            env,
            route,
        })
    }

    // Policy arguments are templated one by one; the inline string is
    // templated as a whole and then split.
    fn extra_args(
        &self,
        policy: &SessionPolicy,
        explicit: &[String],
        inline: &str,
    ) -> Result<Vec<String>, RouterError> {
        if !explicit.is_empty() {
            return Ok(template::render_all(explicit, policy)?);
        }
        let rendered = template::render(inline, policy)?;
        Ok(words::split(&rendered)?)
    }
}

/// Normalize a banner for a raw terminal
///
/// Carriage returns are dropped, every newline becomes `\n\r`, and a final
/// `\n\r` is appended.
pub fn render_banner(banner: &str) -> String {
    let mut out = banner.replace('\r', "").replace('\n', "\n\r");
    out.push_str("\n\r");
    out
}
