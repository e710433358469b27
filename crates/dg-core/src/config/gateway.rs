//! Gateway configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::option_duration_secs;

/// Configuration for the gateway daemon
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Address to bind the SSH server to
    pub bind_address: String,

    /// Host key: a file path or the key material itself.
    /// An ephemeral Ed25519 key is generated when unset.
    pub host_key: Option<String>,

    /// Images sessions may use; empty allows any image
    pub allowed_images: Vec<String>,

    /// Command run when a shell is requested without a policy command
    pub default_shell: String,

    /// Inline `docker run` arguments, templated then word-split
    pub docker_run_args: String,

    /// Inline `docker exec` arguments, templated then word-split
    pub docker_exec_args: String,

    /// Always launch a new container instead of joining a running one
    pub no_join: bool,

    /// Remove managed containers when the gateway starts
    pub clean_on_startup: bool,

    /// Password hook: script path or http(s) URL
    pub password_auth_hook: Option<String>,

    /// Public-key hook: script path or http(s) URL
    pub publickey_auth_hook: Option<String>,

    /// Username that runs sessions on the host instead of in a container
    pub local_user: Option<String>,

    /// Text written to the channel before the session process starts
    pub banner: Option<String>,

    /// Bound on each hook invocation, in seconds
    #[serde(with = "option_duration_secs", skip_serializing_if = "Option::is_none")]
    pub hook_timeout: Option<Duration>,

    /// Bound on each container query, in seconds
    #[serde(with = "option_duration_secs", skip_serializing_if = "Option::is_none")]
    pub runtime_timeout: Option<Duration>,

    /// Container runtime executable
    pub docker_binary: PathBuf,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:2222".to_string(),
            host_key: None,
            allowed_images: Vec::new(),
            default_shell: "/bin/sh".to_string(),
            docker_run_args: "-it --rm".to_string(),
            docker_exec_args: "-it".to_string(),
            no_join: false,
            clean_on_startup: false,
            password_auth_hook: None,
            publickey_auth_hook: None,
            local_user: None,
            banner: None,
            hook_timeout: None,
            runtime_timeout: None,
            docker_binary: PathBuf::from("docker"),
        }
    }
}

impl GatewayConfig {
    /// Whether any authentication hook is configured
    pub fn has_hooks(&self) -> bool {
        self.password_auth_hook.is_some() || self.publickey_auth_hook.is_some()
    }
}
