//! Per-connection session policy
//!
//! A [`SessionPolicy`] is created from the SSH username on the first
//! authentication callback of a connection, refined by authentication hooks
//! through [`PolicyPatch`], and read by the router when a shell or command
//! is started.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::env::Environment;

/// Remote identity used until a hook names one
pub const ANONYMOUS_USER: &str = "anonymous";

/// How the session was authenticated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    /// No hook has granted anything yet
    #[default]
    #[serde(rename = "noauth")]
    None,
    /// Granted by the password hook
    Password,
    /// Granted by the public-key hook
    PublicKey,
}

impl AuthMethod {
    /// Name as rendered in templates and hook documents
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMethod::None => "noauth",
            AuthMethod::Password => "password",
            AuthMethod::PublicKey => "publickey",
        }
    }
}

impl fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `image_name` names the local-execution identity
fn is_local_image(image_name: &str, local_user: Option<&str>) -> bool {
    local_user.is_some_and(|local| !local.is_empty() && local == image_name)
}

/// What a session may do and how its process is launched
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SessionPolicy {
    /// Image to run or join
    pub image_name: String,

    /// Logical identity, used in container labels
    pub remote_user: String,

    /// Environment for hooks and the launched process
    pub env: Environment,

    /// Command to run when the client asks for a shell
    pub command: Vec<String>,

    /// Explicit `docker run` arguments (templated)
    pub docker_run_args: Vec<String>,

    /// Explicit `docker exec` arguments (templated)
    pub docker_exec_args: Vec<String>,

    /// User to run as inside the container
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Public keys presented so far, in OpenSSH `<algo> <base64>` form
    pub keys: Vec<String>,

    #[serde(rename = "authentication-method")]
    pub auth_method: AuthMethod,

    /// Free-text note from the hook
    #[serde(rename = "authentication-comment", alias = "authentication-coment")]
    pub auth_comment: String,

    /// Entrypoint override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<String>,

    /// Number of hook invocations that returned a document
    #[serde(rename = "authentication-attempts")]
    pub auth_attempts: u32,

    /// Set by a hook to grant access
    pub allowed: bool,

    /// Run directly on the host instead of in a container
    pub is_local: bool,

    /// A pseudo-terminal was requested
    #[serde(rename = "use-tty")]
    pub use_tty: bool,
}

impl SessionPolicy {
    /// Build the initial policy for an SSH username
    ///
    /// The image name is the username with `_` standing in for `/`, so
    /// `library_alpine` selects `library/alpine`.
    pub fn new(username: &str, local_user: Option<&str>) -> Self {
        let image_name = username.replace('_', "/");
        let is_local = is_local_image(&image_name, local_user);

        Self {
            image_name,
            remote_user: ANONYMOUS_USER.to_string(),
            is_local,
            ..Default::default()
        }
    }

    /// Record a presented public key
    pub fn add_key(&mut self, key: impl Into<String>) {
        self.keys.push(key.into());
    }

    /// Apply a hook response and bump the attempt bookkeeping
    ///
    /// Unless the response sets `is-local` itself, locality is re-derived
    /// from the resulting image name.
    pub fn record_hook_result(
        &mut self,
        patch: PolicyPatch,
        method: AuthMethod,
        local_user: Option<&str>,
    ) {
        let explicit_local = patch.is_local.is_some();
        patch.apply(self);
        if !explicit_local {
            self.is_local = is_local_image(&self.image_name, local_user);
        }
        self.auth_attempts += 1;
        self.auth_method = method;
    }

    /// Entrypoint, if set to something non-empty
    pub fn entrypoint(&self) -> Option<&str> {
        self.entrypoint.as_deref().filter(|ep| !ep.is_empty())
    }

    /// Container user, if set to something non-empty
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref().filter(|user| !user.is_empty())
    }
}

/// Sparse policy update decoded from a hook response
///
/// Only fields present in the document are applied. `env` entries are
/// merged into the existing environment and `keys` are appended, never
/// replaced. Attempt bookkeeping is owned by the pipeline and not read
/// from hook documents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyPatch {
    pub image_name: Option<String>,
    pub remote_user: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
    pub command: Option<Vec<String>>,
    pub docker_run_args: Option<Vec<String>>,
    pub docker_exec_args: Option<Vec<String>>,
    pub user: Option<String>,
    pub keys: Option<Vec<String>>,
    #[serde(rename = "authentication-comment", alias = "authentication-coment")]
    pub auth_comment: Option<String>,
    pub entrypoint: Option<String>,
    pub allowed: Option<bool>,
    pub is_local: Option<bool>,
    #[serde(rename = "use-tty")]
    pub use_tty: Option<bool>,
}

impl PolicyPatch {
    /// Decode a hook response body
    pub fn from_json(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// Overwrite the fields present in this patch
    pub fn apply(self, policy: &mut SessionPolicy) {
        if let Some(image_name) = self.image_name {
            policy.image_name = image_name;
        }
        if let Some(remote_user) = self.remote_user {
            policy.remote_user = remote_user;
        }
        if let Some(env) = self.env {
            policy.env.merge(env);
        }
        if let Some(command) = self.command {
            policy.command = command;
        }
        if let Some(args) = self.docker_run_args {
            policy.docker_run_args = args;
        }
        if let Some(args) = self.docker_exec_args {
            policy.docker_exec_args = args;
        }
        if let Some(user) = self.user {
            policy.user = Some(user).filter(|u| !u.is_empty());
        }
        if let Some(keys) = self.keys {
            for key in keys {
                if !policy.keys.contains(&key) {
                    policy.keys.push(key);
                }
            }
        }
        if let Some(comment) = self.auth_comment {
            policy.auth_comment = comment;
        }
        if let Some(entrypoint) = self.entrypoint {
            policy.entrypoint = Some(entrypoint).filter(|ep| !ep.is_empty());
        }
        if let Some(allowed) = self.allowed {
            policy.allowed = allowed;
        }
        if let Some(is_local) = self.is_local {
            policy.is_local = is_local;
        }
        if let Some(use_tty) = self.use_tty {
            policy.use_tty = use_tty;
        }
    }
}
