//! External authentication hooks
//!
//! A hook is either a local executable or an HTTP endpoint. Both receive the
//! username plus the password or the presented public keys, and answer with
//! a JSON policy document that is decoded into a [`PolicyPatch`].

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use dg_core::config::expand_home;
use dg_core::{Environment, PolicyPatch};

use crate::error::AuthError;

/// What a hook is asked to decide on
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum HookRequest {
    /// Password authentication
    Password { username: String, password: String },
    /// Public-key authentication with every key presented so far
    PublicKey {
        username: String,
        publickeys: Vec<String>,
    },
}

impl HookRequest {
    /// The SSH username the request is about
    pub fn username(&self) -> &str {
        match self {
            HookRequest::Password { username, .. } | HookRequest::PublicKey { username, .. } => {
                username
            }
        }
    }

    /// Script arguments: the username, then the password or the keys in order
    pub fn args(&self) -> Vec<String> {
        match self {
            HookRequest::Password { username, password } => {
                vec![username.clone(), password.clone()]
            }
            HookRequest::PublicKey {
                username,
                publickeys,
            } => std::iter::once(username.clone())
                .chain(publickeys.iter().cloned())
                .collect(),
        }
    }
}

/// A way of asking an external party for a policy decision
#[async_trait]
pub trait HookTransport: Send + Sync {
    /// Run the hook and decode its answer
    async fn call(&self, request: &HookRequest, env: &Environment) -> Result<PolicyPatch, AuthError>;

    /// Human-readable target, for logs
    fn target(&self) -> &str;
}

/// Pick the transport for a hook reference
///
/// `http://` and `https://` references are HTTP endpoints; anything else
/// is a script path.
pub fn hook_from_reference(reference: &str) -> Arc<dyn HookTransport> {
    if reference.starts_with("http://") || reference.starts_with("https://") {
        Arc::new(HttpHook::new(reference))
    } else {
        Arc::new(ScriptHook::new(reference))
    }
}

/// Local executable hook
///
/// Invoked as `<script> <username> <password|keys...>` with the session
/// environment added to the gateway's own. Standard output must be the
/// JSON document.
pub struct ScriptHook {
    reference: String,
    path: PathBuf,
}

impl ScriptHook {
    /// Create a hook for the script at `path` (`~` is expanded)
    pub fn new(path: &str) -> Self {
        Self {
            reference: path.to_string(),
            path: expand_home(path),
        }
    }
}

#[async_trait]
impl HookTransport for ScriptHook {
    async fn call(&self, request: &HookRequest, env: &Environment) -> Result<PolicyPatch, AuthError> {
        tracing::debug!("Running hook script {:?} for {}", self.path, request.username());

        let output = tokio::process::Command::new(&self.path)
            .args(request.args())
            .envs(env.vars())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| AuthError::HookTransport(format!("{}: {}", self.path.display(), e)))?;

        if !output.stderr.is_empty() {
            tracing::debug!(
                "Hook script stderr: {}",
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
        }

        if !output.status.success() {
            tracing::warn!(
                "Hook script {:?} failed ({}), stdout: {}",
                self.path,
                output.status,
                String::from_utf8_lossy(&output.stdout).trim_end()
            );
            return Err(AuthError::HookExit(output.status.to_string()));
        }

        PolicyPatch::from_json(&output.stdout).map_err(|e| {
            tracing::warn!(
                "Hook script {:?} returned invalid JSON: {}",
                self.path,
                String::from_utf8_lossy(&output.stdout).trim_end()
            );
            AuthError::HookDecode(e)
        })
    }

    fn target(&self) -> &str {
        &self.reference
    }
}

/// HTTP endpoint hook
///
/// The request is POSTed as JSON. Only a 200 response is accepted, and its
/// body must be the JSON document.
pub struct HttpHook {
    url: String,
    client: reqwest::Client,
}

impl HttpHook {
    /// Create a hook for `url`
    pub fn new(url: &str) -> Self {
        Self {
            url: url.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl HookTransport for HttpHook {
    async fn call(&self, request: &HookRequest, _env: &Environment) -> Result<PolicyPatch, AuthError> {
        tracing::debug!("Calling hook {} for {}", self.url, request.username());

        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .await
            .map_err(|e| AuthError::HookTransport(e.to_string()))?;

        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|e| AuthError::HookTransport(e.to_string()))?;

        if status != reqwest::StatusCode::OK {
            tracing::warn!(
                "Hook {} returned {}: {}",
                self.url,
                status,
                String::from_utf8_lossy(&body).trim_end()
            );
            return Err(AuthError::HookStatus(status.as_u16()));
        }

        PolicyPatch::from_json(&body).map_err(|e| {
            tracing::warn!(
                "Hook {} returned invalid JSON: {}",
                self.url,
                String::from_utf8_lossy(&body).trim_end()
            );
            AuthError::HookDecode(e)
        })
    }

    fn target(&self) -> &str {
        &self.url
    }
}
