//! Authentication decision pipeline
//!
//! Each SSH authentication attempt is turned into a mutation of the
//! connection's [`SessionPolicy`] followed by the [`authorize`] check.
//! Only hooks can grant access; public keys are collected and handed to
//! the public-key hook on the keyboard-interactive round.

use std::sync::Arc;
use std::time::Duration;

use dg_core::config::GatewayConfig;
use dg_core::{AuthMethod, PolicyPatch, SessionPolicy};

use super::hook::{hook_from_reference, HookRequest, HookTransport};
use crate::error::AuthError;

/// Decide whether a policy may start sessions
///
/// With any hook configured, a hook must have set `allowed`. With an image
/// allow-list, the image must be on it regardless of `allowed`.
pub fn authorize(
    policy: &SessionPolicy,
    allowed_images: &[String],
    hooks_configured: bool,
) -> Result<(), AuthError> {
    if hooks_configured && !policy.allowed {
        return Err(AuthError::NotAllowed);
    }

    if !allowed_images.is_empty() && !allowed_images.iter().any(|i| *i == policy.image_name) {
        return Err(AuthError::ImageNotAllowed(policy.image_name.clone()));
    }

    Ok(())
}

/// Runs hooks and authorization for every attempt on a connection
pub struct Authenticator {
    password_hook: Option<Arc<dyn HookTransport>>,
    publickey_hook: Option<Arc<dyn HookTransport>>,
    allowed_images: Vec<String>,
    timeout: Option<Duration>,
    local_user: Option<String>,
}

impl Authenticator {
    /// Create an authenticator from explicit parts
    pub fn new(
        password_hook: Option<Arc<dyn HookTransport>>,
        publickey_hook: Option<Arc<dyn HookTransport>>,
        allowed_images: Vec<String>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            password_hook,
            publickey_hook,
            allowed_images,
            timeout,
            local_user: None,
        }
    }

    /// Image name that runs sessions on the host instead of in a container
    pub fn with_local_user(mut self, local_user: Option<String>) -> Self {
        self.local_user = local_user.filter(|u| !u.is_empty());
        self
    }

    /// Create an authenticator from the gateway configuration
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::new(
            config.password_auth_hook.as_deref().map(hook_from_reference),
            config.publickey_auth_hook.as_deref().map(hook_from_reference),
            config.allowed_images.clone(),
            config.hook_timeout,
        )
        .with_local_user(config.local_user.clone())
    }

    /// Whether any hook is configured
    pub fn hooks_configured(&self) -> bool {
        self.password_hook.is_some() || self.publickey_hook.is_some()
    }

    /// Run the authorization check for a policy
    pub fn authorize(&self, policy: &SessionPolicy) -> Result<(), AuthError> {
        authorize(policy, &self.allowed_images, self.hooks_configured())
    }

    /// Handle a password attempt
    pub async fn password_attempt(
        &self,
        policy: &mut SessionPolicy,
        username: &str,
        password: &str,
    ) -> Result<(), AuthError> {
        let Some(hook) = &self.password_hook else {
            return self.authorize(policy);
        };

        let request = HookRequest::Password {
            username: username.to_string(),
            password: password.to_string(),
        };
        let patch = self.invoke(hook.as_ref(), &request, policy).await?;
        policy.record_hook_result(patch, AuthMethod::Password, self.local_user.as_deref());

        self.authorize(policy)
    }

    /// Handle a public-key attempt
    ///
    /// The key is recorded for the keyboard-interactive round; it never
    /// grants access by itself.
    pub fn publickey_attempt(&self, policy: &mut SessionPolicy, key: &str) -> Result<(), AuthError> {
        policy.add_key(key);
        self.authorize(policy)
    }

    /// Handle a keyboard-interactive attempt
    ///
    /// Consults the public-key hook with every key presented so far. Without
    /// keys or without that hook this is a plain authorization check.
    pub async fn keyboard_interactive_attempt(
        &self,
        policy: &mut SessionPolicy,
        username: &str,
    ) -> Result<(), AuthError> {
        let hook = match &self.publickey_hook {
            Some(hook) if !policy.keys.is_empty() => hook,
            _ => return self.authorize(policy),
        };

        let request = HookRequest::PublicKey {
            username: username.to_string(),
            publickeys: policy.keys.clone(),
        };
        let patch = self.invoke(hook.as_ref(), &request, policy).await?;
        policy.record_hook_result(patch, AuthMethod::PublicKey, self.local_user.as_deref());

        self.authorize(policy)
    }

    async fn invoke(
        &self,
        hook: &dyn HookTransport,
        request: &HookRequest,
        policy: &SessionPolicy,
    ) -> Result<PolicyPatch, AuthError> {
        let call = hook.call(request, &policy.env);

        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .map_err(|_| AuthError::HookTimeout)
                .and_then(|r| r),
            None => call.await,
        };

        if let Err(e) = &result {
            tracing::warn!("Hook {} failed for {}: {}", hook.target(), request.username(), e);
        }
        result
    }
}
