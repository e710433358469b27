//! Global gateway state

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;

use dg_core::config::GatewayConfig;
use dg_core::SessionPolicy;

use crate::auth::Authenticator;
use crate::router::{ContainerRouter, ContainerRuntime, DockerCli, RouterSettings};

/// Shared handle to one connection's policy
pub type SharedPolicy = Arc<Mutex<SessionPolicy>>;

/// Session policies keyed by connection identity
///
/// A policy is created on the first authentication callback of a
/// connection and lives until the connection handler is dropped.
pub struct PolicyRegistry {
    policies: DashMap<String, SharedPolicy>,
    local_user: Option<String>,
}

impl PolicyRegistry {
    /// Create an empty registry
    pub fn new(local_user: Option<String>) -> Self {
        Self {
            policies: DashMap::new(),
            local_user,
        }
    }

    /// Policy for `identity`, created from `username` if absent
    pub fn get_or_create(&self, identity: &str, username: &str) -> SharedPolicy {
        self.policies
            .entry(identity.to_string())
            .or_insert_with(|| {
                let mut policy = SessionPolicy::new(username, self.local_user.as_deref());
                policy.env.apply_defaults();
                tracing::debug!("New policy for {} (image {})", identity, policy.image_name);
                Arc::new(Mutex::new(policy))
            })
            .clone()
    }

    /// Forget the policy of a closed connection
    pub fn remove(&self, identity: &str) {
        self.policies.remove(identity);
    }

    /// Number of live policies
    pub fn len(&self) -> usize {
        self.policies.len()
    }

    /// Whether no policy is live
    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }
}

/// Global state for the gateway daemon
pub struct GatewayState {
    /// Configuration
    pub config: GatewayConfig,
    /// Per-connection session policies
    pub sessions: PolicyRegistry,
    /// Authentication pipeline
    pub auth: Authenticator,
    /// Container router
    pub router: Arc<ContainerRouter>,
}

impl GatewayState {
    /// Create gateway state backed by the docker CLI
    pub fn new(config: GatewayConfig) -> Self {
        let runtime = Arc::new(DockerCli::new(
            config.docker_binary.clone(),
            config.runtime_timeout,
        ));
        Self::with_runtime(config, runtime)
    }

    /// Create gateway state over a specific container runtime
    pub fn with_runtime(config: GatewayConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            sessions: PolicyRegistry::new(config.local_user.clone()),
            auth: Authenticator::from_config(&config),
            router: Arc::new(ContainerRouter::new(runtime, RouterSettings::from(&config))),
            config,
        }
    }
}
