//! dockgate daemon
//!
//! SSH server that places every authenticated session inside a Docker
//! container chosen by the login name or by an authentication hook.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dg_core::config::{self, GatewayConfig};
use dg_gateway::router::cleanup;
use dg_gateway::server::{load_host_key, SshServer};
use dg_gateway::GatewayState;

#[derive(Parser, Debug)]
#[command(name = "dockgate")]
#[command(about = "SSH server that drops every session into a Docker container")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "DOCKGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long, env = "DOCKGATE_BIND")]
    bind: Option<String>,

    /// Host key file or key material
    #[arg(long, env = "DOCKGATE_HOST_KEY")]
    host_key: Option<String>,

    /// Comma separated images sessions may use
    #[arg(long, env = "DOCKGATE_ALLOWED_IMAGES", value_delimiter = ',')]
    allowed_images: Vec<String>,

    /// Command used when the client asks for a shell
    #[arg(long, env = "DOCKGATE_SHELL")]
    shell: Option<String>,

    /// Arguments added to `docker run`
    #[arg(long, env = "DOCKGATE_DOCKER_RUN_ARGS", allow_hyphen_values = true)]
    docker_run_args: Option<String>,

    /// Arguments added to `docker exec`
    #[arg(long, env = "DOCKGATE_DOCKER_EXEC_ARGS", allow_hyphen_values = true)]
    docker_exec_args: Option<String>,

    /// Always start a new container
    #[arg(long, env = "DOCKGATE_NO_JOIN")]
    no_join: bool,

    /// Remove containers left by a previous run
    #[arg(long, env = "DOCKGATE_CLEAN_ON_STARTUP")]
    clean_on_startup: bool,

    /// Password hook (script path or http(s) URL)
    #[arg(long, env = "DOCKGATE_PASSWORD_AUTH_SCRIPT")]
    password_auth_script: Option<String>,

    /// Public-key hook (script path or http(s) URL)
    #[arg(long, env = "DOCKGATE_PUBLICKEY_AUTH_SCRIPT")]
    publickey_auth_script: Option<String>,

    /// Login that runs sessions on this host
    #[arg(long, env = "DOCKGATE_LOCAL_USER")]
    local_user: Option<String>,

    /// Banner shown before each session
    #[arg(long, env = "DOCKGATE_BANNER")]
    banner: Option<String>,

    /// Seconds allowed for each hook call
    #[arg(long, env = "DOCKGATE_HOOK_TIMEOUT")]
    hook_timeout: Option<u64>,

    /// Seconds allowed for each container runtime query
    #[arg(long, env = "DOCKGATE_RUNTIME_TIMEOUT")]
    runtime_timeout: Option<u64>,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Overlay flags on top of the file configuration
    fn apply(&self, config: &mut GatewayConfig) {
        if let Some(bind) = &self.bind {
            config.bind_address = bind.clone();
        }
        if self.host_key.is_some() {
            config.host_key = self.host_key.clone();
        }
        let images: Vec<String> = self
            .allowed_images
            .iter()
            .map(|i| i.trim().to_string())
            .filter(|i| !i.is_empty())
            .collect();
        if !images.is_empty() {
            config.allowed_images = images;
        }
        if let Some(shell) = &self.shell {
            config.default_shell = shell.clone();
        }
        if let Some(args) = &self.docker_run_args {
            config.docker_run_args = args.clone();
        }
        if let Some(args) = &self.docker_exec_args {
            config.docker_exec_args = args.clone();
        }
        config.no_join |= self.no_join;
        config.clean_on_startup |= self.clean_on_startup;
        if self.password_auth_script.is_some() {
            config.password_auth_hook = self.password_auth_script.clone();
        }
        if self.publickey_auth_script.is_some() {
            config.publickey_auth_hook = self.publickey_auth_script.clone();
        }
        if self.local_user.is_some() {
            config.local_user = self.local_user.clone();
        }
        if self.banner.is_some() {
            config.banner = self.banner.clone();
        }
        if let Some(secs) = self.hook_timeout {
            config.hook_timeout = Some(Duration::from_secs(secs));
        }
        if let Some(secs) = self.runtime_timeout {
            config.runtime_timeout = Some(Duration::from_secs(secs));
        }
    }
}

fn load_configuration(path: Option<&PathBuf>) -> Result<GatewayConfig> {
    if let Some(config_path) = path {
        return config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path));
    }

    let default_path = config::default_config_path();
    if default_path.exists() {
        Ok(config::load_config(&default_path).unwrap_or_else(|e| {
            tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
            GatewayConfig::default()
        }))
    } else {
        tracing::info!("Using default configuration");
        Ok(GatewayConfig::default())
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, initiating shutdown..."),
        _ = terminate => tracing::info!("Received SIGTERM, initiating shutdown..."),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("dockgate starting...");

    let mut config = load_configuration(args.config.as_ref())?;
    args.apply(&mut config);

    let host_key = load_host_key(config.host_key.as_deref())?;
    match host_key.clone_public_key() {
        Ok(public) => tracing::info!("Host key fingerprint: {}", public.fingerprint()),
        Err(e) => tracing::warn!("Cannot derive host public key: {}", e),
    }

    if config.allowed_images.is_empty() {
        tracing::info!("No image allow-list, any image may be used");
    } else {
        tracing::info!("Allowed images: {}", config.allowed_images.join(", "));
    }
    if !config.has_hooks() {
        tracing::warn!("No authentication hook configured, every login is accepted");
    }

    let bind_addr = config.bind_address.clone();
    let state = Arc::new(GatewayState::new(config));

    if state.config.clean_on_startup {
        match cleanup(state.router.runtime().as_ref()).await {
            Ok(report) => tracing::info!(
                "Cleanup: killed {} and removed {} containers",
                report.killed,
                report.removed
            ),
            Err(e) => tracing::warn!("Startup cleanup failed: {}", e),
        }
    }

    let cancel = CancellationToken::new();
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        cancel_clone.cancel();
    });

    let server = SshServer::new(host_key, Arc::clone(&state), cancel.clone());

    tracing::info!("Starting SSH server on {}", bind_addr);
    server.run(&bind_addr).await?;

    tracing::info!("dockgate shutdown complete");
    Ok(())
}
