//! SSH server listener
//!
//! Accepts incoming connections and spawns handlers for each client.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use russh_keys::key::KeyPair;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use dg_core::config::expand_home;

use crate::server::handler::{ClientHandler, ServerConfig};
use crate::state::GatewayState;

/// SSH server that listens for incoming connections
pub struct SshServer {
    /// Server configuration
    config: ServerConfig,
    /// Shared gateway state
    state: Arc<GatewayState>,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
}

impl SshServer {
    /// Create a new SSH server
    pub fn new(host_key: KeyPair, state: Arc<GatewayState>, cancel: CancellationToken) -> Self {
        Self {
            config: ServerConfig::new(host_key),
            state,
            cancel,
        }
    }

    /// Run the SSH server until cancelled
    pub async fn run(&self, bind_addr: &str) -> Result<()> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;

        let local_addr = listener.local_addr()?;
        tracing::info!("SSH server listening on {}", local_addr);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    tracing::info!("SSH server shutting down");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => self.handle_connection(socket, peer_addr),
                        Err(e) => tracing::error!("Failed to accept connection: {}", e),
                    }
                }
            }
        }

        Ok(())
    }

    fn handle_connection(&self, socket: tokio::net::TcpStream, peer_addr: SocketAddr) {
        tracing::info!("New connection from {}", peer_addr);

        let config = Arc::clone(&self.config.ssh_config);
        let state = Arc::clone(&self.state);
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let handler = ClientHandler::new(state, peer_addr);

            let session = match russh::server::run_stream(config, socket, handler).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!("Handshake with {} failed: {}", peer_addr, e);
                    return;
                }
            };

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::debug!("Connection handler cancelled for {}", peer_addr);
                    return;
                }
                result = session => result,
            };

            match result {
                Ok(()) => tracing::info!("Connection from {} closed normally", peer_addr),
                Err(e) => tracing::warn!("Connection from {} closed with error: {}", peer_addr, e),
            }
        });
    }
}

/// Resolve the configured host key
///
/// `source` is either a path to a private key file or the PEM/OpenSSH text of
/// one. Without a key, an ephemeral Ed25519 key is generated.
pub fn load_host_key(source: Option<&str>) -> Result<KeyPair> {
    let Some(source) = source.map(str::trim).filter(|s| !s.is_empty()) else {
        tracing::warn!("No host key configured, generating an ephemeral Ed25519 key");
        return KeyPair::generate_ed25519()
            .ok_or_else(|| anyhow::anyhow!("Failed to generate Ed25519 key"));
    };

    if source.contains("PRIVATE KEY") {
        tracing::info!("Using inline host key");
        return russh_keys::decode_secret_key(source, None).context("Failed to decode inline host key");
    }

    let path = expand_home(source);
    load_host_key_file(&path)
}

fn load_host_key_file(path: &Path) -> Result<KeyPair> {
    if !path.exists() {
        anyhow::bail!("Host key {:?} does not exist", path);
    }
    tracing::info!("Loading host key from {:?}", path);
    russh_keys::load_secret_key(path, None)
        .with_context(|| format!("Failed to load host key from {:?}", path))
}
