//! SSH client handler implementation
//!
//! Implements the russh server handler: authentication callbacks feed the
//! connection's session policy, and each session channel is handed to a
//! [`ChannelDispatcher`].

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId, MethodSet};
use russh_keys::key::PublicKey;
use russh_keys::PublicKeyBase64;

use dg_core::SessionPolicy;
use dg_protocol::{ChannelRequest, PtyRequest, WindowSize};

use crate::dispatch::ChannelDispatcher;
use crate::error::AuthError;
use crate::relay::SessionSink;
use crate::state::{GatewayState, SharedPolicy};

/// Methods offered again after a rejected attempt
fn remaining_methods() -> MethodSet {
    MethodSet::PASSWORD | MethodSet::PUBLICKEY | MethodSet::KEYBOARD_INTERACTIVE
}

/// OpenSSH authorized-key text for a public key
pub fn authorized_key_line(key: &PublicKey) -> String {
    format!("{} {}", key.name(), key.public_key_base64())
}

/// Handler for a single SSH client connection
pub struct ClientHandler {
    /// Shared gateway state
    state: Arc<GatewayState>,
    /// Peer address of the connecting client
    peer_addr: SocketAddr,
    /// Registry key for this connection's policy
    identity: String,
    /// Session policy (set on the first auth callback)
    policy: Option<SharedPolicy>,
    /// Open session channels
    channels: HashMap<ChannelId, ChannelDispatcher>,
}

impl ClientHandler {
    /// Create a handler for a new connection
    pub fn new(state: Arc<GatewayState>, peer_addr: SocketAddr) -> Self {
        Self {
            state,
            peer_addr,
            identity: peer_addr.to_string(),
            policy: None,
            channels: HashMap::new(),
        }
    }

    fn policy_for(&mut self, user: &str) -> SharedPolicy {
        if let Some(policy) = &self.policy {
            return Arc::clone(policy);
        }
        let policy = self.state.sessions.get_or_create(&self.identity, user);
        self.policy = Some(Arc::clone(&policy));
        policy
    }

    fn verdict(
        &self,
        method: &str,
        user: &str,
        policy: &SessionPolicy,
        result: Result<(), AuthError>,
    ) -> Auth {
        match result {
            Ok(()) => {
                tracing::info!(
                    "Accepted {} for {} from {} ({}): {}",
                    method,
                    user,
                    self.peer_addr,
                    policy.auth_method,
                    policy.auth_comment
                );
                Auth::Accept
            }
            Err(e) => {
                tracing::debug!("Rejected {} for {} from {}: {}", method, user, self.peer_addr, e);
                Auth::Reject {
                    proceed_with_methods: Some(remaining_methods()),
                }
            }
        }
    }

    async fn dispatch(&mut self, channel: ChannelId, request: ChannelRequest) -> bool {
        match self.channels.get_mut(&channel) {
            Some(dispatcher) => dispatcher.dispatch(request).await,
            None => {
                tracing::warn!("{} request on unknown channel {:?}", request.kind(), channel);
                false
            }
        }
    }

    fn reply(session: &mut Session, channel: ChannelId, ok: bool) {
        if ok {
            let _ = session.channel_success(channel);
        } else {
            let _ = session.channel_failure(channel);
        }
    }
}

impl Drop for ClientHandler {
    fn drop(&mut self) {
        self.channels.clear();
        if self.policy.is_some() {
            self.state.sessions.remove(&self.identity);
            tracing::debug!(
                "Released policy for {} ({} live)",
                self.identity,
                self.state.sessions.len()
            );
        }
    }
}

#[async_trait]
impl Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        let policy = self.policy_for(user);
        let mut policy = policy.lock().await;
        let result = self
            .state
            .auth
            .password_attempt(&mut policy, user, password)
            .await;
        Ok(self.verdict("password", user, &policy, result))
    }

    /// Public keys only accumulate; they are judged by the public-key hook
    /// during keyboard-interactive
    async fn auth_publickey(&mut self, user: &str, public_key: &PublicKey) -> Result<Auth, Self::Error> {
        let key = authorized_key_line(public_key);
        tracing::debug!(
            "Public key {} offered by {} from {}",
            public_key.fingerprint(),
            user,
            self.peer_addr
        );

        let policy = self.policy_for(user);
        let mut policy = policy.lock().await;
        let result = self.state.auth.publickey_attempt(&mut policy, &key);
        Ok(self.verdict("publickey", user, &policy, result))
    }

    async fn auth_keyboard_interactive(
        &mut self,
        user: &str,
        _submethods: &str,
        _response: Option<russh::server::Response<'async_trait>>,
    ) -> Result<Auth, Self::Error> {
        let policy = self.policy_for(user);
        let mut policy = policy.lock().await;
        let result = self
            .state
            .auth
            .keyboard_interactive_attempt(&mut policy, user)
            .await;
        Ok(self.verdict("keyboard-interactive", user, &policy, result))
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let channel_id = channel.id();

        let Some(policy) = self.policy.clone() else {
            tracing::warn!("Session channel from {} before authentication", self.peer_addr);
            return Ok(false);
        };

        tracing::debug!("Channel opened: {:?} from {}", channel_id, self.peer_addr);

        let sink = Arc::new(SessionSink::new(session.handle(), channel_id));
        let dispatcher = ChannelDispatcher::new(
            format!("{} {:?}", self.peer_addr, channel_id),
            policy,
            Arc::clone(&self.state.router),
            sink,
            self.state.config.banner.clone(),
        );
        self.channels.insert(channel_id, dispatcher);

        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::PtyReq(PtyRequest {
            term: term.to_string(),
            size: WindowSize {
                cols: col_width,
                rows: row_height,
                pixel_width: pix_width,
                pixel_height: pix_height,
            },
            // russh has already decoded the modes; they are not applied
            modes: Vec::new(),
        });
        let ok = self.dispatch(channel, request).await;
        Self::reply(session, channel, ok);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::WindowChange(WindowSize {
            cols: col_width,
            rows: row_height,
            pixel_width: pix_width,
            pixel_height: pix_height,
        });
        let ok = self.dispatch(channel, request).await;
        Self::reply(session, channel, ok);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Env {
            name: variable_name.to_string(),
            value: variable_value.to_string(),
        };
        let ok = self.dispatch(channel, request).await;
        Self::reply(session, channel, ok);
        Ok(())
    }

    async fn shell_request(&mut self, channel: ChannelId, session: &mut Session) -> Result<(), Self::Error> {
        let ok = self.dispatch(channel, ChannelRequest::Shell).await;
        Self::reply(session, channel, ok);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let request = ChannelRequest::Exec {
            command: String::from_utf8_lossy(data).into_owned(),
        };
        let ok = self.dispatch(channel, request).await;
        Self::reply(session, channel, ok);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let ok = self
            .dispatch(channel, ChannelRequest::Other(format!("subsystem:{}", name)))
            .await;
        Self::reply(session, channel, ok);
        Ok(())
    }

    /// Handle incoming data on a channel
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::trace!("Received {} bytes on channel {:?}", data.len(), channel);
        if let Some(dispatcher) = self.channels.get(&channel) {
            dispatcher.input(data);
        }
        Ok(())
    }

    /// Handle channel EOF
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel EOF: {:?}", channel);
        if let Some(dispatcher) = self.channels.get_mut(&channel) {
            dispatcher.close_input();
        }
        Ok(())
    }

    /// Handle channel close
    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        tracing::debug!("Channel closed: {:?}", channel);
        self.channels.remove(&channel);
        Ok(())
    }
}

/// Configuration for the SSH server
#[derive(Clone)]
pub struct ServerConfig {
    /// russh server configuration
    pub ssh_config: Arc<russh::server::Config>,
}

impl ServerConfig {
    /// Create a new server configuration with the given host key
    pub fn new(host_key: russh_keys::key::KeyPair) -> Self {
        let mut config = russh::server::Config::default();
        config.keys.push(host_key);
        config.methods = remaining_methods();
        config.auth_rejection_time = std::time::Duration::from_secs(1);
        config.auth_rejection_time_initial = Some(std::time::Duration::from_secs(0));

        Self {
            ssh_config: Arc::new(config),
        }
    }
}
