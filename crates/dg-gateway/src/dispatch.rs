//! Per-channel request dispatch
//!
//! Every session channel gets a [`ChannelDispatcher`]. Requests mutate the
//! connection's policy (`pty-req`, `env`), drive the terminal
//! (`window-change`), or start the session process (`shell`, `exec`). The
//! boolean each dispatch returns is the reply sent to the client.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dg_core::{words, SessionPolicy};
use dg_protocol::{ChannelRequest, WindowSize};

use crate::relay::{self, ChannelSink, InputReceiver, Terminal};
use crate::router::{render_banner, ContainerRouter};

/// Dispatches the requests of one session channel
pub struct ChannelDispatcher {
    /// Label for logs
    label: String,
    policy: Arc<Mutex<SessionPolicy>>,
    router: Arc<ContainerRouter>,
    sink: Arc<dyn ChannelSink>,
    banner: Option<String>,
    terminal: Option<Arc<Terminal>>,
    input_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    input_rx: Option<InputReceiver>,
    session: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl ChannelDispatcher {
    /// Create a dispatcher for a freshly opened channel
    pub fn new(
        label: impl Into<String>,
        policy: Arc<Mutex<SessionPolicy>>,
        router: Arc<ContainerRouter>,
        sink: Arc<dyn ChannelSink>,
        banner: Option<String>,
    ) -> Self {
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        Self {
            label: label.into(),
            policy,
            router,
            sink,
            banner,
            terminal: None,
            input_tx: Some(input_tx),
            input_rx: Some(input_rx),
            session: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Decode a raw request payload and dispatch it
    ///
    /// Malformed payloads are rejected.
    pub async fn dispatch_raw(&mut self, kind: &str, payload: &[u8]) -> bool {
        match ChannelRequest::decode(kind, payload) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                tracing::warn!("{}: malformed {} request: {}", self.label, kind, e);
                false
            }
        }
    }

    /// Handle one request; returns whether it succeeded
    pub async fn dispatch(&mut self, request: ChannelRequest) -> bool {
        tracing::debug!("{}: {} request", self.label, request.kind());

        match request {
            ChannelRequest::PtyReq(pty) => {
                {
                    let mut policy = self.policy.lock().await;
                    policy.use_tty = true;
                    policy.env.set("TERM", pty.term.clone());
                    policy.env.set("USE_TTY", "1");
                }
                tracing::debug!(
                    "{}: pty-req TERM={:?} {}x{}",
                    self.label,
                    pty.term,
                    pty.size.cols,
                    pty.size.rows
                );
                self.open_terminal(pty.size)
            }

            ChannelRequest::WindowChange(size) => {
                if let Some(terminal) = &self.terminal {
                    // Pixel dimensions are ignored
                    if let Err(e) = terminal.resize(WindowSize::new(size.cols, size.rows)) {
                        tracing::debug!("{}: {}", self.label, e);
                    }
                }
                true
            }

            ChannelRequest::Env { name, value } => {
                tracing::debug!("{}: env {}={:?}", self.label, name, value);
                self.policy.lock().await.env.set(name, value);
                true
            }

            ChannelRequest::Shell => {
                let (entrypoint, command) = {
                    let policy = self.policy.lock().await;
                    (policy.entrypoint().map(str::to_owned), policy.command.clone())
                };
                self.start(entrypoint, command)
            }

            ChannelRequest::Exec { command } => {
                let argv = match words::split(&command) {
                    Ok(argv) => argv,
                    Err(e) => {
                        tracing::warn!("{}: cannot parse command {:?}: {}", self.label, command, e);
                        return false;
                    }
                };
                let entrypoint = self.policy.lock().await.entrypoint().map(str::to_owned);
                self.start(entrypoint, argv)
            }

            ChannelRequest::Other(kind) => {
                tracing::debug!("{}: declining {} request", self.label, kind);
                false
            }
        }
    }

    /// Forward client data to the session input
    pub fn input(&self, data: &[u8]) {
        if let Some(tx) = &self.input_tx {
            let _ = tx.send(data.to_vec());
        }
    }

    /// Client sent EOF
    pub fn close_input(&mut self) {
        self.input_tx = None;
    }

    /// Whether a shell or command has been started
    pub fn is_running(&self) -> bool {
        self.session.is_some()
    }

    /// The channel's terminal, if one was requested
    pub fn terminal(&self) -> Option<&Arc<Terminal>> {
        self.terminal.as_ref()
    }

    /// Wait for the session task to finish
    pub async fn wait(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.await;
        }
    }

    fn open_terminal(&mut self, size: WindowSize) -> bool {
        if let Some(terminal) = &self.terminal {
            return match terminal.resize(size) {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!("{}: {}", self.label, e);
                    false
                }
            };
        }

        match Terminal::open(size) {
            Ok(terminal) => {
                self.terminal = Some(Arc::new(terminal));
                true
            }
            Err(e) => {
                tracing::error!("{}: {}", self.label, e);
                false
            }
        }
    }

    fn start(&mut self, entrypoint: Option<String>, command: Vec<String>) -> bool {
        let Some(input) = self.input_rx.take() else {
            tracing::warn!("{}: session already started", self.label);
            return false;
        };

        let task = SessionTask {
            label: self.label.clone(),
            policy: Arc::clone(&self.policy),
            router: Arc::clone(&self.router),
            sink: Arc::clone(&self.sink),
            banner: self.banner.clone(),
            terminal: self.terminal.clone(),
            cancel: self.cancel.clone(),
        };
        self.session = Some(tokio::spawn(task.run(entrypoint, command, input)));
        true
    }
}

impl Drop for ChannelDispatcher {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Everything a started session needs, moved into its task
struct SessionTask {
    label: String,
    policy: Arc<Mutex<SessionPolicy>>,
    router: Arc<ContainerRouter>,
    sink: Arc<dyn ChannelSink>,
    banner: Option<String>,
    terminal: Option<Arc<Terminal>>,
    cancel: CancellationToken,
}

impl SessionTask {
    async fn run(self, entrypoint: Option<String>, command: Vec<String>, input: InputReceiver) {
        let policy = self.policy.lock().await.clone();

        let invocation = match self.router.route(&policy, entrypoint.as_deref(), command).await {
            Ok(invocation) => invocation,
            Err(e) => {
                tracing::error!("{}: cannot route {}: {}", self.label, policy.image_name, e);
                self.abort().await;
                return;
            }
        };

        tracing::info!(
            "{}: {} as {} via {:?}: {}",
            self.label,
            policy.image_name,
            policy.remote_user,
            invocation.route,
            invocation.command_line()
        );
        tracing::debug!("{}: environment {}", self.label, policy.env.list().join(" "));

        if let Some(banner) = &self.banner {
            let _ = self.sink.data(render_banner(banner).as_bytes()).await;
        }

        let result = match &self.terminal {
            Some(terminal) => {
                relay::run_with_terminal(
                    &invocation,
                    Arc::clone(terminal),
                    Arc::clone(&self.sink),
                    input,
                    self.cancel.clone(),
                )
                .await
            }
            None => {
                relay::run_with_pipes(&invocation, Arc::clone(&self.sink), input, self.cancel.clone())
                    .await
            }
        };

        match result {
            Ok(outcome) => tracing::info!(
                "{}: session ended ({:?}, exit code {:?})",
                self.label,
                outcome.completion,
                outcome.exit_code
            ),
            Err(e) => {
                tracing::warn!("{}: failed to start {}: {}", self.label, invocation.program, e);
                self.abort().await;
            }
        }
    }

    async fn abort(&self) {
        if let Some(terminal) = &self.terminal {
            terminal.release();
        }
        let _ = self.sink.close().await;
    }
}
