//! Terminal relay
//!
//! Pumps bytes between an SSH channel and a session process, then tears the
//! session down exactly once.
//!
//! With a terminal, three sibling tasks run: channel input to the PTY,
//! PTY output to the channel, and the process wait. Whichever finishes first
//! fires the [`CompletionGate`]. Without a terminal, stdout/stderr are piped
//! to channel data and extended data, and only process exit fires the gate.
//!
//! Teardown, driven by a single supervisor: give trailing output a moment,
//! collect the exit status (killing the process if it is still running),
//! send `exit-status`, EOF, close, and release the terminal.

mod gate;
mod sink;
mod terminal;

pub use gate::CompletionGate;
pub use sink::{ChannelSink, SessionSink, STDERR_STREAM};
pub use terminal::{PtyProcess, Terminal};

use std::io::{Read, Write};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use portable_pty::ChildKiller;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::router::Invocation;

/// How long teardown waits for trailing output and for the exit status
pub const DRAIN_GRACE: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 8192;

/// Channel input as delivered by the SSH handler; closed on channel EOF
pub type InputReceiver = mpsc::UnboundedReceiver<Vec<u8>>;

/// What ended a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The process exited
    Exited,
    /// The terminal output reached EOF
    OutputClosed,
    /// The client closed its input
    InputClosed,
    /// The channel went away
    Cancelled,
}

/// Result of a finished relay
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    /// First completion reported
    pub completion: Completion,
    /// Exit code, when the process exited on its own
    pub exit_code: Option<u32>,
}

enum Killer {
    Pty(Box<dyn ChildKiller + Send + Sync>),
    Signal(oneshot::Sender<()>),
}

impl Killer {
    fn kill(self) {
        match self {
            Killer::Pty(mut killer) => {
                if let Err(e) = killer.kill() {
                    tracing::debug!("Failed to kill PTY process: {}", e);
                }
            }
            Killer::Signal(tx) => {
                let _ = tx.send(());
            }
        }
    }
}

/// Tasks of a running session, handed to the supervisor
struct Running {
    completion_rx: oneshot::Receiver<Completion>,
    exit_rx: oneshot::Receiver<Option<u32>>,
    outputs: Vec<JoinHandle<()>>,
    input: JoinHandle<()>,
    killer: Killer,
}

/// Run `invocation` on `terminal` until the session ends
pub async fn run_with_terminal(
    invocation: &Invocation,
    terminal: Arc<Terminal>,
    sink: Arc<dyn ChannelSink>,
    input: InputReceiver,
    cancel: CancellationToken,
) -> Result<RelayOutcome, RelayError> {
    let process = terminal.spawn(invocation)?;
    let PtyProcess {
        mut child,
        reader,
        writer,
    } = process;

    let (gate, completion_rx) = CompletionGate::new();
    let gate = Arc::new(gate);
    let killer = Killer::Pty(child.clone_killer());

    // PTY -> channel
    let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(64);
    let _reader = spawn_pty_reader(reader, out_tx);
    let output = {
        let sink = Arc::clone(&sink);
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if sink.data(&data).await.is_err() {
                    break;
                }
            }
            gate.trigger(Completion::OutputClosed);
        })
    };

    // channel -> PTY
    let input = {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            pump_pty_input(input, writer).await;
            gate.trigger(Completion::InputClosed);
        })
    };

    // process wait
    let (exit_tx, exit_rx) = oneshot::channel();
    {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            let code = match tokio::task::spawn_blocking(move || child.wait()).await {
                Ok(Ok(status)) => Some(status.exit_code()),
                Ok(Err(e)) => {
                    tracing::warn!("Failed to wait for PTY process: {}", e);
                    None
                }
                Err(e) => {
                    tracing::warn!("PTY wait task failed: {}", e);
                    None
                }
            };
            let _ = exit_tx.send(code);
            gate.trigger(Completion::Exited);
        });
    }

    let running = Running {
        completion_rx,
        exit_rx,
        outputs: vec![output],
        input,
        killer,
    };
    let outcome = supervise(running, sink.as_ref(), cancel).await;
    terminal.release();
    Ok(outcome)
}

/// Run `invocation` with piped stdio until the process exits
pub async fn run_with_pipes(
    invocation: &Invocation,
    sink: Arc<dyn ChannelSink>,
    mut input: InputReceiver,
    cancel: CancellationToken,
) -> Result<RelayOutcome, RelayError> {
    let mut child = tokio::process::Command::new(&invocation.program)
        .args(&invocation.args)
        .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| RelayError::Spawn {
            program: invocation.program.clone(),
            reason: e.to_string(),
        })?;

    tracing::debug!("Spawned {:?} with pipes", child.id());

    let (gate, completion_rx) = CompletionGate::new();
    let gate = Arc::new(gate);

    let mut outputs = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        outputs.push(spawn_pipe_reader(stdout, Arc::clone(&sink), None));
    }
    if let Some(stderr) = child.stderr.take() {
        outputs.push(spawn_pipe_reader(stderr, Arc::clone(&sink), Some(STDERR_STREAM)));
    }

    // channel -> stdin; EOF closes stdin but does not end the session
    let stdin = child.stdin.take();
    let input = tokio::spawn(async move {
        let Some(mut stdin) = stdin else { return };
        while let Some(chunk) = input.recv().await {
            if stdin.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = stdin.shutdown().await;
    });

    let (kill_tx, kill_rx) = oneshot::channel::<()>();
    let (exit_tx, exit_rx) = oneshot::channel();
    {
        let gate = Arc::clone(&gate);
        tokio::spawn(async move {
            let code = tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => status.code().map(|c| c as u32),
                    Err(e) => {
                        tracing::warn!("Failed to wait for process: {}", e);
                        None
                    }
                },
                _ = kill_rx => {
                    let _ = child.kill().await;
                    None
                }
            };
            let _ = exit_tx.send(code);
            gate.trigger(Completion::Exited);
        });
    }

    let running = Running {
        completion_rx,
        exit_rx,
        outputs,
        input,
        killer: Killer::Signal(kill_tx),
    };
    Ok(supervise(running, sink.as_ref(), cancel).await)
}

async fn supervise(running: Running, sink: &dyn ChannelSink, cancel: CancellationToken) -> RelayOutcome {
    let Running {
        completion_rx,
        mut exit_rx,
        outputs,
        input,
        killer,
    } = running;

    let completion = tokio::select! {
        // Every trigger holds a gate clone, so a dropped sender means all tasks are gone
        completion = completion_rx => completion.unwrap_or(Completion::OutputClosed),
        _ = cancel.cancelled() => Completion::Cancelled,
    };
    tracing::debug!("Session completed: {:?}", completion);

    let aborts: Vec<_> = outputs.iter().map(JoinHandle::abort_handle).collect();
    if tokio::time::timeout(DRAIN_GRACE, futures::future::join_all(outputs))
        .await
        .is_err()
    {
        tracing::debug!("Output still open after {:?}, dropping it", DRAIN_GRACE);
        for abort in aborts {
            abort.abort();
        }
    }

    let exit_code = match tokio::time::timeout(DRAIN_GRACE, &mut exit_rx).await {
        Ok(Ok(code)) => code,
        _ => {
            tracing::debug!("Process still running, killing it");
            killer.kill();
            None
        }
    };
    input.abort();

    if let Some(code) = exit_code {
        let _ = sink.exit_status(code).await;
    }
    let _ = sink.eof().await;
    if let Err(e) = sink.close().await {
        tracing::debug!("Channel close failed: {}", e);
    }

    RelayOutcome {
        completion,
        exit_code,
    }
}

fn spawn_pty_reader(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => {
                    tracing::debug!("PTY reader EOF");
                    break;
                }
                Ok(n) => {
                    if tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // EIO once the slave side is gone
                    tracing::debug!("PTY reader stopped: {}", e);
                    break;
                }
            }
        }
    })
}

async fn pump_pty_input(mut input: InputReceiver, mut writer: Box<dyn Write + Send>) {
    while let Some(chunk) = input.recv().await {
        let result = tokio::task::spawn_blocking(move || {
            let result = writer.write_all(&chunk).and_then(|_| writer.flush());
            (writer, result)
        })
        .await;

        match result {
            Ok((w, Ok(()))) => writer = w,
            Ok((_, Err(e))) => {
                tracing::debug!("PTY write failed: {}", e);
                return;
            }
            Err(e) => {
                tracing::warn!("PTY writer task failed: {}", e);
                return;
            }
        }
    }
    tracing::debug!("Channel input closed");
}

fn spawn_pipe_reader<R>(mut pipe: R, sink: Arc<dyn ChannelSink>, stream: Option<u32>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            };
            let sent = match stream {
                Some(code) => sink.extended_data(code, &buf[..n]).await,
                None => sink.data(&buf[..n]).await,
            };
            if sent.is_err() {
                break;
            }
        }
    })
}
