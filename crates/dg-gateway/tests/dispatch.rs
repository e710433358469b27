//! Channel dispatch and relay tests with local sessions
#![cfg(unix)]

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use dg_core::{Environment, SessionPolicy};
use dg_gateway::dispatch::ChannelDispatcher;
use dg_gateway::relay::{self, ChannelSink, Completion, Terminal, STDERR_STREAM};
use dg_gateway::router::{
    ContainerFilter, ContainerRouter, ContainerRuntime, Invocation, Route, RouterSettings,
};
use dg_gateway::{RelayError, RouterError};
use dg_protocol::{ChannelRequest, PtyRequest, WindowSize};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Data(Vec<u8>),
    Extended(u32, Vec<u8>),
    ExitStatus(u32),
    Eof,
    Close,
}

#[derive(Default)]
struct RecordingSink {
    events: StdMutex<Vec<Event>>,
}

impl RecordingSink {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn stdout(&self) -> String {
        let bytes: Vec<u8> = self
            .events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Data(d) => Some(d),
                _ => None,
            })
            .flatten()
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    fn closes(&self) -> usize {
        self.events().iter().filter(|e| **e == Event::Close).count()
    }

    fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }
}

#[async_trait]
impl ChannelSink for RecordingSink {
    async fn data(&self, data: &[u8]) -> Result<(), RelayError> {
        self.push(Event::Data(data.to_vec()));
        Ok(())
    }

    async fn extended_data(&self, code: u32, data: &[u8]) -> Result<(), RelayError> {
        self.push(Event::Extended(code, data.to_vec()));
        Ok(())
    }

    async fn exit_status(&self, code: u32) -> Result<(), RelayError> {
        self.push(Event::ExitStatus(code));
        Ok(())
    }

    async fn eof(&self) -> Result<(), RelayError> {
        self.push(Event::Eof);
        Ok(())
    }

    async fn close(&self) -> Result<(), RelayError> {
        self.push(Event::Close);
        Ok(())
    }
}

/// Runtime that cannot be reached
struct Unreachable;

#[async_trait]
impl ContainerRuntime for Unreachable {
    fn program(&self) -> &std::path::Path {
        std::path::Path::new("docker")
    }

    async fn find_running(&self, _: &ContainerFilter, _: &Environment) -> Result<Vec<String>, RouterError> {
        Err(RouterError::Runtime("daemon unreachable".to_string()))
    }

    async fn list_managed(&self, _: bool) -> Result<Vec<String>, RouterError> {
        Err(RouterError::Runtime("daemon unreachable".to_string()))
    }

    async fn kill(&self, _: &str) -> Result<(), RouterError> {
        Ok(())
    }

    async fn remove(&self, _: &str) -> Result<(), RouterError> {
        Ok(())
    }
}

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

struct Fixture {
    dispatcher: ChannelDispatcher,
    policy: Arc<Mutex<SessionPolicy>>,
    sink: Arc<RecordingSink>,
}

fn fixture(local: bool, banner: Option<&str>) -> Fixture {
    let policy = if local {
        SessionPolicy::new("host", Some("host"))
    } else {
        SessionPolicy::new("alpine", Some("host"))
    };
    let policy = Arc::new(Mutex::new(policy));
    let router = Arc::new(ContainerRouter::new(
        Arc::new(Unreachable),
        RouterSettings {
            default_shell: "/bin/sh".to_string(),
            run_args: "-it --rm".to_string(),
            exec_args: "-it".to_string(),
            no_join: false,
        },
    ));
    let sink = Arc::new(RecordingSink::default());
    let dispatcher = ChannelDispatcher::new(
        "test",
        Arc::clone(&policy),
        router,
        Arc::clone(&sink) as Arc<dyn ChannelSink>,
        banner.map(str::to_owned),
    );
    Fixture {
        dispatcher,
        policy,
        sink,
    }
}

async fn exec(fixture: &mut Fixture, command: &str) -> bool {
    fixture
        .dispatcher
        .dispatch(ChannelRequest::Exec {
            command: command.to_string(),
        })
        .await
}

async fn finish(fixture: &mut Fixture) {
    tokio::time::timeout(TEST_TIMEOUT, fixture.dispatcher.wait())
        .await
        .expect("session did not finish");
}

#[tokio::test]
async fn test_exec_relays_output_and_exit_status() {
    let mut f = fixture(true, None);

    assert!(exec(&mut f, "/bin/echo hi").await);
    finish(&mut f).await;

    assert_eq!(f.sink.stdout(), "hi\n");
    let events = f.sink.events();
    let tail = &events[events.len() - 3..];
    assert_eq!(tail, &[Event::ExitStatus(0), Event::Eof, Event::Close]);
    assert_eq!(f.sink.closes(), 1);
}

#[tokio::test]
async fn test_stderr_goes_to_extended_data() {
    let mut f = fixture(true, None);

    assert!(exec(&mut f, "/bin/sh -c 'echo oops >&2; exit 3'").await);
    finish(&mut f).await;

    let events = f.sink.events();
    assert!(events.contains(&Event::Extended(STDERR_STREAM, b"oops\n".to_vec())));
    assert!(events.contains(&Event::ExitStatus(3)));
    assert_eq!(f.sink.stdout(), "");
}

#[tokio::test]
async fn test_input_reaches_process() {
    let mut f = fixture(true, None);

    assert!(exec(&mut f, "cat").await);
    f.dispatcher.input(b"ping\n");
    f.dispatcher.close_input();
    finish(&mut f).await;

    assert_eq!(f.sink.stdout(), "ping\n");
    assert!(f.sink.events().contains(&Event::ExitStatus(0)));
}

#[tokio::test]
async fn test_banner_precedes_output() {
    let mut f = fixture(true, Some("Welcome\nto dockgate"));

    assert!(exec(&mut f, "/bin/echo hi").await);
    finish(&mut f).await;

    assert_eq!(f.sink.events()[0], Event::Data(b"Welcome\n\rto dockgate\n\r".to_vec()));
    assert!(f.sink.stdout().ends_with("hi\n"));
}

#[tokio::test]
async fn test_shell_runs_policy_command() {
    let mut f = fixture(true, None);
    f.policy.lock().await.command = vec!["/bin/echo".to_string(), "from-policy".to_string()];

    assert!(f.dispatcher.dispatch(ChannelRequest::Shell).await);
    finish(&mut f).await;

    assert_eq!(f.sink.stdout(), "from-policy\n");
}

#[tokio::test]
async fn test_env_request_reaches_process() {
    let mut f = fixture(true, None);

    let ok = f
        .dispatcher
        .dispatch(ChannelRequest::Env {
            name: "GREETING".to_string(),
            value: "hello".to_string(),
        })
        .await;
    assert!(ok);
    assert_eq!(f.policy.lock().await.env.get("GREETING"), Some("hello"));

    assert!(exec(&mut f, "/bin/sh -c 'echo $GREETING'").await);
    finish(&mut f).await;
    assert_eq!(f.sink.stdout(), "hello\n");
}

#[tokio::test]
async fn test_second_start_is_rejected() {
    let mut f = fixture(true, None);

    assert!(exec(&mut f, "/bin/echo once").await);
    assert!(!exec(&mut f, "/bin/echo twice").await);
    assert!(!f.dispatcher.dispatch(ChannelRequest::Shell).await);
    finish(&mut f).await;

    assert_eq!(f.sink.stdout(), "once\n");
    assert_eq!(f.sink.closes(), 1);
}

#[tokio::test]
async fn test_unparseable_exec_is_rejected() {
    let mut f = fixture(true, None);

    assert!(!exec(&mut f, "echo 'unterminated").await);
    assert!(!f.dispatcher.is_running());
    // The channel can still start a session afterwards
    assert!(exec(&mut f, "/bin/true").await);
    finish(&mut f).await;
}

#[tokio::test]
async fn test_unknown_and_malformed_requests() {
    let mut f = fixture(true, None);

    assert!(!f.dispatcher.dispatch(ChannelRequest::Other("x11-req".to_string())).await);
    assert!(!f.dispatcher.dispatch_raw("subsystem", b"\0\0\0\x04sftp").await);

    // env value length runs past the payload
    let mut payload = Vec::new();
    payload.extend_from_slice(&4u32.to_be_bytes());
    payload.extend_from_slice(b"TERM");
    payload.extend_from_slice(&50u32.to_be_bytes());
    payload.extend_from_slice(b"xterm");
    assert!(!f.dispatcher.dispatch_raw("env", &payload).await);

    // A well-formed raw env request is applied
    let request = ChannelRequest::Env {
        name: "LANG".to_string(),
        value: "C.UTF-8".to_string(),
    };
    assert!(f.dispatcher.dispatch_raw("env", &request.encode()).await);
    assert_eq!(f.policy.lock().await.env.get("LANG"), Some("C.UTF-8"));

    assert!(f.sink.events().is_empty());
}

#[tokio::test]
async fn test_window_change_without_terminal() {
    let mut f = fixture(true, None);
    assert!(f.dispatcher.dispatch(ChannelRequest::WindowChange(WindowSize::new(100, 30))).await);
    assert!(f.dispatcher.terminal().is_none());
}

#[tokio::test]
async fn test_routing_failure_closes_channel() {
    let mut f = fixture(false, None);

    // The request is accepted; the failure surfaces as a closed channel
    assert!(exec(&mut f, "/bin/echo hi").await);
    finish(&mut f).await;

    assert_eq!(f.sink.events(), vec![Event::Close]);
}

#[tokio::test]
async fn test_spawn_failure_closes_channel() {
    let mut f = fixture(true, None);

    assert!(exec(&mut f, "/nonexistent/program").await);
    finish(&mut f).await;

    assert_eq!(f.sink.events(), vec![Event::Close]);
}

#[tokio::test]
async fn test_pty_session() {
    let mut f = fixture(true, None);

    let ok = f
        .dispatcher
        .dispatch(ChannelRequest::PtyReq(PtyRequest {
            term: "xterm-256color".to_string(),
            size: WindowSize::new(80, 24),
            modes: Vec::new(),
        }))
        .await;
    assert!(ok);
    {
        let policy = f.policy.lock().await;
        assert!(policy.use_tty);
        assert_eq!(policy.env.get("TERM"), Some("xterm-256color"));
    }

    let terminal = Arc::clone(f.dispatcher.terminal().expect("terminal opened"));
    assert!(f.dispatcher.dispatch(ChannelRequest::WindowChange(WindowSize::new(120, 40))).await);
    assert_eq!(terminal.size(), WindowSize::new(120, 40));

    assert!(exec(&mut f, "/bin/sh -c 'echo $TERM'").await);
    finish(&mut f).await;

    assert!(f.sink.stdout().contains("xterm-256color"));
    assert!(f.sink.events().contains(&Event::ExitStatus(0)));
    assert_eq!(f.sink.closes(), 1);
    assert!(terminal.is_released());
}

#[tokio::test]
async fn test_dropping_dispatcher_cancels_session() {
    let f = fixture(true, None);
    let Fixture {
        mut dispatcher,
        sink,
        ..
    } = f;

    assert!(
        dispatcher
            .dispatch(ChannelRequest::Exec {
                command: "sleep 30".to_string()
            })
            .await
    );
    tokio::time::sleep(Duration::from_millis(200)).await;
    drop(dispatcher);

    let closed = tokio::time::timeout(TEST_TIMEOUT, async {
        while sink.closes() == 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(closed.is_ok());
    assert!(!sink.events().iter().any(|e| matches!(e, Event::ExitStatus(_))));
    assert_eq!(sink.closes(), 1);
}

#[tokio::test]
async fn test_pipes_outcome() {
    let sink = Arc::new(RecordingSink::default());
    let (_tx, rx) = mpsc::unbounded_channel();
    let invocation = Invocation {
        program: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), "exit 7".to_string()],
        env: Vec::new(),
        route: Route::Local,
    };

    let outcome = relay::run_with_pipes(
        &invocation,
        Arc::clone(&sink) as Arc<dyn ChannelSink>,
        rx,
        CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.completion, Completion::Exited);
    assert_eq!(outcome.exit_code, Some(7));
    assert_eq!(sink.events(), vec![Event::ExitStatus(7), Event::Eof, Event::Close]);
}

#[tokio::test]
async fn test_pipes_spawn_error() {
    let sink = Arc::new(RecordingSink::default());
    let (_tx, rx) = mpsc::unbounded_channel();
    let invocation = Invocation {
        program: "/nonexistent/program".to_string(),
        args: Vec::new(),
        env: Vec::new(),
        route: Route::Local,
    };

    let err = relay::run_with_pipes(&invocation, sink.clone(), rx, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Spawn { .. }));
    assert!(sink.events().is_empty());
}

async fn open_pty(fixture: &mut Fixture) {
    let ok = fixture
        .dispatcher
        .dispatch(ChannelRequest::PtyReq(PtyRequest {
            term: "xterm".to_string(),
            size: WindowSize::new(80, 24),
            modes: Vec::new(),
        }))
        .await;
    assert!(ok);
}

#[tokio::test]
async fn test_pty_input_eof_tears_down_once() {
    let mut f = fixture(true, None);
    open_pty(&mut f).await;

    assert!(exec(&mut f, "sleep 30").await);
    tokio::time::sleep(Duration::from_millis(200)).await;
    f.dispatcher.close_input();
    finish(&mut f).await;

    let events = f.sink.events();
    assert!(!events.iter().any(|e| matches!(e, Event::ExitStatus(_))));
    assert_eq!(&events[events.len() - 2..], &[Event::Eof, Event::Close]);
    assert_eq!(f.sink.closes(), 1);
}

fn local_invocation(script: &str) -> Invocation {
    Invocation {
        program: "/bin/sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        env: Vec::new(),
        route: Route::Local,
    }
}

#[tokio::test]
async fn test_terminal_input_closed_first() {
    let sink = Arc::new(RecordingSink::default());
    let terminal = Arc::new(Terminal::open(WindowSize::new(80, 24)).unwrap());
    let (tx, rx) = mpsc::unbounded_channel();
    drop(tx);

    let outcome = tokio::time::timeout(
        TEST_TIMEOUT,
        relay::run_with_terminal(
            &local_invocation("exec sleep 30"),
            Arc::clone(&terminal),
            Arc::clone(&sink) as Arc<dyn ChannelSink>,
            rx,
            CancellationToken::new(),
        ),
    )
    .await
    .expect("relay did not finish")
    .unwrap();

    assert_eq!(outcome.completion, Completion::InputClosed);
    assert_eq!(outcome.exit_code, None);
    assert!(!sink.events().iter().any(|e| matches!(e, Event::ExitStatus(_))));
    assert_eq!(sink.closes(), 1);
    assert!(terminal.is_released());
}

#[tokio::test]
async fn test_terminal_output_closed_first() {
    let sink = Arc::new(RecordingSink::default());
    let terminal = Arc::new(Terminal::open(WindowSize::new(80, 24)).unwrap());
    // Keep input open so only the output side can finish first
    let (_tx, rx) = mpsc::unbounded_channel();

    // The process lets go of the terminal but keeps running
    let outcome = tokio::time::timeout(
        TEST_TIMEOUT,
        relay::run_with_terminal(
            &local_invocation("exec sleep 30 </dev/null >/dev/null 2>&1"),
            Arc::clone(&terminal),
            Arc::clone(&sink) as Arc<dyn ChannelSink>,
            rx,
            CancellationToken::new(),
        ),
    )
    .await
    .expect("relay did not finish")
    .unwrap();

    assert_eq!(outcome.completion, Completion::OutputClosed);
    assert_eq!(outcome.exit_code, None);
    let events = sink.events();
    assert!(!events.iter().any(|e| matches!(e, Event::ExitStatus(_))));
    assert_eq!(&events[events.len() - 2..], &[Event::Eof, Event::Close]);
    assert_eq!(sink.closes(), 1);
    assert!(terminal.is_released());
}
