//! Container routing against an in-memory runtime

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use dg_core::{Environment, SessionPolicy};
use dg_gateway::router::{
    cleanup, ContainerFilter, ContainerRouter, ContainerRuntime, Route, RouterSettings,
};
use dg_gateway::RouterError;

/// Containers are `(id, user, image, running)`
#[derive(Default)]
struct FakeRuntime {
    containers: Mutex<Vec<(String, String, String, bool)>>,
    queries: Mutex<Vec<ContainerFilter>>,
    calls: Mutex<Vec<String>>,
    fail: bool,
}

impl FakeRuntime {
    fn with(containers: &[(&str, &str, &str, bool)]) -> Self {
        Self {
            containers: Mutex::new(
                containers
                    .iter()
                    .map(|(id, user, image, running)| {
                        (id.to_string(), user.to_string(), image.to_string(), *running)
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn program(&self) -> &Path {
        Path::new("docker")
    }

    async fn find_running(
        &self,
        filter: &ContainerFilter,
        _env: &Environment,
    ) -> Result<Vec<String>, RouterError> {
        if self.fail {
            return Err(RouterError::Runtime("daemon unreachable".to_string()));
        }
        self.queries.lock().unwrap().push(filter.clone());
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, user, image, running)| *running && *user == filter.user && *image == filter.image)
            .map(|(id, ..)| id.clone())
            .collect())
    }

    async fn list_managed(&self, all: bool) -> Result<Vec<String>, RouterError> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .iter()
            .filter(|(.., running)| all || *running)
            .map(|(id, ..)| id.clone())
            .collect())
    }

    async fn kill(&self, id: &str) -> Result<(), RouterError> {
        self.calls.lock().unwrap().push(format!("kill {}", id));
        let mut containers = self.containers.lock().unwrap();
        for container in containers.iter_mut().filter(|c| c.0 == id) {
            container.3 = false;
        }
        Ok(())
    }

    async fn remove(&self, id: &str) -> Result<(), RouterError> {
        self.calls.lock().unwrap().push(format!("rm {}", id));
        if id == "stuck" {
            return Err(RouterError::Runtime("removal in progress".to_string()));
        }
        self.containers.lock().unwrap().retain(|c| c.0 != id);
        Ok(())
    }
}

fn settings() -> RouterSettings {
    RouterSettings {
        default_shell: "/bin/sh".to_string(),
        run_args: "-it --rm".to_string(),
        exec_args: "-it".to_string(),
        no_join: false,
    }
}

fn router(runtime: FakeRuntime, settings: RouterSettings) -> (ContainerRouter, Arc<FakeRuntime>) {
    let runtime = Arc::new(runtime);
    (
        ContainerRouter::new(Arc::clone(&runtime) as Arc<dyn ContainerRuntime>, settings),
        runtime,
    )
}

fn policy(image: &str, remote_user: &str) -> SessionPolicy {
    let mut policy = SessionPolicy::new(image, None);
    policy.remote_user = remote_user.to_string();
    policy
}

fn strings(words: &[&str]) -> Vec<String> {
    words.iter().map(|w| w.to_string()).collect()
}

#[tokio::test]
async fn test_joins_running_container() {
    let (router, runtime) = router(
        FakeRuntime::with(&[("abc123", "bob", "alpine", true)]),
        settings(),
    );

    let invocation = router
        .route(&policy("alpine", "bob"), None, Vec::new())
        .await
        .unwrap();

    assert_eq!(invocation.route, Route::Join("abc123".to_string()));
    assert_eq!(invocation.program, "docker");
    assert_eq!(invocation.args, strings(&["exec", "-it", "abc123", "/bin/sh"]));

    let queries = runtime.queries.lock().unwrap();
    assert_eq!(
        queries.as_slice(),
        &[ContainerFilter {
            user: "bob".to_string(),
            image: "alpine".to_string()
        }]
    );
}

#[tokio::test]
async fn test_joins_first_of_several() {
    let (router, _) = router(
        FakeRuntime::with(&[
            ("first", "bob", "alpine", true),
            ("second", "bob", "alpine", true),
        ]),
        settings(),
    );

    let invocation = router
        .route(&policy("alpine", "bob"), None, strings(&["ls"]))
        .await
        .unwrap();
    assert_eq!(invocation.route, Route::Join("first".to_string()));
}

#[tokio::test]
async fn test_launches_when_nothing_matches() {
    let (router, _) = router(
        FakeRuntime::with(&[
            ("stopped", "bob", "alpine", false),
            ("other", "alice", "alpine", true),
        ]),
        settings(),
    );

    let invocation = router
        .route(&policy("alpine", "bob"), None, strings(&["uname", "-a"]))
        .await
        .unwrap();

    assert_eq!(invocation.route, Route::Launch);
    assert_eq!(
        invocation.args,
        strings(&[
            "run",
            "-it",
            "--rm",
            "--label=dockgate",
            "--label=user=bob",
            "--label=image=alpine",
            "alpine",
            "uname",
            "-a",
        ])
    );
}

#[tokio::test]
async fn test_launch_with_user_and_entrypoint() {
    let (router, _) = router(FakeRuntime::default(), settings());
    let mut policy = policy("ubuntu:trusty", "carol");
    policy.user = Some("1000".to_string());

    let invocation = router
        .route(&policy, Some("/bin/bash"), strings(&["-l"]))
        .await
        .unwrap();

    assert_eq!(
        invocation.args,
        strings(&[
            "run",
            "-it",
            "--rm",
            "--label=dockgate",
            "--label=user=carol",
            "--label=image=ubuntu:trusty",
            "-u",
            "1000",
            "--entrypoint",
            "/bin/bash",
            "ubuntu:trusty",
            "-l",
        ])
    );
}

#[tokio::test]
async fn test_join_places_entrypoint_before_command() {
    let (router, _) = router(FakeRuntime::with(&[("c1", "bob", "alpine", true)]), settings());

    let invocation = router
        .route(&policy("alpine", "bob"), Some("/bin/bash"), strings(&["-c", "id"]))
        .await
        .unwrap();
    assert_eq!(
        invocation.args,
        strings(&["exec", "-it", "c1", "/bin/bash", "-c", "id"])
    );
}

#[tokio::test]
async fn test_no_join_always_launches() {
    let mut settings = settings();
    settings.no_join = true;
    let (router, runtime) = router(FakeRuntime::with(&[("abc", "bob", "alpine", true)]), settings);

    let invocation = router
        .route(&policy("alpine", "bob"), None, Vec::new())
        .await
        .unwrap();

    assert_eq!(invocation.route, Route::Launch);
    assert!(runtime.queries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_local_session_skips_runtime() {
    let (router, runtime) = router(FakeRuntime::failing(), settings());
    let mut policy = policy("host", "bob");
    policy.is_local = true;
    policy.env.set("TERM", "xterm");
    policy.env.set("EMPTY", "");

    let invocation = router.route(&policy, None, strings(&["ls", "-l"])).await.unwrap();
    assert_eq!(invocation.route, Route::Local);
    assert_eq!(invocation.program, "ls");
    assert_eq!(invocation.args, strings(&["-l"]));
    assert_eq!(invocation.env, vec![("TERM".to_string(), "xterm".to_string())]);

    let shell = router.route(&policy, None, Vec::new()).await.unwrap();
    assert_eq!(shell.program, "/bin/sh");
    assert!(shell.args.is_empty());

    let with_entrypoint = router
        .route(&policy, Some("/usr/bin/env"), strings(&["id"]))
        .await
        .unwrap();
    assert_eq!(with_entrypoint.program, "/usr/bin/env");
    assert_eq!(with_entrypoint.args, strings(&["id"]));

    assert!(runtime.queries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_inline_args_are_templated_then_split() {
    let mut settings = settings();
    settings.run_args = r#"--rm --name "box {{.RemoteUser}}" -e IMG={{.ImageName}}"#.to_string();
    let (router, _) = router(FakeRuntime::default(), settings);

    let invocation = router
        .route(&policy("alpine", "bob"), None, Vec::new())
        .await
        .unwrap();

    assert_eq!(
        &invocation.args[..6],
        &strings(&["run", "--rm", "--name", "box bob", "-e", "IMG=alpine"])[..]
    );
}

#[tokio::test]
async fn test_policy_args_are_templated_one_by_one() {
    let (router, _) = router(FakeRuntime::default(), settings());
    let mut policy = policy("alpine", "bob");
    policy.docker_run_args = strings(&["--hostname", "{{.RemoteUser}} box", "--rm"]);

    let invocation = router.route(&policy, None, Vec::new()).await.unwrap();
    assert_eq!(
        &invocation.args[..4],
        &strings(&["run", "--hostname", "bob box", "--rm"])[..]
    );
}

#[tokio::test]
async fn test_template_error_fails_routing() {
    let mut settings = settings();
    settings.exec_args = "-it {{.NoSuchField}}".to_string();
    let (router, _) = router(FakeRuntime::with(&[("abc", "bob", "alpine", true)]), settings);

    let err = router
        .route(&policy("alpine", "bob"), None, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Template(_)));
}

#[tokio::test]
async fn test_runtime_failure_fails_routing() {
    let (router, _) = router(FakeRuntime::failing(), settings());

    let err = router
        .route(&policy("alpine", "bob"), None, Vec::new())
        .await
        .unwrap_err();
    assert!(matches!(err, RouterError::Runtime(_)));
}

#[tokio::test]
async fn test_cleanup_kills_then_removes() {
    let runtime = FakeRuntime::with(&[
        ("live", "bob", "alpine", true),
        ("dead", "bob", "alpine", false),
        ("stuck", "alice", "debian", false),
    ]);

    let report = cleanup(&runtime).await.unwrap();
    assert_eq!(report.killed, 1);
    assert_eq!(report.removed, 2);

    let calls = runtime.calls.lock().unwrap();
    assert_eq!(calls[0], "kill live");
    assert!(calls.contains(&"rm stuck".to_string()));
    assert_eq!(
        runtime.containers.lock().unwrap().len(),
        1,
        "only the container that refused removal is left"
    );
}
