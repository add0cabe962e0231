//! Cell agent behaviour against real processes and an in-memory store.

use std::sync::Arc;
use std::time::{Duration, Instant};

use cellgrid_cell::{CellAgent, CellConfig, ChannelLogSink, Executor, LogMessage, LogStream, ProcessRuntime};
use cellgrid_state::*;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const LOCK: &str = "auctioneer";

struct TestCell {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
    logs: mpsc::UnboundedReceiver<LogMessage>,
    _root: tempfile::TempDir,
}

impl TestCell {
    async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

fn start_cell(store: &StateStore, cell_id: &str, memory_mb: i64) -> TestCell {
    let root = tempfile::tempdir().unwrap();
    let (sink, logs) = ChannelLogSink::new();
    let runtime = ProcessRuntime::new(root.path(), Arc::new(sink));
    let mut config = CellConfig::new(cell_id, "linux", memory_mb, 1024);
    config.heartbeat_interval = Duration::from_millis(100);
    config.poll_interval = Duration::from_millis(20);
    let agent = CellAgent::new(config, store.clone(), Executor::new(Arc::new(runtime))).unwrap();

    let (shutdown, rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        agent.run(rx).await.unwrap();
    });
    TestCell {
        shutdown,
        handle,
        logs,
        _root: root,
    }
}

async fn eventually<T>(what: &str, mut check: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(value) = check() {
            return value;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn resources(memory_mb: u64) -> ResourceRequest {
    ResourceRequest {
        memory_mb,
        disk_mb: 64,
        file_descriptors: 1024,
    }
}

fn hold_lease(store: &StateStore) {
    if store.get_lease(LOCK).unwrap().is_none() {
        store
            .write_lease(
                &LeaseRecord {
                    name: LOCK.to_string(),
                    owner: "test".to_string(),
                    term: 1,
                    expires_at: epoch_millis() + 600_000,
                },
                Expected::Absent,
            )
            .unwrap();
    }
}

/// Desire `task` and hand it straight to `cell_id`, bypassing the auction.
fn assign_task(store: &StateStore, cell_id: &str, task: Task) {
    let target = Placement::task(&task.task_guid);
    store.create_desired(&DesiredWorkload::Task(task)).unwrap();
    let request = store.get_auction_request(&target.work_key()).unwrap().unwrap();
    store
        .remove_auction_request(&target.work_key(), request.version)
        .unwrap();
    order(store, cell_id, Work::Start(target));
}

fn order(store: &StateStore, cell_id: &str, work: Work) {
    hold_lease(store);
    store
        .create_order(
            LOCK,
            &WorkOrder {
                cell_id: cell_id.to_string(),
                work,
                term: 1,
                issued_at: epoch_millis(),
            },
        )
        .unwrap();
}

fn task(guid: &str, steps: Vec<Step>) -> Task {
    Task::new(guid, "linux", resources(64), steps)
}

fn run(script: &str) -> Step {
    Step::new(Action::run(script))
}

async fn completed(store: &StateStore, guid: &str) -> Task {
    eventually("task completion", || {
        store
            .get_task(guid)
            .unwrap()
            .map(|t| t.value)
            .filter(|t| t.state == TaskState::Completed)
    })
    .await
}

#[tokio::test]
async fn env_vars_expand_in_order() {
    let store = StateStore::open_in_memory().unwrap();
    let cell = start_cell(&store, "cell-1", 1024);
    let step = Step::new(Action::Run {
        script: r#"test "$FOO" = "BAR-WIBBLE""#.to_string(),
        env: vec![
            EnvVar::new("FOO", "BAR"),
            EnvVar::new("BAZ", "WIBBLE"),
            EnvVar::new("FOO", "$FOO-$BAZ"),
        ],
    });
    assign_task(&store, "cell-1", task("env", vec![step]));

    let done = completed(&store, "env").await;
    assert!(!done.failed, "{:?}", done.failure_reason);
    assert_eq!(done.cell_id.as_deref(), Some("cell-1"));
    cell.stop().await;
}

#[tokio::test]
async fn exit_status_is_reported() {
    let store = StateStore::open_in_memory().unwrap();
    let cell = start_cell(&store, "cell-1", 1024);
    assign_task(&store, "cell-1", task("exit", vec![run("exit 3")]));

    let done = completed(&store, "exit").await;
    assert!(done.failed);
    assert_eq!(done.failure_reason.as_deref(), Some("Exited with status 3"));
    cell.stop().await;
}

#[tokio::test]
async fn out_of_memory_fails_fast() {
    let store = StateStore::open_in_memory().unwrap();
    let cell = start_cell(&store, "cell-1", 1024);
    let mut oom = task(
        "oom",
        vec![
            run("x=$(head -c 64000000 /dev/zero | tr '\\0' a); sleep 5"),
            run("exit 0"),
        ],
    );
    oom.resources.memory_mb = 10;
    assign_task(&store, "cell-1", oom);

    let done = completed(&store, "oom").await;
    assert!(done.failed);
    let reason = done.failure_reason.unwrap_or_default();
    assert!(reason.contains("out of memory"), "{reason}");
    cell.stop().await;
}

#[tokio::test]
async fn step_timeout_fails_the_task() {
    let store = StateStore::open_in_memory().unwrap();
    let cell = start_cell(&store, "cell-1", 1024);
    assign_task(
        &store,
        "cell-1",
        task("slow", vec![run("sleep 0.8").with_timeout_ms(500)]),
    );

    let done = completed(&store, "slow").await;
    assert!(done.failed);
    assert_eq!(done.failure_reason.as_deref(), Some("Timed out after 500ms"));
    cell.stop().await;
}

#[tokio::test]
async fn fetch_result_is_recorded() {
    let store = StateStore::open_in_memory().unwrap();
    let cell = start_cell(&store, "cell-1", 1024);
    assign_task(
        &store,
        "cell-1",
        task(
            "fetch",
            vec![
                run("printf 'tasty thingy\\n' > thingy"),
                Step::new(Action::FetchResult {
                    file: "thingy".to_string(),
                }),
            ],
        ),
    );

    let done = completed(&store, "fetch").await;
    assert!(!done.failed, "{:?}", done.failure_reason);
    assert_eq!(done.result.as_deref(), Some("tasty thingy\n"));
    cell.stop().await;
}

#[tokio::test]
async fn output_is_tagged_and_ordered() {
    let store = StateStore::open_in_memory().unwrap();
    let mut cell = start_cell(&store, "cell-1", 1024);
    let mut logged = task(
        "logs",
        vec![run("echo out A; echo out B; echo err A 1>&2; echo err B 1>&2")],
    );
    logged.log = LogConfig {
        guid: "log-guid".to_string(),
        source_name: "TASK".to_string(),
    };
    assign_task(&store, "cell-1", logged);
    completed(&store, "logs").await;

    let mut out = Vec::new();
    let mut err = Vec::new();
    while let Ok(message) = cell.logs.try_recv() {
        assert_eq!(message.guid, "log-guid");
        assert_eq!(message.source_name, "TASK");
        match message.stream {
            LogStream::Out => out.push(message.line),
            LogStream::Err => err.push(message.line),
        }
    }
    assert_eq!(out, vec!["out A", "out B"]);
    assert_eq!(err, vec!["err A", "err B"]);
    cell.stop().await;
}

#[tokio::test]
async fn downloads_into_the_sandbox() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/artifact"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .mount(&server)
        .await;

    let store = StateStore::open_in_memory().unwrap();
    let cell = start_cell(&store, "cell-1", 1024);
    assign_task(
        &store,
        "cell-1",
        task(
            "download",
            vec![
                Step::new(Action::Download {
                    from: format!("{}/artifact", server.uri()),
                    to: "artifact".to_string(),
                    extract: false,
                }),
                run(r#"test "$(cat artifact)" = hello"#),
            ],
        ),
    );

    let done = completed(&store, "download").await;
    assert!(!done.failed, "{:?}", done.failure_reason);
    cell.stop().await;
}

#[tokio::test]
async fn failed_download_names_the_action() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let store = StateStore::open_in_memory().unwrap();
    let cell = start_cell(&store, "cell-1", 1024);
    assign_task(
        &store,
        "cell-1",
        task(
            "missing",
            vec![Step::new(Action::Download {
                from: format!("{}/nope", server.uri()),
                to: "nope".to_string(),
                extract: false,
            })],
        ),
    );

    let done = completed(&store, "missing").await;
    assert!(done.failed);
    let reason = done.failure_reason.unwrap_or_default();
    assert!(reason.starts_with("Download failed"), "{reason}");
    cell.stop().await;
}

#[tokio::test]
async fn uploads_from_the_sandbox() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/upload"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let store = StateStore::open_in_memory().unwrap();
    let cell = start_cell(&store, "cell-1", 1024);
    assign_task(
        &store,
        "cell-1",
        task(
            "upload",
            vec![
                run("echo payload > out.txt"),
                Step::new(Action::Upload {
                    from: "out.txt".to_string(),
                    to: format!("{}/upload", server.uri()),
                }),
            ],
        ),
    );

    let done = completed(&store, "upload").await;
    assert!(!done.failed, "{:?}", done.failure_reason);
    let received = server.received_requests().await.unwrap_or_default();
    assert_eq!(received.len(), 1);
    assert!(!received[0].body.is_empty());
    cell.stop().await;
}

#[tokio::test]
async fn file_descriptor_limit_applies() {
    let store = StateStore::open_in_memory().unwrap();
    let cell = start_cell(&store, "cell-1", 1024);
    let mut limited = task("fds", vec![run("exec 3</dev/null; exec 4</dev/null; exec 5</dev/null")]);
    limited.resources.file_descriptors = 1;
    assign_task(&store, "cell-1", limited);

    let done = completed(&store, "fds").await;
    assert!(done.failed);
    cell.stop().await;
}

#[tokio::test]
async fn over_capacity_orders_go_back_to_auction() {
    let store = StateStore::open_in_memory().unwrap();
    let cell = start_cell(&store, "cell-1", 256);

    let mut first = task("first", vec![run("sleep 2")]);
    first.resources.memory_mb = 200;
    assign_task(&store, "cell-1", first);
    eventually("first task running", || {
        store
            .get_task("first")
            .unwrap()
            .filter(|t| t.value.state == TaskState::Running)
    })
    .await;

    let mut second = task("second", vec![run("exit 0")]);
    second.resources.memory_mb = 200;
    assign_task(&store, "cell-1", second);

    let target = Placement::task("second").work_key();
    eventually("second task handed back", || {
        store.get_auction_request(&target).unwrap()
    })
    .await;
    assert!(store.list_orders_for_cell("cell-1").unwrap().is_empty());
    assert_eq!(
        store.get_task("second").unwrap().unwrap().value.state,
        TaskState::Pending
    );
    cell.stop().await;
}

#[tokio::test]
async fn wrong_stack_is_rejected() {
    let store = StateStore::open_in_memory().unwrap();
    let cell = start_cell(&store, "cell-1", 1024);
    let mut foreign = task("foreign", vec![run("exit 0")]);
    foreign.stack = "windows".to_string();
    assign_task(&store, "cell-1", foreign);

    let target = Placement::task("foreign").work_key();
    eventually("foreign task handed back", || {
        store.get_auction_request(&target).unwrap()
    })
    .await;
    assert_eq!(
        store.get_task("foreign").unwrap().unwrap().value.state,
        TaskState::Pending
    );
    cell.stop().await;
}

fn desire_lrp(store: &StateStore, guid: &str, instances: u32, actions: Vec<Step>) {
    store
        .create_desired(&DesiredWorkload::Lrp(DesiredLrp {
            process_guid: guid.to_string(),
            stack: "linux".to_string(),
            resources: resources(64),
            actions,
            instances,
            routes: vec![],
            log: LogConfig::default(),
            created_at: epoch_millis(),
        }))
        .unwrap();
}

#[tokio::test]
async fn lrp_runs_and_stops_on_order() {
    let store = StateStore::open_in_memory().unwrap();
    let cell = start_cell(&store, "cell-1", 1024);
    desire_lrp(&store, "web", 1, vec![run("exit 0"), run("sleep 3600")]);
    order(&store, "cell-1", Work::Start(Placement::lrp("web", 0)));

    let running = eventually("instance running", || {
        store
            .get_actual("web", 0)
            .unwrap()
            .filter(|a| a.value.state == ActualState::Running)
    })
    .await;
    assert_eq!(running.value.cell_id, "cell-1");

    order(
        &store,
        "cell-1",
        Work::Stop {
            process_guid: "web".to_string(),
            index: 0,
            instance_guid: running.value.instance_guid.clone(),
        },
    );
    eventually("instance removed", || {
        store.get_actual("web", 0).unwrap().is_none().then_some(())
    })
    .await;
    cell.stop().await;
}

#[tokio::test]
async fn lrp_exit_is_a_crash() {
    let store = StateStore::open_in_memory().unwrap();
    let cell = start_cell(&store, "cell-1", 1024);
    desire_lrp(&store, "flaky", 1, vec![run("exit 0")]);
    order(&store, "cell-1", Work::Start(Placement::lrp("flaky", 0)));

    let crashed = eventually("instance crashed", || {
        store
            .get_actual("flaky", 0)
            .unwrap()
            .filter(|a| a.value.state == ActualState::Crashed)
    })
    .await;
    assert_eq!(
        crashed.value.crash_reason.as_deref(),
        Some("Exited with status 0")
    );
    cell.stop().await;
}

#[tokio::test]
async fn shutdown_withdraws_the_cell() {
    let store = StateStore::open_in_memory().unwrap();
    let cell = start_cell(&store, "cell-1", 1024);
    desire_lrp(&store, "web", 1, vec![run("sleep 3600")]);
    order(&store, "cell-1", Work::Start(Placement::lrp("web", 0)));
    eventually("instance running", || {
        store
            .get_actual("web", 0)
            .unwrap()
            .filter(|a| a.value.state == ActualState::Running)
    })
    .await;
    assert!(store.get_cell("cell-1").unwrap().is_some());

    cell.stop().await;
    assert!(store.get_cell("cell-1").unwrap().is_none());
    assert!(store.get_actual("web", 0).unwrap().is_none());
}

#[tokio::test]
async fn restart_clears_previous_records() {
    let store = StateStore::open_in_memory().unwrap();
    store
        .upsert_actual(
            &ActualInstance {
                process_guid: "web".to_string(),
                index: 0,
                instance_guid: "old".to_string(),
                cell_id: "cell-1".to_string(),
                state: ActualState::Running,
                crash_reason: None,
                since: 0,
            },
            Expected::Absent,
        )
        .unwrap();
    let orphan = task("orphan", vec![run("exit 0")]);
    store.create_desired(&DesiredWorkload::Task(orphan.clone())).unwrap();
    let pending = store.get_task("orphan").unwrap().unwrap();
    store
        .compare_and_swap_task("orphan", pending.version, &orphan.started_on("cell-1", 1))
        .unwrap();

    let cell = start_cell(&store, "cell-1", 1024);
    let done = completed(&store, "orphan").await;
    assert_eq!(
        done.failure_reason.as_deref(),
        Some("cell restarted before task completed")
    );
    assert!(store.get_actual("web", 0).unwrap().is_none());
    cell.stop().await;
}
