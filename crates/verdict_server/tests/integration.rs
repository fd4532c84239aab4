//! Integration tests for the Verdict server core.
//!
//! Each test assembles the full server state (dispatcher, auth,
//! registry, task manager) over a temporary configuration store and
//! drives the worker claim loop in-process, so the complete
//! allocate -> push -> claim -> run -> terminal path is exercised
//! without spawning OS processes.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::watch;
use verdict_protocol::{
    ApiError, ConnectionSpec, EchoParams, Permission, RpcRequest, RpcResponse, SchemaStatus,
    ServiceCall, StoreResultsParams, TaskFilter, TaskParams, TaskStatus, TaskToken,
};
use verdict_server::auth::{hash_password, AuthEngine};
use verdict_server::config::ServerConfig;
use verdict_server::dispatcher;
use verdict_server::reaper::Reaper;
use verdict_server::registry::ProductRegistry;
use verdict_server::server::ServerState;
use verdict_server::task_manager::TaskManager;
use verdict_store::{ConfigStore, ResultStore};
use verdict_worker::{DrainToken, Worker, WorkerConfig};

const SERVER_ID: &str = "srv-test";

struct Harness {
    dir: TempDir,
    store: ConfigStore,
    state: Arc<ServerState>,
    worker: Arc<Worker>,
    drain: DrainToken,
    #[allow(dead_code)]
    shutdown_tx: watch::Sender<bool>,
}

impl Harness {
    async fn new(auth_disabled: bool) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let store = ConfigStore::open(&dir.path().join("config.sqlite"))
            .await
            .expect("open config store");
        store.init().await.expect("init schema");

        let config = ServerConfig {
            server_id: SERVER_ID.to_string(),
            config_store_path: dir.path().join("config.sqlite"),
            scratch_root: dir.path().join("tasks"),
            auth_disabled,
            spawn_workers: false,
            ..Default::default()
        };

        let auth = AuthEngine::new(store.clone(), auth_disabled);
        let registry = ProductRegistry::new(store.clone());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tm = TaskManager::new(
            store.clone(),
            SERVER_ID.to_string(),
            config.scratch_root.clone(),
            config.queue_capacity,
            shutdown_rx,
        )
        .with_await_poll_interval(Duration::from_millis(25));

        let state = Arc::new(ServerState {
            store: store.clone(),
            auth,
            registry,
            tm,
            started_at: Instant::now(),
            config,
        });

        let drain = DrainToken::new();
        let worker = Arc::new(Worker::with_store(
            store.clone(),
            WorkerConfig {
                config_store_path: dir.path().join("config.sqlite"),
                server_id: SERVER_ID.to_string(),
                worker_id: "w-test".to_string(),
                poll_interval: Duration::from_millis(10),
            },
            drain.clone(),
        ));

        Self {
            dir,
            store,
            state,
            worker,
            drain,
            shutdown_tx,
        }
    }

    /// Run the worker claim loop in the background.
    fn spawn_worker(&self) {
        let worker = self.worker.clone();
        tokio::spawn(async move {
            let _ = worker.run().await;
        });
    }

    async fn call(&self, path: &str, call: ServiceCall) -> RpcResponse {
        self.call_as(None, path, call).await
    }

    async fn call_as(&self, session: Option<&str>, path: &str, call: ServiceCall) -> RpcResponse {
        dispatcher::dispatch(
            &self.state,
            RpcRequest {
                path: path.to_string(),
                session: session.map(str::to_string),
                call,
            },
        )
        .await
    }
}

fn echo(delay_ms: u64, fail_with: Option<&str>) -> TaskParams {
    TaskParams::Echo(EchoParams {
        delay_ms,
        check_interval_ms: 10,
        fail_with: fail_with.map(str::to_string),
    })
}

fn expect_token(response: RpcResponse) -> TaskToken {
    match response {
        RpcResponse::Token(token) => token,
        other => panic!("expected Token, got {other:?}"),
    }
}

fn expect_error(response: RpcResponse) -> ApiError {
    match response {
        RpcResponse::Error(err) => err,
        other => panic!("expected Error, got {other:?}"),
    }
}

async fn submit_echo(harness: &Harness, params: &TaskParams) -> TaskToken {
    let token = expect_token(
        harness
            .call(
                "/tasks",
                ServiceCall::AllocateTask {
                    summary: "demo".to_string(),
                    params: params.clone(),
                },
            )
            .await,
    );
    let response = harness
        .call(
            "/tasks",
            ServiceCall::PushTask {
                token,
                params: params.clone(),
            },
        )
        .await;
    assert!(matches!(response, RpcResponse::Ok), "push failed: {response:?}");
    token
}

// ============================================================================
// End-to-end scenarios
// ============================================================================

/// S1: allocate, push, and await a short echo task; it completes fast.
#[tokio::test]
async fn test_happy_path_completes_quickly() {
    let harness = Harness::new(true).await;
    harness.spawn_worker();

    let token = submit_echo(&harness, &echo(50, None)).await;

    let started = Instant::now();
    let response = harness
        .call(
            "/tasks",
            ServiceCall::AwaitTaskTermination {
                token,
                consume: false,
            },
        )
        .await;
    match response {
        RpcResponse::TerminalStatus(status) => assert_eq!(status, TaskStatus::Completed),
        other => panic!("expected TerminalStatus, got {other:?}"),
    }
    assert!(
        started.elapsed() < Duration::from_millis(500),
        "await took {:?}",
        started.elapsed()
    );
}

/// S2: a long task that checks `should_cancel` every 10ms concludes
/// CANCELLED shortly after an administrative cancel.
#[tokio::test]
async fn test_cancellation_honored() {
    let harness = Harness::new(true).await;
    harness.spawn_worker();

    let token = submit_echo(&harness, &echo(10_000, None)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response = harness
        .call("/tasks", ServiceCall::CancelTask { token })
        .await;
    assert!(matches!(response, RpcResponse::Bool(true)));

    let started = Instant::now();
    let response = harness
        .call(
            "/tasks",
            ServiceCall::AwaitTaskTermination {
                token,
                consume: false,
            },
        )
        .await;
    match response {
        RpcResponse::TerminalStatus(status) => assert_eq!(status, TaskStatus::Cancelled),
        other => panic!("expected TerminalStatus, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_millis(500));
}

/// S3: draining the worker mid-task raises the sentinel without an
/// administrative cancel; the terminal status is DROPPED.
#[tokio::test]
async fn test_shutdown_drain_drops_task() {
    let harness = Harness::new(true).await;
    harness.spawn_worker();

    let token = submit_echo(&harness, &echo(10_000, None)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    harness.drain.start_drain();

    let response = harness
        .call(
            "/tasks",
            ServiceCall::AwaitTaskTermination {
                token,
                consume: false,
            },
        )
        .await;
    match response {
        RpcResponse::TerminalStatus(status) => assert_eq!(status, TaskStatus::Dropped),
        other => panic!("expected TerminalStatus, got {other:?}"),
    }
}

/// S4: an implementation error concludes FAILED and leaves an
/// "unhandled: ..." system comment.
#[tokio::test]
async fn test_crash_during_execution_fails_with_comment() {
    let harness = Harness::new(true).await;
    harness.spawn_worker();

    let token = submit_echo(&harness, &echo(20, Some("boom"))).await;

    let response = harness
        .call(
            "/tasks",
            ServiceCall::AwaitTaskTermination {
                token,
                consume: false,
            },
        )
        .await;
    match response {
        RpcResponse::TerminalStatus(status) => assert_eq!(status, TaskStatus::Failed),
        other => panic!("expected TerminalStatus, got {other:?}"),
    }

    let response = harness
        .call("/tasks", ServiceCall::GetTaskInfo { token })
        .await;
    let RpcResponse::Task(info) = response else {
        panic!("expected Task");
    };
    assert!(info
        .comments
        .iter()
        .any(|c| c.actor == "system" && c.body.contains("unhandled: boom")));
}

/// S5: a RUNNING record that stops heartbeating is demoted to DROPPED
/// by the next reaper sweep, and its owning server is cleared.
#[tokio::test]
async fn test_reaper_demotes_silent_running_task() {
    let harness = Harness::new(true).await;
    // No worker: simulate a task that claimed RUNNING then went silent.
    let tasks = harness.store.tasks();
    let token = TaskToken::new();
    tasks
        .allocate(token, "echo", "stuck", Some("alice"), None)
        .await
        .unwrap();
    tasks.mark_enqueued(token, SERVER_ID).await.unwrap();
    tasks.claim_running(token, SERVER_ID).await.unwrap();

    let config = ServerConfig {
        server_id: SERVER_ID.to_string(),
        scratch_root: harness.dir.path().join("tasks"),
        stale_secs: 0,
        ..Default::default()
    };
    // Let the heartbeat fall behind the zero-tolerance bound.
    tokio::time::sleep(Duration::from_millis(1100)).await;
    Reaper::new(harness.store.clone(), &config)
        .sweep()
        .await
        .unwrap();

    let info = tasks.get_info(token).await.unwrap().unwrap();
    assert_eq!(info.status, TaskStatus::Dropped);
    assert!(info.owning_server.is_none());
}

/// S6: removing a product unmounts it without touching the underlying
/// result database.
#[tokio::test]
async fn test_product_unmount_preserves_data() {
    let harness = Harness::new(true).await;
    let db_path = harness.dir.path().join("widgets.sqlite");
    let spec = ConnectionSpec::Sqlite {
        path: db_path.display().to_string(),
    };

    let response = harness
        .call(
            "/products",
            ServiceCall::AddProduct {
                endpoint: "widgets".to_string(),
                display_name: "Widgets".to_string(),
                description: None,
                connection: spec.clone(),
            },
        )
        .await;
    assert!(matches!(response, RpcResponse::Product(_)));

    // Put real content into the result store, then unmount so the file
    // settles on disk.
    let handle = harness.state.registry.get("widgets").unwrap();
    handle
        .result_store()
        .store_report("deadbeef", "nightly", "{}")
        .await
        .unwrap();
    drop(handle);
    let response = harness
        .call(
            "/products",
            ServiceCall::RemoveProduct {
                endpoint: "widgets".to_string(),
            },
        )
        .await;
    assert!(matches!(response, RpcResponse::Ok));

    let hash_before = file_sha256(&db_path);

    // Mount and remove again: the registry reads but never mutates the
    // analysis data.
    let response = harness
        .call(
            "/products",
            ServiceCall::AddProduct {
                endpoint: "widgets".to_string(),
                display_name: "Widgets".to_string(),
                description: None,
                connection: spec.clone(),
            },
        )
        .await;
    assert!(matches!(response, RpcResponse::Product(_)));
    let response = harness
        .call(
            "/products",
            ServiceCall::RemoveProduct {
                endpoint: "widgets".to_string(),
            },
        )
        .await;
    assert!(matches!(response, RpcResponse::Ok));

    assert_eq!(file_sha256(&db_path), hash_before);

    // The product is gone from every listing...
    let response = harness.call("/products", ServiceCall::ListProducts).await;
    let RpcResponse::Products(products) = response else {
        panic!("expected Products");
    };
    assert!(products.is_empty());

    // ...but the data survives a manual reopen.
    let reopened = ResultStore::connect(&spec).await.unwrap();
    assert_eq!(reopened.ensure_schema().await.unwrap(), SchemaStatus::Ok);
    assert_eq!(reopened.report_count().await.unwrap(), 1);
    reopened.close().await;
}

fn file_sha256(path: &std::path::Path) -> String {
    use sha2::{Digest, Sha256};
    let bytes = std::fs::read(path).expect("result store file exists");
    hex::encode(Sha256::digest(bytes))
}

// ============================================================================
// Round-trip and idempotence laws
// ============================================================================

/// The same deterministic body under two tokens runs twice; there is no
/// deduplication in the core.
#[tokio::test]
async fn test_same_body_two_tokens_runs_twice() {
    let harness = Harness::new(true).await;
    harness.spawn_worker();

    let params = echo(10, None);
    let first = submit_echo(&harness, &params).await;
    let second = submit_echo(&harness, &params).await;
    assert_ne!(first, second);

    for token in [first, second] {
        let response = harness
            .call(
                "/tasks",
                ServiceCall::AwaitTaskTermination {
                    token,
                    consume: false,
                },
            )
            .await;
        match response {
            RpcResponse::TerminalStatus(status) => assert_eq!(status, TaskStatus::Completed),
            other => panic!("expected TerminalStatus, got {other:?}"),
        }
    }
}

/// Awaiting with the consume flag marks the terminal record consumed;
/// comments stay appendable afterwards.
#[tokio::test]
async fn test_consume_flag_and_terminal_comments() {
    let harness = Harness::new(true).await;
    harness.spawn_worker();

    let token = submit_echo(&harness, &echo(10, None)).await;
    let response = harness
        .call(
            "/tasks",
            ServiceCall::AwaitTaskTermination {
                token,
                consume: true,
            },
        )
        .await;
    assert!(matches!(
        response,
        RpcResponse::TerminalStatus(TaskStatus::Completed)
    ));

    let response = harness
        .call(
            "/tasks",
            ServiceCall::AddTaskComment {
                token,
                body: "looked at the output".to_string(),
            },
        )
        .await;
    assert!(matches!(response, RpcResponse::Ok));

    let RpcResponse::Task(info) = harness
        .call("/tasks", ServiceCall::GetTaskInfo { token })
        .await
    else {
        panic!("expected Task");
    };
    assert!(info.consumed);
    assert_eq!(info.status, TaskStatus::Completed);
    assert!(info.comments.iter().any(|c| c.body.contains("looked at")));
}

// ============================================================================
// store_results end to end
// ============================================================================

#[tokio::test]
async fn test_store_results_ingests_reports() {
    let harness = Harness::new(true).await;
    harness.spawn_worker();

    let db_path = harness.dir.path().join("widgets.sqlite");
    let spec = ConnectionSpec::Sqlite {
        path: db_path.display().to_string(),
    };
    harness
        .call(
            "/products",
            ServiceCall::AddProduct {
                endpoint: "widgets".to_string(),
                display_name: "Widgets".to_string(),
                description: None,
                connection: spec.clone(),
            },
        )
        .await;

    let params = TaskParams::StoreResults(StoreResultsParams {
        run_name: "nightly".to_string(),
        description: None,
    });
    let token = expect_token(
        harness
            .call(
                "/widgets/tasks",
                ServiceCall::AllocateTask {
                    summary: "store nightly run".to_string(),
                    params: params.clone(),
                },
            )
            .await,
    );

    let RpcResponse::DataDir(data_dir) = harness
        .call("/widgets/tasks", ServiceCall::CreateTaskDataDir { token })
        .await
    else {
        panic!("expected DataDir");
    };
    std::fs::write(
        std::path::Path::new(&data_dir).join("reports.json"),
        r#"[{"hash":"r1","body":{"checker":"core.NullDeref"}},
            {"hash":"r2","body":{"checker":"deadcode.DeadStores"}}]"#,
    )
    .unwrap();

    harness
        .call("/widgets/tasks", ServiceCall::PushTask { token, params })
        .await;
    let response = harness
        .call(
            "/widgets/tasks",
            ServiceCall::AwaitTaskTermination {
                token,
                consume: false,
            },
        )
        .await;
    assert!(matches!(
        response,
        RpcResponse::TerminalStatus(TaskStatus::Completed)
    ));

    let handle = harness.state.registry.get("widgets").unwrap();
    assert_eq!(handle.result_store().report_count().await.unwrap(), 2);

    let RpcResponse::Task(info) = harness
        .call("/tasks", ServiceCall::GetTaskInfo { token })
        .await
    else {
        panic!("expected Task");
    };
    assert!(info
        .comments
        .iter()
        .any(|c| c.body.contains("stored 2 reports")));
}

// ============================================================================
// Routing and authorization
// ============================================================================

#[tokio::test]
async fn test_routing_rejections() {
    let harness = Harness::new(true).await;

    // Path and call service must agree.
    let err = expect_error(harness.call("/products", ServiceCall::Ping).await);
    assert_eq!(err.kind, verdict_protocol::ErrorKind::InputMalformed);

    // Product-scoped services need a product path.
    let err = expect_error(
        harness
            .call(
                "/cleanup_plans",
                ServiceCall::ListCleanupPlans {
                    include_closed: false,
                },
            )
            .await,
    );
    assert_eq!(err.kind, verdict_protocol::ErrorKind::InputMalformed);

    // Server-wide services refuse a product path.
    let err = expect_error(harness.call("/widgets/products", ServiceCall::ListProducts).await);
    assert_eq!(err.kind, verdict_protocol::ErrorKind::InputMalformed);

    // Unknown products 404.
    let err = expect_error(
        harness
            .call(
                "/nope/cleanup_plans",
                ServiceCall::ListCleanupPlans {
                    include_closed: false,
                },
            )
            .await,
    );
    assert_eq!(err.kind, verdict_protocol::ErrorKind::NotFound);

    // The reserved name cannot become a product.
    let err = expect_error(
        harness
            .call(
                "/products",
                ServiceCall::AddProduct {
                    endpoint: "products".to_string(),
                    display_name: "X".to_string(),
                    description: None,
                    connection: ConnectionSpec::Sqlite {
                        path: harness.dir.path().join("x.sqlite").display().to_string(),
                    },
                },
            )
            .await,
    );
    assert_eq!(err.kind, verdict_protocol::ErrorKind::InputMalformed);
}

#[tokio::test]
async fn test_auth_enforced_per_endpoint() {
    let harness = Harness::new(false).await;
    let auth = harness.store.auth();

    // Two accounts: a superuser and a plain user with view rights on
    // one product.
    for (user, pw) in [("root", "rootpw"), ("alice", "alicepw")] {
        auth.upsert_account(user, "salt", &hash_password("salt", pw), &[])
            .await
            .unwrap();
    }
    auth.add_grant(Permission::Superuser, None, "root", false)
        .await
        .unwrap();

    // No session: unauthorized.
    let err = expect_error(harness.call("/tasks", ServiceCall::GetTasks { filter: TaskFilter::default() }).await);
    assert_eq!(err.kind, verdict_protocol::ErrorKind::Unauthorized);

    // Login both.
    let RpcResponse::SessionId(root_session) = harness
        .call(
            "/auth",
            ServiceCall::Login {
                username: "root".to_string(),
                password: "rootpw".to_string(),
            },
        )
        .await
    else {
        panic!("expected SessionId");
    };
    let RpcResponse::SessionId(alice_session) = harness
        .call(
            "/auth",
            ServiceCall::Login {
                username: "alice".to_string(),
                password: "alicepw".to_string(),
            },
        )
        .await
    else {
        panic!("expected SessionId");
    };

    // Only the superuser can submit diagnostic echo tasks.
    let err = expect_error(
        harness
            .call_as(
                Some(alice_session.as_str()),
                "/tasks",
                ServiceCall::AllocateTask {
                    summary: "x".to_string(),
                    params: echo(10, None),
                },
            )
            .await,
    );
    assert_eq!(err.kind, verdict_protocol::ErrorKind::Unauthorized);

    let token = expect_token(
        harness
            .call_as(
                Some(root_session.as_str()),
                "/tasks",
                ServiceCall::AllocateTask {
                    summary: "x".to_string(),
                    params: echo(10, None),
                },
            )
            .await,
    );

    // Other users cannot see or cancel the task.
    let err = expect_error(
        harness
            .call_as(Some(alice_session.as_str()), "/tasks", ServiceCall::GetTaskInfo { token })
            .await,
    );
    assert_eq!(err.kind, verdict_protocol::ErrorKind::Unauthorized);
    let err = expect_error(
        harness
            .call_as(Some(alice_session.as_str()), "/tasks", ServiceCall::CancelTask { token })
            .await,
    );
    assert_eq!(err.kind, verdict_protocol::ErrorKind::Unauthorized);

    // Listing as a plain user is scoped to their own tasks.
    let RpcResponse::Tasks(listed) = harness
        .call_as(
            Some(alice_session.as_str()),
            "/tasks",
            ServiceCall::GetTasks {
                filter: TaskFilter::default(),
            },
        )
        .await
    else {
        panic!("expected Tasks");
    };
    assert!(listed.is_empty());

    // The superuser sees everything.
    let RpcResponse::Tasks(listed) = harness
        .call_as(
            Some(root_session.as_str()),
            "/tasks",
            ServiceCall::GetTasks {
                filter: TaskFilter::default(),
            },
        )
        .await
    else {
        panic!("expected Tasks");
    };
    assert_eq!(listed.len(), 1);

    // Permission introspection reflects the implication graph.
    let RpcResponse::Bool(held) = harness
        .call_as(
            Some(root_session.as_str()),
            "/auth",
            ServiceCall::HasPermission {
                permission: Permission::ProductView,
                product: Some("anything".to_string()),
            },
        )
        .await
    else {
        panic!("expected Bool");
    };
    assert!(held);
}

#[tokio::test]
async fn test_cleanup_plan_service_over_dispatch() {
    let harness = Harness::new(true).await;
    let db_path = harness.dir.path().join("widgets.sqlite");
    harness
        .call(
            "/products",
            ServiceCall::AddProduct {
                endpoint: "widgets".to_string(),
                display_name: "Widgets".to_string(),
                description: None,
                connection: ConnectionSpec::Sqlite {
                    path: db_path.display().to_string(),
                },
            },
        )
        .await;

    let RpcResponse::Plan(plan) = harness
        .call(
            "/widgets/cleanup_plans",
            ServiceCall::CreateCleanupPlan {
                name: "q3-triage".to_string(),
                description: Some("pre-release sweep".to_string()),
                due_date: None,
            },
        )
        .await
    else {
        panic!("expected Plan");
    };

    harness
        .call(
            "/widgets/cleanup_plans",
            ServiceCall::SetPlan {
                id: plan.id,
                report_hashes: vec!["h1".to_string(), "h2".to_string()],
            },
        )
        .await;
    let response = harness
        .call(
            "/widgets/cleanup_plans",
            ServiceCall::CloseCleanupPlan { id: plan.id },
        )
        .await;
    assert!(matches!(response, RpcResponse::Bool(true)));

    let RpcResponse::Plans(open) = harness
        .call(
            "/widgets/cleanup_plans",
            ServiceCall::ListCleanupPlans {
                include_closed: false,
            },
        )
        .await
    else {
        panic!("expected Plans");
    };
    assert!(open.is_empty());

    let RpcResponse::Plans(all) = harness
        .call(
            "/widgets/cleanup_plans",
            ServiceCall::ListCleanupPlans {
                include_closed: true,
            },
        )
        .await
    else {
        panic!("expected Plans");
    };
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].report_hashes, vec!["h1".to_string(), "h2".to_string()]);
}
