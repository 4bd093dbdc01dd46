//! Daemon loop behaviour with real worker processes.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use fleet_daemon::{
    write_frame, AppEventBus, Daemon, DaemonConfig, MutationFrame, MutationOp,
    ShutdownController, EXEC_FILE, MUTATION_SOCKET, STDOUT_FILE,
};
use fleet_inventory::dataformat::{GroupRecord, OwnershipLevel};
use fleet_inventory::{Entity, FsInventoryStore, Inventory};
use fleet_master::{AppMode, AppStatus, AppUpdate, Application, MasterServer};

fn test_config() -> DaemonConfig {
    DaemonConfig {
        cycle: Duration::from_millis(50),
        frame_timeout: Duration::from_millis(200),
        shutdown_grace: Duration::from_secs(5),
    }
}

fn master_with_user(dir: &Path) -> Arc<MasterServer> {
    let master = MasterServer::open(dir).unwrap();
    master
        .add_user("jdoe", "/DC=org/DC=example/CN=John Doe", "jdoe@example.org")
        .unwrap();
    Arc::new(master)
}

fn write_exec(workarea: &Path, script: &str) -> Vec<u8> {
    std::fs::create_dir_all(workarea).unwrap();
    let content = script.as_bytes().to_vec();
    std::fs::write(workarea.join(EXEC_FILE), &content).unwrap();
    content
}

async fn wait_for_status(
    master: &MasterServer,
    app_id: u64,
    want: AppStatus,
) -> Application {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let app = master.get_application(app_id).unwrap();
        if app.status == want {
            return app;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "application {} stuck in {:?} waiting for {:?}",
            app_id,
            app.status,
            want
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn asynch_submit_runs_to_done() {
    // scenario: a submitted executable runs, exits 0, and the row moves
    // new -> run -> done with the exit code recorded
    let registry_dir = tempfile::tempdir().unwrap();
    let workarea = tempfile::tempdir().unwrap();

    let master = master_with_user(registry_dir.path());
    write_exec(workarea.path(), "echo 1\n");
    let app_id = master
        .schedule_app(
            AppMode::Asynch,
            "t1",
            workarea.path().to_str().unwrap(),
            "jdoe",
            "",
            false,
        )
        .unwrap();

    let shutdown = ShutdownController::new();
    let events = AppEventBus::new();
    let mut daemon = Daemon::new(
        Arc::clone(&master),
        Inventory::new(),
        events,
        shutdown.subscribe(),
        test_config(),
    );
    let handle = tokio::spawn(async move {
        daemon.run().await;
        daemon
    });

    let app = wait_for_status(&master, app_id, AppStatus::Done).await;
    assert_eq!(app.exit_code, Some(0));

    // stdout went to the work-area capture file
    let stdout = std::fs::read_to_string(workarea.path().join(STDOUT_FILE)).unwrap();
    assert_eq!(stdout.trim(), "1");

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn kill_request_terminates_running_app() {
    // scenario: poll shows run; a kill moves the row to killed and the
    // daemon signals the child within a cycle
    let registry_dir = tempfile::tempdir().unwrap();
    let workarea = tempfile::tempdir().unwrap();

    let master = master_with_user(registry_dir.path());
    write_exec(workarea.path(), "sleep 30\n");
    let app_id = master
        .schedule_app(
            AppMode::Asynch,
            "t-long",
            workarea.path().to_str().unwrap(),
            "jdoe",
            "",
            false,
        )
        .unwrap();

    let shutdown = ShutdownController::new();
    let mut daemon = Daemon::new(
        Arc::clone(&master),
        Inventory::new(),
        AppEventBus::new(),
        shutdown.subscribe(),
        test_config(),
    );
    let handle = tokio::spawn(async move {
        daemon.run().await;
        daemon
    });

    wait_for_status(&master, app_id, AppStatus::Run).await;

    // the front door transitions the row; the daemon observes and signals
    master
        .update_application(
            app_id,
            AppUpdate {
                status: Some(AppStatus::Killed),
                ..Default::default()
            },
        )
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let app = master.get_application(app_id).unwrap();
        if app.status == AppStatus::Killed && app.exit_code.is_some() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "kill not honoured within the grace period"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    shutdown.trigger();
    handle.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn write_request_mutations_are_applied() {
    // a write-authorized worker proposes an update frame; the daemon drains
    // it, applies it to the master inventory, and persists it
    let registry_dir = tempfile::tempdir().unwrap();
    let store_dir = tempfile::tempdir().unwrap();
    let workarea = tempfile::tempdir().unwrap();

    let master = master_with_user(registry_dir.path());
    let content = write_exec(workarea.path(), "sleep 2\n");
    master
        .add_authorized_executable("writer", &content, Some("jdoe"))
        .unwrap();

    let mut inventory = Inventory::new();
    inventory.attach_store(FsInventoryStore::open(store_dir.path()).unwrap());

    let app_id = master
        .schedule_app(
            AppMode::Asynch,
            "writer",
            workarea.path().to_str().unwrap(),
            "jdoe",
            "",
            true,
        )
        .unwrap();

    let shutdown = ShutdownController::new();
    let mut daemon = Daemon::new(
        Arc::clone(&master),
        inventory,
        AppEventBus::new(),
        shutdown.subscribe(),
        test_config(),
    );
    let handle = tokio::spawn(async move {
        daemon.run().await;
        daemon
    });

    wait_for_status(&master, app_id, AppStatus::Run).await;

    // pose as the worker: connect to the mutation socket and emit a frame
    let socket_path = workarea.path().join(MUTATION_SOCKET);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut stream = loop {
        match tokio::net::UnixStream::connect(&socket_path).await {
            Ok(stream) => break stream,
            Err(_) if tokio::time::Instant::now() < deadline => {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(err) => panic!("mutation socket never appeared: {}", err),
        }
    };
    write_frame(
        &mut stream,
        &MutationFrame {
            op: MutationOp::Update,
            entity: Entity::Group(GroupRecord::new("prod", OwnershipLevel::Block)),
        },
    )
    .await
    .unwrap();
    drop(stream);

    let app = wait_for_status(&master, app_id, AppStatus::Done).await;
    assert_eq!(app.exit_code, Some(0));

    shutdown.trigger();
    let daemon = handle.await.unwrap();
    assert!(daemon.inventory().groups.contains_key("prod"));

    // the mutation was persisted through the store
    let store = FsInventoryStore::open_read_only(store_dir.path()).unwrap();
    assert!(store.group_id("prod").is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn unauthorized_write_request_is_rejected() {
    let registry_dir = tempfile::tempdir().unwrap();
    let workarea = tempfile::tempdir().unwrap();

    let master = master_with_user(registry_dir.path());
    write_exec(workarea.path(), "echo should not run\n");
    // no authorized_executables row for this title

    let app_id = master
        .schedule_app(
            AppMode::Asynch,
            "rogue",
            workarea.path().to_str().unwrap(),
            "jdoe",
            "",
            true,
        )
        .unwrap();

    let shutdown = ShutdownController::new();
    let mut daemon = Daemon::new(
        Arc::clone(&master),
        Inventory::new(),
        AppEventBus::new(),
        shutdown.subscribe(),
        test_config(),
    );
    let handle = tokio::spawn(async move {
        daemon.run().await;
        daemon
    });

    let app = wait_for_status(&master, app_id, AppStatus::Failed).await;
    assert_eq!(app.exit_code, None);

    shutdown.trigger();
    handle.await.unwrap();
}
