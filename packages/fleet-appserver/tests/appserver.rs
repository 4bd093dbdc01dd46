//! Front-door conversations against a live daemon.

use std::sync::Arc;
use std::time::Duration;

use fleet_appserver::{
    AppClient, AppServer, AppServerConfig, AppServerError, ClientHello,
};
use fleet_daemon::{AppEventBus, Daemon, DaemonConfig, ShutdownController};
use fleet_inventory::Inventory;
use fleet_master::MasterServer;

const USER_DN: &str = "/DC=org/DC=example/CN=John Doe";
const ISSUER_DN: &str = "/DC=org/DC=example/CN=Fleet CA";

struct Harness {
    master: Arc<MasterServer>,
    shutdown: ShutdownController,
    client: AppClient,
    _registry_dir: tempfile::TempDir,
    _spool_dir: tempfile::TempDir,
}

async fn start() -> Harness {
    let registry_dir = tempfile::tempdir().unwrap();
    let spool_dir = tempfile::tempdir().unwrap();

    let master = Arc::new(MasterServer::open(registry_dir.path()).unwrap());
    master.add_user("jdoe", USER_DN, "jdoe@example.org").unwrap();
    master.add_authorization_target("submission").unwrap();
    master
        .authorize_user("jdoe", None, Some("submission"))
        .unwrap();

    let shutdown = ShutdownController::new();
    let events = AppEventBus::new();

    let mut daemon = Daemon::new(
        Arc::clone(&master),
        Inventory::new(),
        events.clone(),
        shutdown.subscribe(),
        DaemonConfig {
            cycle: Duration::from_millis(50),
            frame_timeout: Duration::from_millis(200),
            shutdown_grace: Duration::from_secs(5),
        },
    );
    tokio::spawn(async move { daemon.run().await });

    let server = Arc::new(AppServer::new(
        Arc::clone(&master),
        events,
        AppServerConfig {
            port: 0,
            workarea_root: spool_dir.path().to_path_buf(),
        },
    ));
    let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(server.serve(listener, shutdown.subscribe()));

    let client = AppClient::new(
        "127.0.0.1",
        port,
        ClientHello {
            subject: USER_DN.to_owned(),
            issuer: ISSUER_DN.to_owned(),
        },
    );

    Harness {
        master,
        shutdown,
        client,
        _registry_dir: registry_dir,
        _spool_dir: spool_dir,
    }
}

async fn poll_until(client: &AppClient, appid: u64, want: &str) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let app = client.poll("submission", appid).await.unwrap();
        if app["status"] == want {
            return app;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "application {} never reached {} (last: {})",
            appid,
            want,
            app["status"]
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn asynch_submit_poll_roundtrip() {
    // scenario: submit an inline executable, get {appid, path}, and poll it
    // through to done with exit code 0
    let harness = start().await;

    let ack = harness
        .client
        .submit_asynch("submission", "t1", "", false, "echo 1\n")
        .await
        .unwrap();
    assert!(ack.appid >= 1);
    assert!(std::path::Path::new(&ack.path).join("exec").exists());

    let app = poll_until(&harness.client, ack.appid, "done").await;
    assert_eq!(app["exit_code"], 0);
    assert_eq!(app["user"], "jdoe");

    harness.shutdown.trigger();
}

#[tokio::test(flavor = "multi_thread")]
async fn kill_running_application() {
    // scenario: a kill on a running app replies "Task aborted." and the
    // daemon transitions the row to killed within its grace period
    let harness = start().await;

    let ack = harness
        .client
        .submit_asynch("submission", "t-long", "", false, "sleep 30\n")
        .await
        .unwrap();

    poll_until(&harness.client, ack.appid, "run").await;

    let reply = harness.client.kill("submission", ack.appid).await.unwrap();
    assert_eq!(reply, "Task aborted.");

    poll_until(&harness.client, ack.appid, "killed").await;

    // a second kill reports the terminal state instead
    let reply = harness.client.kill("submission", ack.appid).await.unwrap();
    assert!(reply
        .as_str()
        .unwrap()
        .starts_with("Task already completed"));

    harness.shutdown.trigger();
}

#[tokio::test(flavor = "multi_thread")]
async fn synch_submit_streams_output() {
    let harness = start().await;

    let (ack, state) = harness
        .client
        .submit_synch("submission", "t-synch", "", false, "echo streamed\n")
        .await
        .unwrap();
    assert!(ack.appid >= 1);
    assert_eq!(state.status, "done");
    assert_eq!(state.exit_code, Some(0));

    harness.shutdown.trigger();
}

#[tokio::test(flavor = "multi_thread")]
async fn unauthorized_service_is_rejected() {
    let harness = start().await;

    let err = harness
        .client
        .submit_asynch("deletion-ops", "t1", "", false, "echo 1\n")
        .await
        .unwrap_err();
    match err {
        AppServerError::Request(message) => {
            assert!(message.starts_with("Unauthorized user/service"))
        }
        other => panic!("unexpected error: {}", other),
    }

    harness.shutdown.trigger();
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_dn_is_rejected() {
    let harness = start().await;

    let stranger = AppClient::new(
        "127.0.0.1",
        harness.client.port,
        ClientHello {
            subject: "/DC=org/DC=example/CN=Stranger".to_owned(),
            issuer: ISSUER_DN.to_owned(),
        },
    );
    let err = stranger.poll("submission", 1).await.unwrap_err();
    match err {
        AppServerError::Authorization(message) => {
            assert!(message.starts_with("Unidentified user DN"))
        }
        other => panic!("unexpected error: {}", other),
    }

    // the registry row count is untouched
    assert!(harness.master.get_application(1).is_err());

    harness.shutdown.trigger();
}
