//! The authenticated socket front door.
//!
//! Accepts connections, identifies the peer by certificate DNs, and serves
//! the submit / poll / kill / interact commands. Each connection gets its
//! own handler task; a handler failure closes that one connection with a
//! `failed` frame and never touches the accept loop.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};

use fleet_daemon::{read_frame, AppEvent, AppEventBus, EXEC_FILE, STDERR_FILE, STDOUT_FILE};
use fleet_master::{AppMode, AppStatus, AppUpdate, MasterServer};

use crate::error::AppServerError;
use crate::protocol::{AddrFrame, AppRequest, ClientHello, Command, FrameIo};
use crate::tail::tail_follow;

/// Default listen port of the application protocol.
pub const DEFAULT_PORT: u16 = 39626;
/// Environment override for the listen port.
pub const ENV_SERVER_PORT: &str = "FLEET_SERVER_PORT";

/// Grace period between an application finishing and the output tails
/// stopping.
const TAIL_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct AppServerConfig {
    pub port: u16,
    /// Work areas are created under this directory
    pub workarea_root: PathBuf,
}

impl AppServerConfig {
    /// Port from `FLEET_SERVER_PORT`, falling back to the default.
    pub fn port_from_env() -> u16 {
        std::env::var(ENV_SERVER_PORT)
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_PORT)
    }
}

/// Sub-server owned by the daemon process, serving application requests.
pub struct AppServer {
    master: Arc<MasterServer>,
    events: AppEventBus,
    config: AppServerConfig,
    workarea_counter: AtomicU64,
}

impl AppServer {
    pub fn new(master: Arc<MasterServer>, events: AppEventBus, config: AppServerConfig) -> Self {
        Self {
            master,
            events,
            config,
            workarea_counter: AtomicU64::new(0),
        }
    }

    /// Binds the listen socket, retrying while the address is in use.
    pub async fn bind(&self) -> Result<TcpListener, AppServerError> {
        let addr = ("0.0.0.0", self.config.port);
        for _attempt in 0..10 {
            match TcpListener::bind(addr).await {
                Ok(listener) => return Ok(listener),
                Err(err) if err.kind() == std::io::ErrorKind::AddrInUse => {
                    tracing::warn!("Cannot bind to port {}. Retrying..", self.config.port);
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Err(err) => return Err(AppServerError::io("binding server socket", err)),
            }
        }
        Err(AppServerError::io(
            "binding server socket",
            std::io::Error::new(std::io::ErrorKind::AddrInUse, "port busy after 10 attempts"),
        ))
    }

    /// Accept loop; runs until the shutdown signal flips.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move {
                                server.handle(stream, peer.to_string()).await;
                            });
                        }
                        Err(err) => {
                            tracing::error!("Application server accept failed: {}", err);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("Application server stopping.");
                        return;
                    }
                }
            }
        }
    }

    async fn handle(self: Arc<Self>, stream: TcpStream, peer: String) {
        let mut io = FrameIo::new(stream, peer.clone());
        if let Err(err) = self.process(&mut io).await {
            tracing::warn!("Connection handler for {} failed: {}", peer, err);
            let _ = io.send_failed(err.to_string()).await;
        }
    }

    async fn process(&self, io: &mut FrameIo<TcpStream>) -> Result<(), AppServerError> {
        // identity handshake: subject first, issuer as fallback
        let hello: ClientHello = io.recv().await?;
        let mut identified = None;
        for dn in [hello.subject.as_str(), hello.issuer.as_str()] {
            if dn.is_empty() {
                continue;
            }
            match self.master.identify_user(Some(dn), None, true) {
                Ok(Some(user)) => {
                    identified = Some(user);
                    break;
                }
                Ok(None) => {}
                // a peer may present a DN form we cannot parse; that only
                // means it does not identify anyone
                Err(fleet_master::MasterError::MalformedDn(_)) => {}
                Err(err) => return Err(err.into()),
            }
        }
        let Some((user, _user_id)) = identified else {
            io.send_failed(format!("Unidentified user DN {}", hello.subject))
                .await?;
            return Ok(());
        };

        io.send_ok("Connected").await?;

        let request: AppRequest = io.recv().await?;

        if !self.master.check_user_auth(&user, None, Some(&request.service)) {
            io.send_failed(format!(
                "Unauthorized user/service {}/{}",
                user, request.service
            ))
            .await?;
            return Ok(());
        }

        match request.command {
            Command::Poll | Command::Kill => {
                let Some(appid) = request.appid else {
                    io.send_failed("Missing appid").await?;
                    return Ok(());
                };
                self.act_on_app(request.command, appid, io).await
            }
            Command::Submit => {
                let (workarea, server_made) = match &request.path {
                    Some(path) => (PathBuf::from(path), false),
                    None => (self.make_workarea()?, true),
                };
                let result = self.submit_app(&request, &user, &workarea, io).await;
                if result.is_err() && server_made {
                    let _ = std::fs::remove_dir_all(&workarea);
                }
                result
            }
            Command::Interact => {
                let (workarea, server_made) = match &request.path {
                    Some(path) => (PathBuf::from(path), false),
                    None => (self.make_workarea()?, true),
                };
                let result = self.interact(io).await;
                if server_made {
                    let _ = std::fs::remove_dir_all(&workarea);
                }
                result
            }
        }
    }

    /// Query or operation on an existing application.
    async fn act_on_app(
        &self,
        command: Command,
        app_id: u64,
        io: &mut FrameIo<TcpStream>,
    ) -> Result<(), AppServerError> {
        let app = match self.master.get_application(app_id) {
            Ok(app) => app,
            Err(_) => {
                io.send_failed(format!("Unknown appid {}", app_id)).await?;
                return Ok(());
            }
        };

        if command == Command::Kill {
            if matches!(app.status, AppStatus::New | AppStatus::Run) {
                self.master.update_application(
                    app_id,
                    AppUpdate {
                        status: Some(AppStatus::Killed),
                        ..Default::default()
                    },
                )?;
                io.send_ok("Task aborted.").await?;
            } else {
                io.send_ok(format!(
                    "Task already completed with status {} (exit code {:?}).",
                    app.status.name(),
                    app.exit_code
                ))
                .await?;
            }
        } else {
            io.send_ok(&app).await?;
        }
        Ok(())
    }

    async fn submit_app(
        &self,
        request: &AppRequest,
        user: &str,
        workarea: &Path,
        io: &mut FrameIo<TcpStream>,
    ) -> Result<(), AppServerError> {
        for (field, present) in [
            ("title", request.title.is_some()),
            ("args", request.args.is_some()),
            ("write_request", request.write_request.is_some()),
        ] {
            if !present {
                io.send_failed(format!("Missing {}", field)).await?;
                return Ok(());
            }
        }
        let title = request.title.as_deref().expect("checked above");
        let args = request.args.as_deref().expect("checked above");
        let write_request = request.write_request.expect("checked above");
        let Some(mode) = request.mode else {
            io.send_failed("Missing mode").await?;
            return Ok(());
        };

        if write_request && self.master.write_lock().inhibit_write() {
            return Err(AppServerError::Unavailable(
                "the inventory is being updated".to_owned(),
            ));
        }

        // materialize the executable in the work area
        let exec_dest = workarea.join(EXEC_FILE);
        if let Some(exec_path) = &request.exec_path {
            if let Err(err) = std::fs::copy(exec_path, &exec_dest) {
                io.send_failed(format!(
                    "Could not copy executable {} to {} ({})",
                    exec_path,
                    workarea.display(),
                    err
                ))
                .await?;
                return Ok(());
            }
        } else if let Some(exec) = &request.exec {
            std::fs::write(&exec_dest, exec)
                .map_err(|e| AppServerError::io("writing executable", e))?;
        } else {
            io.send_failed("Missing exec or exec_path").await?;
            return Ok(());
        }

        // synchronous submitters listen before the row exists
        let mut events = self.events.subscribe();

        let workarea_str = workarea.display().to_string();
        let app_id = self
            .master
            .schedule_app(mode, title, &workarea_str, user, args, write_request)?;

        if mode == AppMode::Asynch {
            io.send_ok(serde_json::json!({ "appid": app_id, "path": workarea_str }))
                .await?;
            return Ok(());
        }

        // synch: wait for the daemon to start (or refuse) the app
        let event = wait_for_event(&mut events, app_id).await?;
        if event.status != AppStatus::Run {
            io.send_failed(serde_json::json!({ "status": event.status.name() }))
                .await?;
            return Ok(());
        }
        io.send_ok(serde_json::json!({ "appid": app_id, "path": event.path }))
            .await?;

        self.serve_synch_app(app_id, &event.path, &mut events, io)
            .await
    }

    /// Tails `_stdout`/`_stderr` to the client-provided address while the
    /// application runs, then reports its final state.
    async fn serve_synch_app(
        &self,
        app_id: u64,
        path: &str,
        events: &mut broadcast::Receiver<AppEvent>,
        io: &mut FrameIo<TcpStream>,
    ) -> Result<(), AppServerError> {
        let addr: AddrFrame = io.recv().await?;

        let stdout_conn = TcpStream::connect((addr.host.as_str(), addr.port))
            .await
            .map_err(|e| AppServerError::io("connecting stdout stream", e))?;
        let stderr_conn = TcpStream::connect((addr.host.as_str(), addr.port))
            .await
            .map_err(|e| AppServerError::io("connecting stderr stream", e))?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let stdout_task = tokio::spawn(tail_follow(
            Path::new(path).join(STDOUT_FILE),
            stdout_conn,
            stop_rx.clone(),
        ));
        let stderr_task = tokio::spawn(tail_follow(
            Path::new(path).join(STDERR_FILE),
            stderr_conn,
            stop_rx,
        ));

        // wait for the terminal event
        let final_event = loop {
            let event = wait_for_event(events, app_id).await?;
            if event.status.is_terminal() {
                break event;
            }
        };

        // keep the readers alive for a moment so the last lines drain
        tokio::time::sleep(TAIL_GRACE).await;
        let _ = stop_tx.send(true);
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        io.send_ok(serde_json::json!({
            "status": final_event.status.name(),
            "exit_code": final_event.exit_code,
        }))
        .await
    }

    /// Hosts a shell console bridged over two sockets to the client.
    /// Stdin arrives as length-prefixed frames on the first connection;
    /// stdout and stderr stream back raw on the first and second.
    async fn interact(&self, io: &mut FrameIo<TcpStream>) -> Result<(), AppServerError> {
        io.send_ok("").await?;
        let addr: AddrFrame = io.recv().await?;

        let conn0 = TcpStream::connect((addr.host.as_str(), addr.port))
            .await
            .map_err(|e| AppServerError::io("connecting console stream", e))?;
        let conn1 = TcpStream::connect((addr.host.as_str(), addr.port))
            .await
            .map_err(|e| AppServerError::io("connecting console stream", e))?;

        let mut child = tokio::process::Command::new("/bin/sh")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AppServerError::io("spawning console process", e))?;

        let mut child_stdin = child.stdin.take().expect("piped stdin");
        let mut child_stdout = child.stdout.take().expect("piped stdout");
        let mut child_stderr = child.stderr.take().expect("piped stderr");

        let (mut conn0_read, mut conn0_write) = conn0.into_split();
        let (_conn1_read, mut conn1_write) = conn1.into_split();

        let stdin_task = tokio::spawn(async move {
            while let Ok(Some(line)) = read_frame::<_, String>(&mut conn0_read).await {
                if child_stdin.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if child_stdin.write_all(b"\n").await.is_err() {
                    break;
                }
            }
            // dropping stdin closes the console
        });
        let stdout_task =
            tokio::spawn(
                async move { tokio::io::copy(&mut child_stdout, &mut conn0_write).await },
            );
        let stderr_task =
            tokio::spawn(
                async move { tokio::io::copy(&mut child_stderr, &mut conn1_write).await },
            );

        let status = child
            .wait()
            .await
            .map_err(|e| AppServerError::io("waiting for console process", e))?;
        stdin_task.abort();
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        tracing::info!("Interactive console exited with {:?}", status.code());
        Ok(())
    }

    fn make_workarea(&self) -> Result<PathBuf, AppServerError> {
        let serial = self.workarea_counter.fetch_add(1, Ordering::Relaxed);
        let unique = format!("work_{}_{}", std::process::id(), serial);
        let dir = self.config.workarea_root.join(unique);
        std::fs::create_dir_all(&dir).map_err(|e| AppServerError::io("creating work area", e))?;
        Ok(dir)
    }
}

/// Next event for an application id; tolerates bus lag.
async fn wait_for_event(
    events: &mut broadcast::Receiver<AppEvent>,
    app_id: u64,
) -> Result<AppEvent, AppServerError> {
    loop {
        match events.recv().await {
            Ok(event) if event.app_id == app_id => return Ok(event),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => {
                return Err(AppServerError::Request(
                    "application event bus closed".to_owned(),
                ))
            }
        }
    }
}
