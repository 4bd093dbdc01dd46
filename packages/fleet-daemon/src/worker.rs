//! Worker sub-processes.
//!
//! A worker runs the submitted executable in its work area with stdout and
//! stderr redirected to `_stdout` / `_stderr` and stdin closed. The
//! read-only inventory location and (for write requests) the mutation
//! socket path are published through environment variables; proposed
//! mutations come back as [`MutationFrame`]s over the Unix socket, decoded
//! into a bounded channel the daemon drains.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::net::UnixListener;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::DaemonError;
use crate::frame::{read_frame, MutationFrame};

/// Executable file inside the work area.
pub const EXEC_FILE: &str = "exec";
/// Worker stdout capture.
pub const STDOUT_FILE: &str = "_stdout";
/// Worker stderr capture.
pub const STDERR_FILE: &str = "_stderr";
/// Mutation socket inside the work area.
pub const MUTATION_SOCKET: &str = "_mutations.sock";

/// Read-only inventory store directory, published to the worker.
pub const ENV_INVENTORY_DIR: &str = "FLEET_INVENTORY_DIR";
/// Mutation socket path, published to write-request workers.
pub const ENV_MUTATION_SOCKET: &str = "FLEET_MUTATION_SOCKET";

/// Frames buffered between the socket reader and the daemon loop.
const MUTATION_CHANNEL_CAPACITY: usize = 64;

/// A live worker tracked by the daemon.
#[derive(Debug)]
pub struct WorkerChild {
    pub app_id: u64,
    pub user: String,
    pub path: PathBuf,
    pub child: Child,
    /// Bounded mutation channel; `None` for read-only workers
    pub mutations: Option<mpsc::Receiver<MutationFrame>>,
    reader: Option<JoinHandle<()>>,
}

impl WorkerChild {
    pub fn abort_reader(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Spawns the executable in `workarea` as `/bin/sh <workarea>/exec`.
pub fn spawn_worker(
    app_id: u64,
    user: &str,
    workarea: &Path,
    inventory_dir: Option<&Path>,
    write_request: bool,
) -> Result<WorkerChild, DaemonError> {
    let exec_path = workarea.join(EXEC_FILE);
    let stdout = std::fs::File::create(workarea.join(STDOUT_FILE))
        .map_err(|e| DaemonError::io("creating worker stdout", e))?;
    let stderr = std::fs::File::create(workarea.join(STDERR_FILE))
        .map_err(|e| DaemonError::io("creating worker stderr", e))?;

    let mut command = Command::new("/bin/sh");
    command
        .arg(&exec_path)
        .current_dir(workarea)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));
    if let Some(dir) = inventory_dir {
        command.env(ENV_INVENTORY_DIR, dir);
    }

    let (mutations, reader) = if write_request {
        let socket_path = workarea.join(MUTATION_SOCKET);
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)
                .map_err(|e| DaemonError::io("removing stale mutation socket", e))?;
        }
        let listener = UnixListener::bind(&socket_path)
            .map_err(|e| DaemonError::io("binding mutation socket", e))?;
        command.env(ENV_MUTATION_SOCKET, &socket_path);

        let (tx, rx) = mpsc::channel(MUTATION_CHANNEL_CAPACITY);
        let reader = tokio::spawn(read_mutations(listener, tx, app_id));
        (Some(rx), Some(reader))
    } else {
        (None, None)
    };

    let child = command
        .spawn()
        .map_err(|e| DaemonError::io("spawning worker process", e))?;

    tracing::info!(
        "Started executable for application {} (PID {:?})",
        app_id,
        child.id()
    );

    Ok(WorkerChild {
        app_id,
        user: user.to_owned(),
        path: workarea.to_path_buf(),
        child,
        mutations,
        reader,
    })
}

/// Accepts the worker's single connection and decodes frames into the
/// bounded channel. Sending blocks when the channel is full, which
/// back-pressures the worker.
async fn read_mutations(
    listener: UnixListener,
    tx: mpsc::Sender<MutationFrame>,
    app_id: u64,
) {
    let Ok((mut stream, _addr)) = listener.accept().await else {
        return;
    };
    loop {
        match read_frame::<_, MutationFrame>(&mut stream).await {
            Ok(Some(frame)) => {
                if tx.send(frame).await.is_err() {
                    return;
                }
            }
            Ok(None) => return,
            Err(err) => {
                tracing::warn!(
                    "Mutation channel of application {} broke: {}",
                    app_id,
                    err
                );
                return;
            }
        }
    }
}
