//! Daemon main loop, worker sub-processes, and the mutation frame protocol.

pub mod daemon;
pub mod error;
pub mod events;
pub mod frame;
pub mod interrupt;
pub mod worker;

pub use daemon::{CycleHook, Daemon, DaemonConfig};
pub use error::DaemonError;
pub use events::{AppEvent, AppEventBus};
pub use frame::{read_frame, write_frame, FrameError, MutationFrame, MutationOp};
pub use interrupt::{should_stop, InterruptMask, ShutdownController};
pub use worker::{
    spawn_worker, WorkerChild, ENV_INVENTORY_DIR, ENV_MUTATION_SOCKET, EXEC_FILE,
    MUTATION_SOCKET, STDERR_FILE, STDOUT_FILE,
};
