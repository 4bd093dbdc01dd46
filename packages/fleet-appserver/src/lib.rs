//! Authenticated socket front door: wire protocol, server, output tails,
//! and the matching client.

pub mod client;
pub mod error;
pub mod protocol;
pub mod server;
pub mod tail;

pub use client::{AppClient, FinalState, SubmitAck};
pub use error::AppServerError;
pub use protocol::{AddrFrame, AppRequest, ClientHello, Command, FrameIo, Reply, ReplyStatus};
pub use server::{AppServer, AppServerConfig, DEFAULT_PORT, ENV_SERVER_PORT};
pub use tail::tail_follow;
