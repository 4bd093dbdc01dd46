//! Wire shapes of the application protocol.
//!
//! Every frame is `<decimal-length> <UTF-8 JSON>` (the shared codec in
//! fleet-daemon). The conversation always starts with the client: an
//! identity handshake, then one application descriptor, then
//! command-specific follow-ups.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};

use fleet_daemon::{read_frame, write_frame};
use fleet_master::AppMode;

use crate::error::AppServerError;

/// Peer identity produced by the authenticated transport: the subject and
/// issuer distinguished names of the client certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientHello {
    pub subject: String,
    pub issuer: String,
}

/// Commands a client may issue after the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Command {
    Submit,
    Poll,
    Kill,
    Interact,
}

/// Application descriptor sent by the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRequest {
    pub service: String,
    pub command: Command,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub appid: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<AppMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_request: Option<bool>,
    /// Inline executable content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<String>,
    /// Server-local file to copy as the executable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_path: Option<String>,
    /// Pre-existing work area
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// `{host, port}` follow-up of a synchronous submit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddrFrame {
    pub host: String,
    pub port: u16,
}

/// Server reply frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub status: ReplyStatus,
    pub content: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyStatus {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "failed")]
    Failed,
}

impl Reply {
    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    /// Content rendered for error reporting.
    pub fn message(&self) -> String {
        match self.content.as_str() {
            Some(text) => text.to_owned(),
            None => self.content.to_string(),
        }
    }
}

/// Framed reply/receive helpers over one stream.
#[derive(Debug)]
pub struct FrameIo<S> {
    stream: S,
    peer: String,
}

impl<S: AsyncRead + AsyncWrite + Unpin> FrameIo<S> {
    pub fn new(stream: S, peer: String) -> Self {
        Self { stream, peer }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    /// Sends `{status: "OK", content}`.
    pub async fn send_ok<T: Serialize>(&mut self, content: T) -> Result<(), AppServerError> {
        let reply = Reply {
            status: ReplyStatus::Ok,
            content: serde_json::to_value(content)
                .map_err(|e| AppServerError::Request(e.to_string()))?,
        };
        write_frame(&mut self.stream, &reply).await?;
        Ok(())
    }

    /// Sends `{status: "failed", content}`; non-OK replies are logged.
    pub async fn send_failed<T: Serialize>(&mut self, content: T) -> Result<(), AppServerError> {
        let reply = Reply {
            status: ReplyStatus::Failed,
            content: serde_json::to_value(content)
                .map_err(|e| AppServerError::Request(e.to_string()))?,
        };
        tracing::error!("Response to {}: {}", self.peer, reply.message());
        write_frame(&mut self.stream, &reply).await?;
        Ok(())
    }

    /// Receives one client frame; an early close is a request error.
    pub async fn recv<T: DeserializeOwned>(&mut self) -> Result<T, AppServerError> {
        match read_frame(&mut self.stream).await? {
            Some(value) => Ok(value),
            None => Err(AppServerError::Request(
                "connection closed mid-conversation".to_owned(),
            )),
        }
    }

    /// Sends a raw client-side frame (used by the client half).
    pub async fn send_raw<T: Serialize>(&mut self, value: &T) -> Result<(), AppServerError> {
        write_frame(&mut self.stream, value).await?;
        Ok(())
    }
}
