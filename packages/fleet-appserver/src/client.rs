//! Client half of the application protocol.
//!
//! Opens one conversation per command. Busy replies ("Server is
//! unavailable ...") are retried indefinitely with a 2 second pause, the
//! same way the web client treats 503 responses.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use fleet_master::AppMode;

use crate::error::AppServerError;
use crate::protocol::{AddrFrame, AppRequest, ClientHello, Command, FrameIo, Reply};

/// Pause between retries of a busy server.
const BUSY_RETRY_PAUSE: Duration = Duration::from_secs(2);

/// Acknowledgement of a submit.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitAck {
    pub appid: u64,
    pub path: String,
}

/// Final state reported after a synchronous run.
#[derive(Debug, Clone, Deserialize)]
pub struct FinalState {
    pub status: String,
    pub exit_code: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct AppClient {
    pub host: String,
    pub port: u16,
    pub identity: ClientHello,
}

impl AppClient {
    pub fn new(host: impl Into<String>, port: u16, identity: ClientHello) -> Self {
        Self {
            host: host.into(),
            port,
            identity,
        }
    }

    /// Connects and completes the identity handshake.
    async fn connect(&self) -> Result<FrameIo<TcpStream>, AppServerError> {
        let stream = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| AppServerError::io("connecting to application server", e))?;
        let mut io = FrameIo::new(stream, format!("{}:{}", self.host, self.port));
        io.send_raw(&self.identity).await?;
        let reply: Reply = io.recv().await?;
        if !reply.is_ok() {
            return Err(AppServerError::Authorization(reply.message()));
        }
        Ok(io)
    }

    /// One request/reply conversation, retrying while the server is busy.
    async fn converse(&self, request: &AppRequest) -> Result<Value, AppServerError> {
        loop {
            let mut io = self.connect().await?;
            io.send_raw(request).await?;
            let reply: Reply = io.recv().await?;
            if reply.is_ok() {
                return Ok(reply.content);
            }
            let message = reply.message();
            if message.starts_with("Server is unavailable") {
                tracing::warn!("{}; retrying in {:?}", message, BUSY_RETRY_PAUSE);
                tokio::time::sleep(BUSY_RETRY_PAUSE).await;
                continue;
            }
            return Err(AppServerError::Request(message));
        }
    }

    pub async fn poll(&self, service: &str, appid: u64) -> Result<Value, AppServerError> {
        let mut request = AppRequest::new(service, Command::Poll);
        request.appid = Some(appid);
        self.converse(&request).await
    }

    pub async fn kill(&self, service: &str, appid: u64) -> Result<Value, AppServerError> {
        let mut request = AppRequest::new(service, Command::Kill);
        request.appid = Some(appid);
        self.converse(&request).await
    }

    /// Submits for background execution and returns immediately.
    pub async fn submit_asynch(
        &self,
        service: &str,
        title: &str,
        args: &str,
        write_request: bool,
        exec: &str,
    ) -> Result<SubmitAck, AppServerError> {
        let mut request = AppRequest::new(service, Command::Submit);
        request.mode = Some(AppMode::Asynch);
        request.title = Some(title.to_owned());
        request.args = Some(args.to_owned());
        request.write_request = Some(write_request);
        request.exec = Some(exec.to_owned());
        let content = self.converse(&request).await?;
        serde_json::from_value(content).map_err(|e| AppServerError::Request(e.to_string()))
    }

    /// Submits and watches the run: stdout and stderr of the executable are
    /// copied to this process's stdout and stderr until the application
    /// finishes.
    pub async fn submit_synch(
        &self,
        service: &str,
        title: &str,
        args: &str,
        write_request: bool,
        exec: &str,
    ) -> Result<(SubmitAck, FinalState), AppServerError> {
        let mut request = AppRequest::new(service, Command::Submit);
        request.mode = Some(AppMode::Synch);
        request.title = Some(title.to_owned());
        request.args = Some(args.to_owned());
        request.write_request = Some(write_request);
        request.exec = Some(exec.to_owned());

        let mut io = loop {
            let mut io = self.connect().await?;
            io.send_raw(&request).await?;
            let reply: Reply = io.recv().await?;
            if reply.is_ok() {
                let ack: SubmitAck = serde_json::from_value(reply.content)
                    .map_err(|e| AppServerError::Request(e.to_string()))?;
                break (io, ack);
            }
            let message = reply.message();
            if message.starts_with("Server is unavailable") {
                tracing::warn!("{}; retrying in {:?}", message, BUSY_RETRY_PAUSE);
                tokio::time::sleep(BUSY_RETRY_PAUSE).await;
                continue;
            }
            return Err(AppServerError::Request(message));
        };
        let ack = io.1;
        let io = &mut io.0;

        // offer the server two streams for the output tails
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| AppServerError::io("binding output listener", e))?;
        let port = listener
            .local_addr()
            .map_err(|e| AppServerError::io("reading listener address", e))?
            .port();
        io.send_raw(&AddrFrame {
            host: "127.0.0.1".to_owned(),
            port,
        })
        .await?;

        let (stdout_conn, _) = listener
            .accept()
            .await
            .map_err(|e| AppServerError::io("accepting stdout stream", e))?;
        let (stderr_conn, _) = listener
            .accept()
            .await
            .map_err(|e| AppServerError::io("accepting stderr stream", e))?;

        let stdout_task = tokio::spawn(async move {
            let mut conn = stdout_conn;
            let mut out = tokio::io::stdout();
            let _ = tokio::io::copy(&mut conn, &mut out).await;
            let _ = out.flush().await;
        });
        let stderr_task = tokio::spawn(async move {
            let mut conn = stderr_conn;
            let mut err = tokio::io::stderr();
            let _ = tokio::io::copy(&mut conn, &mut err).await;
            let _ = err.flush().await;
        });

        let reply: Reply = io.recv().await?;
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        if !reply.is_ok() {
            return Err(AppServerError::Request(reply.message()));
        }
        let state: FinalState = serde_json::from_value(reply.content)
            .map_err(|e| AppServerError::Request(e.to_string()))?;
        Ok((ack, state))
    }
}

impl AppRequest {
    pub fn new(service: &str, command: Command) -> Self {
        Self {
            service: service.to_owned(),
            command,
            appid: None,
            mode: None,
            title: None,
            args: None,
            write_request: None,
            exec: None,
            exec_path: None,
            path: None,
        }
    }
}
