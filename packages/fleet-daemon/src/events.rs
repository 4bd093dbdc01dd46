//! Application lifecycle events.
//!
//! The daemon publishes a notice when an application starts running and when
//! it reaches a terminal state; synchronous submitters on the front door
//! subscribe and wait for their application id.

use fleet_master::AppStatus;
use tokio::sync::broadcast;

#[derive(Debug, Clone)]
pub struct AppEvent {
    pub app_id: u64,
    pub status: AppStatus,
    pub exit_code: Option<i32>,
    pub path: String,
}

/// Broadcast bus for [`AppEvent`]s.
#[derive(Debug, Clone)]
pub struct AppEventBus {
    tx: broadcast::Sender<AppEvent>,
}

impl AppEventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AppEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: AppEvent) {
        // nobody listening is fine
        let _ = self.tx.send(event);
    }
}

impl Default for AppEventBus {
    fn default() -> Self {
        Self::new()
    }
}
