//! Process-wide write token.
//!
//! Exactly one writer (daemon batch, dealer commit, or a web write process)
//! may be active at any instant. A second writer observes
//! [`WriteLock::inhibit_write`] and must fail fast instead of waiting: the
//! inventory is about to change under it.

use parking_lot::Mutex;

#[derive(Debug, Default)]
struct WriteState {
    /// Name of the writer currently holding the token
    holder: Option<String>,
    /// Registered web write process, if any
    web_writer: Option<(String, u32)>,
}

/// Named single-writer token with web-writer registration.
#[derive(Debug, Default)]
pub struct WriteLock {
    state: Mutex<WriteState>,
}

impl WriteLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the token for `owner`. Returns false when another writer
    /// already holds it.
    pub fn lock(&self, owner: &str) -> bool {
        let mut state = self.state.lock();
        match &state.holder {
            Some(holder) if holder != owner => false,
            _ => {
                state.holder = Some(owner.to_owned());
                true
            }
        }
    }

    /// Releases the token if `owner` holds it.
    pub fn unlock(&self, owner: &str) {
        let mut state = self.state.lock();
        if state.holder.as_deref() == Some(owner) {
            state.holder = None;
        }
    }

    /// True iff any writer is currently active.
    pub fn inhibit_write(&self) -> bool {
        let state = self.state.lock();
        state.holder.is_some() || state.web_writer.is_some()
    }

    /// Current holder name, for 503-style reporting.
    pub fn holder(&self) -> Option<String> {
        let state = self.state.lock();
        state
            .holder
            .clone()
            .or_else(|| state.web_writer.as_ref().map(|(host, pid)| {
                format!("web:{}:{}", host, pid)
            }))
    }

    /// Registers a web write process.
    pub fn start_write_web(&self, host: &str, pid: u32) {
        let mut state = self.state.lock();
        state.web_writer = Some((host.to_owned(), pid));
    }

    /// Clears the web write registration.
    pub fn stop_write_web(&self) {
        let mut state = self.state.lock();
        state.web_writer = None;
    }
}
