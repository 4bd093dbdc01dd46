//! Shutdown signalling and the interrupt mask.
//!
//! The master loop applies each drained mutation batch with interrupts
//! masked: a termination request arriving mid-batch is deferred until the
//! mask guard drops, so users observe either the whole batch or none of it.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Broadcasts the termination request to the daemon loop and its helpers.
#[derive(Debug)]
pub struct ShutdownController {
    tx: watch::Sender<bool>,
}

impl ShutdownController {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Requests termination. Loops honour it at their next unmasked check.
    pub fn trigger(&self) {
        // receivers may all be gone during teardown
        let _ = self.tx.send(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }
}

impl Default for ShutdownController {
    fn default() -> Self {
        Self::new()
    }
}

/// Counted interrupt mask with RAII guards.
#[derive(Debug, Clone, Default)]
pub struct InterruptMask {
    depth: Arc<AtomicU32>,
}

impl InterruptMask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Masks interrupts until the returned guard drops.
    pub fn block(&self) -> InterruptGuard {
        self.depth.fetch_add(1, Ordering::SeqCst);
        InterruptGuard {
            depth: Arc::clone(&self.depth),
        }
    }

    pub fn is_masked(&self) -> bool {
        self.depth.load(Ordering::SeqCst) > 0
    }
}

/// Unmasks on drop, also during unwinding.
#[derive(Debug)]
pub struct InterruptGuard {
    depth: Arc<AtomicU32>,
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }
}

/// True when termination was requested and no mask defers it.
pub fn should_stop(shutdown: &watch::Receiver<bool>, mask: &InterruptMask) -> bool {
    *shutdown.borrow() && !mask.is_masked()
}
