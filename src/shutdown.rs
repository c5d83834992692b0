//! Cooperative cancellation, shared by every long-running component.
//!
//! The original implementation mixes a `ShutdownAware` class into every
//! worker via multiple inheritance; here the same aspect is a small
//! standalone handle built on a `tokio::sync::watch` channel (the idiom the
//! rest of this codebase already uses for listener shutdown — see
//! `LocalProxy` in the receiver service). A single [`Shutdown`] is created
//! per session by the orchestrator; every component gets a cloned
//! [`ShutdownHandle`] and rechecks it on every loop tick.

use tokio::sync::watch;

/// Owns the shutdown signal for one session. Dropped (or told to
/// [`Shutdown::request`]) when the orchestrator tears the session down.
#[derive(Debug)]
pub struct Shutdown {
    tx: watch::Sender<bool>,
}

impl Shutdown {
    pub fn new() -> (Self, ShutdownHandle) {
        let (tx, rx) = watch::channel(false);
        let handle = ShutdownHandle { rx };
        (Shutdown { tx }, handle)
    }

    /// Signal every handle derived from this instance to stop.
    pub fn request(&self) {
        let _ = self.tx.send(true);
    }

    /// Builds a handle that reports requested as soon as either `a` or `b`
    /// does. Used where a component must stop on either an external
    /// process-wide shutdown or a session-local teardown, whichever comes
    /// first (e.g. a relay that outlives the phase that created it).
    pub fn merge(mut a: ShutdownHandle, mut b: ShutdownHandle) -> ShutdownHandle {
        let (combined, handle) = Shutdown::new();
        if a.is_requested() || b.is_requested() {
            combined.request();
            return handle;
        }
        tokio::spawn(async move {
            tokio::select! {
                () = a.requested() => {}
                () = b.requested() => {}
            }
            combined.request();
        });
        handle
    }
}

/// A component's view of the session's shutdown flag. Cheaply cloneable.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    rx: watch::Receiver<bool>,
}

impl ShutdownHandle {
    /// True once [`Shutdown::request`] has been called.
    pub fn is_requested(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves as soon as shutdown is requested; resolves immediately if it
    /// already has been. Intended for use inside `tokio::select!` alongside
    /// a component's normal I/O readiness branches.
    pub async fn requested(&mut self) {
        if self.is_requested() {
            return;
        }
        while self.rx.changed().await.is_ok() {
            if self.is_requested() {
                return;
            }
        }
    }
}
