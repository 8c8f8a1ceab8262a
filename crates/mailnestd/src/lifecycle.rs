//! Per-server lifecycle tracking: sessions and acceptors hold an
//! Activity token while they run, and shutdown flips a watch channel
//! then waits for every token to drop.
//!
//! Unlike a daemon there may be several servers in one test process,
//! so this state is per instance rather than process-global.
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Represents work that should complete before shutdown finishes.
/// Cloned freely; `Lifecycle::shutdown` returns once every clone has
/// dropped (or its timeout expires).
#[derive(Clone)]
pub struct Activity {
    _tx: mpsc::Sender<()>,
}

impl std::fmt::Debug for Activity {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Activity").finish()
    }
}

/// Used by idling code: select on your work and `shutting_down` to
/// wake promptly when the server stops.
pub struct ShutdownSubscription {
    rx: watch::Receiver<bool>,
}

impl Clone for ShutdownSubscription {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl ShutdownSubscription {
    pub async fn shutting_down(&mut self) {
        while !*self.rx.borrow_and_update() {
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

pub struct Lifecycle {
    shutdown_tx: watch::Sender<bool>,
    active: parking_lot::Mutex<Option<Activity>>,
    activity_rx: tokio::sync::Mutex<Option<mpsc::Receiver<()>>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (activity_tx, activity_rx) = mpsc::channel(1);
        Self {
            shutdown_tx,
            active: parking_lot::Mutex::new(Some(Activity { _tx: activity_tx })),
            activity_rx: tokio::sync::Mutex::new(Some(activity_rx)),
        }
    }

    /// Obtain an Activity token, or None if shutdown already began.
    pub fn activity(&self) -> Option<Activity> {
        self.active.lock().clone()
    }

    pub fn subscribe(&self) -> ShutdownSubscription {
        ShutdownSubscription {
            rx: self.shutdown_tx.subscribe(),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.shutdown_tx.borrow()
    }

    /// Signal shutdown and wait up to `timeout` for all activity to
    /// drain. Safe to call more than once.
    pub async fn shutdown(&self, timeout: Duration) {
        self.shutdown_tx.send_replace(true);
        self.active.lock().take();
        let rx = self.activity_rx.lock().await.take();
        if let Some(mut rx) = rx {
            if tokio::time::timeout(timeout, rx.recv()).await.is_err() {
                tracing::warn!("sessions did not drain within {timeout:?}");
            }
        }
    }
}
