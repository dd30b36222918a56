//! Connectivity monitor.
//!
//! An explicit, injectable object rather than ambient global state: the
//! facade short-circuits remote attempts through [`ConnectivityMonitor::is_online`],
//! and interested tasks watch transitions through [`ConnectivityMonitor::subscribe`].

use log::info;
use tokio::sync::watch;

/// Tracks the runtime's online/offline signal.
pub struct ConnectivityMonitor {
    sender: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (sender, _) = watch::channel(initially_online);
        Self { sender }
    }

    pub fn is_online(&self) -> bool {
        *self.sender.borrow()
    }

    /// Feed a connectivity transition in from the runtime's online/offline
    /// events. Repeated signals with the same value are dropped.
    pub fn set_online(&self, online: bool) {
        let changed = self.sender.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            info!(
                "connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
        }
    }

    /// Watch receiver for transition-driven work (queue replay on reconnect).
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.sender.subscribe()
    }
}

impl Default for ConnectivityMonitor {
    fn default() -> Self {
        Self::new(true)
    }
}
