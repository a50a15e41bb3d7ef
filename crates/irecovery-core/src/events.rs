//! Session event observer.
//!
//! A session carries at most one observer; each of its six methods is
//! optional (the defaults do nothing), replacing the six parallel callback
//! slots of the C API. Observers must be `Send + Sync` because reconnect
//! moves them between sessions.

use tracing::{debug, info};

/// Observer over the six session events. All methods have no-op defaults;
/// implement only what you need.
pub trait EventObserver: Send + Sync {
    /// Data read back from the device. Return `true` to stop the read loop.
    fn on_received(&self, _data: &[u8]) -> bool {
        false
    }

    /// Transfer progress. `operation` is `"Uploading"` or `"Downloading"`.
    fn on_progress(&self, _percent: f64, _bytes: u64, _operation: &str) {}

    /// A session was opened (or reopened by reconnect).
    fn on_connected(&self) {}

    /// About to send `command`. Return `true` to consume it: the command is
    /// not sent and the operation reports success.
    fn on_pre_command(&self, _command: &str) -> bool {
        false
    }

    /// `command` was sent. Return `true` to skip any follow-up handling.
    fn on_post_command(&self, _command: &str) -> bool {
        false
    }

    /// The session is closing.
    fn on_disconnected(&self) {}
}

/// Observer that forwards everything to `tracing`.
pub struct TracingObserver;

impl EventObserver for TracingObserver {
    fn on_received(&self, data: &[u8]) -> bool {
        debug!(len = data.len(), "received data");
        false
    }

    fn on_progress(&self, percent: f64, bytes: u64, operation: &str) {
        debug!(operation, bytes, "{:.1}%", percent);
    }

    fn on_connected(&self) {
        info!("device connected");
    }

    fn on_pre_command(&self, command: &str) -> bool {
        debug!(command, "sending command");
        false
    }

    fn on_post_command(&self, command: &str) -> bool {
        debug!(command, "command sent");
        false
    }

    fn on_disconnected(&self) {
        info!("device disconnected");
    }
}
