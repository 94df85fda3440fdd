//! Daemon event broadcast
//!
//! Control-plane connections that subscribe receive these as push
//! notifications; internal listeners use the same channel.

use passim_core::Status;
use serde::Serialize;
use tokio::sync::broadcast;

/// Events observable on the control plane.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data")]
#[serde(rename_all = "kebab-case")]
pub enum DaemonEvent {
    /// The item set changed.
    Changed,
    /// The daemon status property changed.
    StatusChanged { status: Status },
}

pub type EventSender = broadcast::Sender<DaemonEvent>;
pub type EventReceiver = broadcast::Receiver<DaemonEvent>;

pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    broadcast::channel(capacity)
}
