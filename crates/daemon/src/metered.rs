//! Metered-connection state
//!
//! A watch channel describing whether the default connection is usage
//! billed. Platform glue (or a test) feeds the sender; the daemon
//! re-registers on every flip and refuses to advertise while metered.

use tokio::sync::watch;

pub struct NetworkMonitor {
    tx: watch::Sender<bool>,
}

impl NetworkMonitor {
    /// Starts unmetered.
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, rx)
    }

    pub fn set_metered(&self, metered: bool) {
        // send_if_modified so unchanged reports do not trigger re-registration
        self.tx.send_if_modified(|current| {
            if *current == metered {
                false
            } else {
                *current = metered;
                true
            }
        });
    }

    pub fn is_metered(&self) -> bool {
        *self.tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flip_notifies_watchers() {
        let (monitor, mut rx) = NetworkMonitor::new();
        assert!(!*rx.borrow());

        monitor.set_metered(true);
        assert!(rx.has_changed().unwrap());
        rx.borrow_and_update();
        assert!(monitor.is_metered());

        // repeating the same state is not a change
        monitor.set_metered(true);
        assert!(!rx.has_changed().unwrap());
    }
}
