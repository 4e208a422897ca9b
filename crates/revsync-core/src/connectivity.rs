//! Online/offline status as seen by the sync worker.

use tokio::sync::watch;

/// Reports whether network attempts are currently worthwhile.
pub trait ConnectivityOracle: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Oracle for environments without a network monitor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlwaysOnline;

impl ConnectivityOracle for AlwaysOnline {
    fn is_online(&self) -> bool {
        true
    }
}

/// Create a status pair starting at `online`.
#[must_use]
pub fn network_status(online: bool) -> (NetworkStatusSetter, NetworkStatus) {
    let (tx, rx) = watch::channel(online);
    (NetworkStatusSetter { tx }, NetworkStatus { rx })
}

/// Write side, owned by the platform layer that observes the network.
#[derive(Debug)]
pub struct NetworkStatusSetter {
    tx: watch::Sender<bool>,
}

impl NetworkStatusSetter {
    /// Publish a new status. Unchanged values wake nobody.
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|current| {
            let changed = *current != online;
            *current = online;
            changed
        });
    }

    #[must_use]
    pub fn status(&self) -> NetworkStatus {
        NetworkStatus {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side; cheap to clone.
#[derive(Debug, Clone)]
pub struct NetworkStatus {
    rx: watch::Receiver<bool>,
}

impl NetworkStatus {
    /// Wait for the next status change. Returns `false` once the setter is
    /// gone and no further change can happen.
    pub async fn changed(&mut self) -> bool {
        self.rx.changed().await.is_ok()
    }
}

impl ConnectivityOracle for NetworkStatus {
    fn is_online(&self) -> bool {
        *self.rx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn status_follows_the_setter() {
        let (setter, mut status) = network_status(false);
        assert!(!status.is_online());

        setter.set_online(true);
        assert!(status.changed().await);
        assert!(status.is_online());
        assert!(setter.status().is_online());

        drop(setter);
        assert!(!status.changed().await);
        assert!(status.is_online(), "last value is kept");
    }

    #[test]
    fn oracles_are_usable_as_trait_objects() {
        let (_setter, status) = network_status(false);
        let oracles: [&dyn ConnectivityOracle; 2] = [&AlwaysOnline, &status];
        let online: Vec<bool> = oracles.iter().map(|oracle| oracle.is_online()).collect();
        assert_eq!(online, vec![true, false]);
    }
}
