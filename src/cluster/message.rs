//! Message passing between server-selection callers and the background monitor tasks.

use std::time::Duration;

use tokio::sync::watch;

/// Lets a blocked `select_node` call ask every monitor to recheck its node immediately, and lets
/// monitors tell blocked callers a new snapshot is available worth re-evaluating against.
///
/// Grounded on the broadcast-channel message manager pattern, but built on `watch` instead of
/// `broadcast`: a `watch` channel only ever holds the latest value, which is exactly what a
/// "did anything change since I last looked" signal needs and avoids a slow subscriber missing a
/// burst of wakeups.
#[derive(Debug)]
pub(crate) struct ClusterMessageManager {
    check_requested: watch::Sender<u64>,
    topology_changed: watch::Sender<u64>,
}

impl ClusterMessageManager {
    pub(crate) fn new() -> Self {
        let (check_requested, _) = watch::channel(0);
        let (topology_changed, _) = watch::channel(0);
        Self {
            check_requested,
            topology_changed,
        }
    }

    /// Called by a `select_node` caller that failed to find an acceptable node, to make every
    /// monitor recheck its node ahead of its normal heartbeat schedule.
    pub(crate) fn request_immediate_check(&self) {
        self.check_requested.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub(crate) fn subscribe_to_check_requests(&self) -> ClusterMessageSubscriber {
        ClusterMessageSubscriber::new(self.check_requested.subscribe())
    }

    /// Called by a monitor after a heartbeat produces a snapshot that differs from the previous
    /// one, waking any callers blocked in `select_node`.
    pub(crate) fn notify_topology_changed(&self) {
        self.topology_changed.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub(crate) fn subscribe_to_topology_changes(&self) -> ClusterMessageSubscriber {
        ClusterMessageSubscriber::new(self.topology_changed.subscribe())
    }
}

pub(crate) struct ClusterMessageSubscriber {
    receiver: watch::Receiver<u64>,
}

impl ClusterMessageSubscriber {
    fn new(receiver: watch::Receiver<u64>) -> Self {
        Self { receiver }
    }

    /// Waits for either `timeout` to elapse or a new message, returning `true` iff a message was
    /// observed.
    pub(crate) async fn wait_for_message(&mut self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.receiver.changed())
            .await
            .map(|r| r.is_ok())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn notify_wakes_a_waiting_subscriber() {
        let manager = ClusterMessageManager::new();
        let mut subscriber = manager.subscribe_to_topology_changes();

        let wait = tokio::spawn(async move {
            subscriber.wait_for_message(Duration::from_secs(5)).await
        });
        tokio::task::yield_now().await;
        manager.notify_topology_changed();

        assert!(wait.await.unwrap());
    }

    #[tokio::test]
    async fn wait_times_out_without_a_message() {
        let manager = ClusterMessageManager::new();
        let mut subscriber = manager.subscribe_to_check_requests();
        assert!(!subscriber.wait_for_message(Duration::from_millis(10)).await);
    }
}
