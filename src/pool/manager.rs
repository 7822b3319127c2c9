//! The channel a dropped [`super::Connection`] uses to check itself back in.

use tokio::sync::mpsc;

use super::Connection;

#[derive(Debug)]
pub(super) enum PoolManagementRequest {
    CheckIn(Connection),
    Clear,
    Close,
}

/// A cheap, cloneable sender half handed to every checked-out [`Connection`] so it can return
/// itself without the pool needing a strong reference back to each of its outstanding leases.
#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    sender: mpsc::UnboundedSender<PoolManagementRequest>,
}

impl PoolManager {
    pub(super) fn new() -> (Self, mpsc::UnboundedReceiver<PoolManagementRequest>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub(super) fn check_in(&self, connection: Connection) {
        let _ = self.sender.send(PoolManagementRequest::CheckIn(connection));
    }

    pub(super) fn clear(&self) {
        let _ = self.sender.send(PoolManagementRequest::Clear);
    }

    pub(super) fn close(&self) {
        let _ = self.sender.send(PoolManagementRequest::Close);
    }
}
