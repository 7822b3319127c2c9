//! Per-node heartbeat loop.

use std::{sync::Arc, time::Duration};

use tokio::sync::watch;

use crate::{config::ServerAddress, node::{HeartbeatSource, NodeDescription}};

use super::Cluster;

/// A handle to a running monitor task, used only to stop it.
pub(super) struct Handle {
    stop: watch::Sender<bool>,
}

impl Handle {
    pub(super) fn stop(self) {
        let _ = self.stop.send(true);
    }
}

pub(super) struct Monitor {
    address: ServerAddress,
    heartbeat_source: Arc<dyn HeartbeatSource>,
    cluster: Cluster,
    heartbeat_frequency: Duration,
    min_heartbeat_frequency: Duration,
    heartbeat_failure_threshold: u32,
    stop: watch::Receiver<bool>,
    consecutive_failures: u32,
}

impl Monitor {
    /// Spawns the monitor loop as a background task and returns a handle that can stop it.
    #[allow(clippy::too_many_arguments)]
    pub(super) fn start(
        address: ServerAddress,
        heartbeat_source: Arc<dyn HeartbeatSource>,
        cluster: Cluster,
        heartbeat_frequency: Duration,
        min_heartbeat_frequency: Duration,
        heartbeat_failure_threshold: u32,
    ) -> Handle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let monitor = Monitor {
            address,
            heartbeat_source,
            cluster,
            heartbeat_frequency,
            min_heartbeat_frequency,
            heartbeat_failure_threshold: heartbeat_failure_threshold.max(1),
            stop: stop_rx,
            consecutive_failures: 0,
        };
        tokio::spawn(monitor.execute());
        Handle { stop: stop_tx }
    }

    async fn execute(mut self) {
        let mut check_requests = self.cluster.check_request_subscriber();

        while !*self.stop.borrow() {
            self.check_once().await;

            tokio::time::sleep(self.min_heartbeat_frequency).await;

            let remaining = self
                .heartbeat_frequency
                .saturating_sub(self.min_heartbeat_frequency);

            tokio::select! {
                _ = check_requests.wait_for_message(remaining) => {}
                _ = self.stop.changed() => {}
            }
        }
    }

    #[cfg_attr(
        feature = "tracing-unstable",
        tracing::instrument(level = "debug", skip(self), fields(address = %self.address))
    )]
    async fn check_once(&mut self) {
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!("sending heartbeat");
        match self.heartbeat_source.check(&self.address).await {
            Ok((reply, round_trip_time)) => {
                self.consecutive_failures = 0;
                #[cfg(feature = "tracing-unstable")]
                tracing::debug!(?round_trip_time, "heartbeat succeeded");
                let description =
                    NodeDescription::from_reply(self.address.clone(), &reply, round_trip_time);
                self.cluster.apply_update(description);
                self.cluster.discover_hosts(&reply.hosts).await;
            }
            Err(error) => {
                self.consecutive_failures += 1;
                #[cfg(feature = "tracing-unstable")]
                tracing::warn!(%error, failures = self.consecutive_failures, "heartbeat failed");
                let description = NodeDescription::failed(
                    self.address.clone(),
                    error.to_string(),
                    self.consecutive_failures < self.heartbeat_failure_threshold,
                );
                self.cluster.apply_update(description);
            }
        }
    }
}
