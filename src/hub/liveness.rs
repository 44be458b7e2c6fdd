//! Liveness monitor
//!
//! Periodically sweeps the hub: Open sessions that have been silent longer
//! than the liveness timeout start closing, and sessions stuck in Closing
//! past the grace period are forced Closed and unregistered.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info};

use super::Hub;

pub struct LivenessMonitor {
    hub: Arc<Hub>,
    interval: Duration,
}

impl LivenessMonitor {
    pub fn new(hub: Arc<Hub>, interval: Duration) -> Self {
        Self { hub, interval }
    }

    /// Run the sweep loop until the shutdown signal fires
    pub fn spawn(self, shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown_rx))
    }

    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Liveness monitor running every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.hub.sweep(std::time::Instant::now());
                    if !report.is_empty() {
                        info!(
                            "Liveness sweep: {} timed out, {} finalized",
                            report.timed_out.len(),
                            report.finalized.len()
                        );
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Liveness monitor stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::{HubSettings, SessionState};

    #[tokio::test]
    async fn test_monitor_closes_silent_session() {
        let hub = Arc::new(Hub::new(HubSettings {
            liveness_timeout: Duration::from_millis(20),
            close_grace: Duration::from_millis(20),
            ..HubSettings::default()
        }));
        let connection = hub.admit("127.0.0.1:7000".parse().unwrap()).unwrap();
        hub.open(connection.id()).unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = LivenessMonitor::new(Arc::clone(&hub), Duration::from_millis(5))
            .spawn(shutdown_rx);

        let mut state_rx = connection.watch_state();
        let closed = time::timeout(
            Duration::from_secs(2),
            state_rx.wait_for(|state| *state == SessionState::Closed),
        )
        .await
        .is_ok();
        assert!(closed);
        assert_eq!(hub.session_count(), 0);

        shutdown_tx.send(()).unwrap();
        handle.await.unwrap();
    }
}
