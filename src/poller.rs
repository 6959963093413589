//! Fixed-interval driver
//!
//! Lists nodes every `reconcile_interval` and hands the snapshot to the
//! reconciler. Tick 0 and every `full_reconcile_every`th tick after it are full
//! reconciles. A tick whose node listing fails is skipped; the loop itself only
//! stops on cancellation.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StewardConfig;
use crate::gateway::NodeApi;
use crate::reconciler::Reconciler;
use crate::Error;

/// Whether tick number `tick` is a full reconcile
pub fn is_full_tick(tick: u64, full_every: u64) -> bool {
    full_every <= 1 || tick % full_every == 0
}

/// Drives the reconciler on a fixed interval
pub struct Poller {
    nodes: Arc<dyn NodeApi>,
    reconciler: Arc<Reconciler>,
    interval: Duration,
    full_every: u64,
}

impl Poller {
    /// Create a poller using the cadence from `config`
    pub fn new(
        nodes: Arc<dyn NodeApi>,
        reconciler: Arc<Reconciler>,
        config: &StewardConfig,
    ) -> Self {
        Self {
            nodes,
            reconciler,
            interval: config.reconcile_interval,
            full_every: config.full_reconcile_every,
        }
    }

    /// Run until `cancel` fires. The first tick happens immediately.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval = ?self.interval,
            full_every = self.full_every,
            "poller started"
        );

        let mut tick: u64 = 0;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("poller stopped");
                    return;
                }
                _ = interval.tick() => {}
            }

            let full = is_full_tick(tick, self.full_every);
            tick = tick.wrapping_add(1);

            match self.tick(&cancel, full).await {
                Ok(()) => debug!(tick, full, "tick complete"),
                Err(e) if e.is_cancelled() => {
                    info!("tick cancelled");
                    return;
                }
                Err(e) => warn!(tick, full, error = %e, "tick failed"),
            }
        }
    }

    /// Run a single tick. A failed node listing is returned without reconciling.
    pub async fn tick(&self, cancel: &CancellationToken, full: bool) -> Result<(), Error> {
        let nodes = self.nodes.list_nodes().await?;
        self.reconciler.reconcile(cancel, &nodes, full).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::testing::MockGateway;
    use crate::gateway::MockNodeApi;
    use parking_lot::Mutex;

    fn quiet_config() -> StewardConfig {
        StewardConfig {
            rotate_certs: false,
            ..Default::default()
        }
    }

    #[test]
    fn test_full_tick_cadence() {
        assert!(is_full_tick(0, 60));
        assert!(!is_full_tick(1, 60));
        assert!(!is_full_tick(59, 60));
        assert!(is_full_tick(60, 60));
        assert!(is_full_tick(120, 60));
        assert!(is_full_tick(7, 1));
    }

    /// Story: the API server is briefly down
    ///
    /// The tick that cannot list nodes is skipped, and the poller keeps going
    /// on schedule until it is cancelled.
    #[tokio::test(start_paused = true)]
    async fn story_list_failure_skips_tick_and_loop_continues() {
        let calls = Arc::new(Mutex::new(0u32));
        let mut nodes = MockNodeApi::new();
        let c = calls.clone();
        nodes.expect_list_nodes().returning(move || {
            let mut n = c.lock();
            *n += 1;
            if *n == 2 {
                Err(Error::not_found("Node", "list"))
            } else {
                Ok(vec![])
            }
        });

        let config = quiet_config();
        let reconciler = Arc::new(Reconciler::builder(MockGateway::new().build(), config.clone()).build());
        let poller = Arc::new(Poller::new(Arc::new(nodes), reconciler, &config));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let poller = poller.clone();
            let cancel = cancel.clone();
            async move { poller.run(cancel).await }
        });

        // ticks at 0s, 60s, 120s, 180s
        tokio::time::sleep(Duration::from_secs(190)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(*calls.lock(), 4);
    }

    #[tokio::test]
    async fn test_tick_surfaces_list_failure() {
        let mut nodes = MockNodeApi::new();
        nodes
            .expect_list_nodes()
            .returning(|| Err(Error::not_found("Node", "list")));

        let config = quiet_config();
        let reconciler = Arc::new(Reconciler::builder(MockGateway::new().build(), config.clone()).build());
        let poller = Poller::new(Arc::new(nodes), reconciler, &config);

        assert!(poller
            .tick(&CancellationToken::new(), true)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_cancelled_before_first_tick() {
        let mut nodes = MockNodeApi::new();
        nodes.expect_list_nodes().never();

        let config = quiet_config();
        let reconciler = Arc::new(Reconciler::builder(MockGateway::new().build(), config.clone()).build());
        let poller = Poller::new(Arc::new(nodes), reconciler, &config);

        let cancel = CancellationToken::new();
        cancel.cancel();
        poller.run(cancel).await;
    }
}
