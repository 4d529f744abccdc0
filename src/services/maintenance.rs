//! Periodic pool maintenance
//!
//! One cycle refreshes the free-proxy list when stale, tops up the healthy
//! floor, prunes expired sticky assignments and cooldown windows, and
//! re-warms the forwarder farm. [`MaintenanceService::start`] runs cycles on
//! an interval until the returned handle is shut down.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument};

use crate::config::{Config, FreeConfig};
use crate::proxy::cooldown::ServiceCooldownTracker;
use crate::proxy::farm::ForwarderFarm;
use crate::proxy::free_pool::FreeProxyPool;
use crate::proxy::sticky::StickyAssignmentRegistry;

/// What one maintenance cycle did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub candidates_added: usize,
    pub healthy: usize,
    pub sticky_pruned: usize,
    pub cooldowns_pruned: usize,
    pub forwarders: usize,
}

pub struct MaintenanceService {
    pool: Arc<FreeProxyPool>,
    farm: Arc<ForwarderFarm>,
    sticky: Arc<StickyAssignmentRegistry>,
    cooldowns: Arc<ServiceCooldownTracker>,
    free: FreeConfig,
    forwarder_count: usize,
    interval: Duration,
    cycles: AtomicU64,
}

impl MaintenanceService {
    pub fn new(
        config: &Config,
        pool: Arc<FreeProxyPool>,
        farm: Arc<ForwarderFarm>,
        sticky: Arc<StickyAssignmentRegistry>,
        cooldowns: Arc<ServiceCooldownTracker>,
    ) -> Self {
        Self {
            pool,
            farm,
            sticky,
            cooldowns,
            free: config.free.clone(),
            forwarder_count: config.paid.forwarder_count,
            interval: config.workers.maintenance_interval,
            cycles: AtomicU64::new(0),
        }
    }

    /// Completed cycles so far
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    #[instrument(skip(self))]
    pub async fn refresh_cycle(&self) -> CycleReport {
        let candidates_added = self.pool.refresh_if_stale(false).await;
        let healthy = self
            .pool
            .ensure_healthy_floor(
                self.free.min_healthy,
                self.free.sample_size,
                self.free.validate_concurrency,
                self.free.validate_timeout,
            )
            .await;
        let sticky_pruned = self.sticky.prune_expired();
        let cooldowns_pruned = self.cooldowns.prune();
        let forwarders = self.farm.warm(self.forwarder_count).await;

        self.cycles.fetch_add(1, Ordering::Relaxed);
        let report = CycleReport {
            candidates_added,
            healthy,
            sticky_pruned,
            cooldowns_pruned,
            forwarders,
        };
        debug!(?report, "Maintenance cycle complete");
        report
    }

    /// Run cycles every `interval` until the handle is shut down. The first
    /// cycle runs one interval after start.
    pub fn start(self: Arc<Self>) -> MaintenanceHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let service = self;

        let task = tokio::spawn(async move {
            info!(
                "Starting pool maintenance (interval: {}s)",
                service.interval.as_secs()
            );
            let mut ticker = interval(service.interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        service.refresh_cycle().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("Pool maintenance shutting down");
                            break;
                        }
                    }
                }
            }
        });

        MaintenanceHandle {
            shutdown_tx,
            task: Mutex::new(Some(task)),
        }
    }
}

/// Cancellation handle for a running maintenance loop
pub struct MaintenanceHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl MaintenanceHandle {
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    pub fn is_running(&self) -> bool {
        self.task
            .lock()
            .as_ref()
            .map(|t| !t.is_finished())
            .unwrap_or(false)
    }

    /// Shut down and wait for the loop to exit
    pub async fn stop(&self) {
        self.shutdown();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::models::Upstream;
    use crate::proxy::forwarder::ForwarderSettings;
    use crate::proxy::selector::tests::PassAll;
    use crate::proxy::source::StaticCandidateSource;
    use crate::proxy::sticky::StickyTarget;

    struct Fixture {
        clock: Arc<ManualClock>,
        sticky: Arc<StickyAssignmentRegistry>,
        cooldowns: Arc<ServiceCooldownTracker>,
        service: Arc<MaintenanceService>,
    }

    fn fixture(interval: Duration) -> Fixture {
        let mut config = Config::default();
        config.paid.upstreams = vec![Upstream::parse("http://127.0.0.1:9200").unwrap()];
        config.paid.forwarder_count = 2;
        config.free.min_healthy = 2;
        config.workers.maintenance_interval = interval;

        let clock = Arc::new(ManualClock::new());
        let sticky = Arc::new(StickyAssignmentRegistry::new(clock.clone()));
        let cooldowns = Arc::new(ServiceCooldownTracker::new(clock.clone()));
        let pool = Arc::new(FreeProxyPool::new(
            &config.free,
            Arc::new(StaticCandidateSource::new(["1.1.1.1:80", "2.2.2.2:80"])),
            Arc::new(PassAll),
            clock.clone(),
        ));
        let farm = Arc::new(ForwarderFarm::new(
            config.paid.upstreams.clone(),
            ForwarderSettings::from_config(&config),
            sticky.clone(),
            config.workers.sticky_ttl,
        ));
        let service = Arc::new(MaintenanceService::new(
            &config,
            pool,
            farm,
            sticky.clone(),
            cooldowns.clone(),
        ));
        Fixture {
            clock,
            sticky,
            cooldowns,
            service,
        }
    }

    #[tokio::test]
    async fn test_refresh_cycle() {
        let f = fixture(Duration::from_secs(60));
        f.sticky
            .assign("chase:worker-0", StickyTarget::Forwarder(1), Duration::from_secs(10));
        f.cooldowns.cooldown("chase", Duration::from_secs(10));
        f.clock.advance(Duration::from_secs(30));

        let report = f.service.refresh_cycle().await;
        assert_eq!(
            report,
            CycleReport {
                candidates_added: 2,
                healthy: 2,
                sticky_pruned: 1,
                cooldowns_pruned: 1,
                forwarders: 1,
            }
        );

        // Nothing is stale on the next cycle.
        let report = f.service.refresh_cycle().await;
        assert_eq!(report.candidates_added, 0);
        assert_eq!(report.healthy, 2);
        assert_eq!(f.service.cycles(), 2);
        f.service.farm.shutdown();
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let f = fixture(Duration::from_millis(20));
        let handle = f.service.clone().start();

        tokio::time::sleep(Duration::from_millis(90)).await;
        assert!(handle.is_running());
        assert!(f.service.cycles() >= 2);

        handle.stop().await;
        assert!(!handle.is_running());
        let cycles = f.service.cycles();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(f.service.cycles(), cycles);
        f.service.farm.shutdown();
    }
}
