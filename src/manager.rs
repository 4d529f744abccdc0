//! Owner of all egress pool state
//!
//! A [`ProxyManager`] is built once per process (or per test) and hands out
//! the selector and worker pool. Nothing lives in globals, so two managers
//! never share health, cooldown, or sticky state.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{error, info};

use crate::clock::{SharedClock, SystemClock};
use crate::config::Config;
use crate::error::{EgressError, Result};
use crate::models::PoolSnapshot;
use crate::proxy::cooldown::ServiceCooldownTracker;
use crate::proxy::farm::ForwarderFarm;
use crate::proxy::forwarder::ForwarderSettings;
use crate::proxy::free_pool::FreeProxyPool;
use crate::proxy::geo::{GeoLocator, HttpGeoLocator};
use crate::proxy::precheck::{HttpPrechecker, Prechecker};
use crate::proxy::selector::ProxySelector;
use crate::proxy::source::{CandidateSource, HttpCandidateSource};
use crate::proxy::sticky::StickyAssignmentRegistry;
use crate::proxy::validator::{ConnectValidator, ProxyValidator};
use crate::runner::worker_pool::WorkerPool;
use crate::services::maintenance::{MaintenanceHandle, MaintenanceService};

/// External collaborators the manager talks to
pub struct ManagerParts {
    pub source: Arc<dyn CandidateSource>,
    pub validator: Arc<dyn ProxyValidator>,
    pub prechecker: Arc<dyn Prechecker>,
    pub geo: Arc<dyn GeoLocator>,
    pub clock: SharedClock,
}

impl ManagerParts {
    /// Network-backed parts for production use
    pub fn from_config(config: &Config) -> Result<Self> {
        Ok(Self {
            source: Arc::new(HttpCandidateSource::from_config(&config.free)?),
            validator: Arc::new(ConnectValidator::from_target(&config.free.validate_target)?),
            prechecker: Arc::new(HttpPrechecker::new()),
            geo: Arc::new(HttpGeoLocator::new(config.selection.geoip_url.clone())),
            clock: Arc::new(SystemClock),
        })
    }
}

pub struct ProxyManager {
    config: Config,
    clock: SharedClock,
    sticky: Arc<StickyAssignmentRegistry>,
    cooldowns: Arc<ServiceCooldownTracker>,
    farm: Arc<ForwarderFarm>,
    pool: Arc<FreeProxyPool>,
    selector: Arc<ProxySelector>,
    workers: Arc<WorkerPool>,
    maintenance: Arc<MaintenanceService>,
    maintenance_handle: Mutex<Option<MaintenanceHandle>>,
}

impl ProxyManager {
    pub fn new(config: Config) -> Result<Self> {
        let parts = ManagerParts::from_config(&config)?;
        Ok(Self::with_parts(config, parts))
    }

    pub fn with_parts(config: Config, parts: ManagerParts) -> Self {
        let clock = parts.clock;
        let sticky = Arc::new(StickyAssignmentRegistry::new(clock.clone()));
        let cooldowns = Arc::new(ServiceCooldownTracker::new(clock.clone()));
        let farm = Arc::new(ForwarderFarm::new(
            config.paid.upstreams.clone(),
            ForwarderSettings::from_config(&config),
            sticky.clone(),
            config.workers.sticky_ttl,
        ));
        let pool = Arc::new(FreeProxyPool::new(
            &config.free,
            parts.source,
            parts.validator,
            clock.clone(),
        ));
        let selector = Arc::new(ProxySelector::new(
            &config,
            farm.clone(),
            pool.clone(),
            cooldowns.clone(),
            sticky.clone(),
            parts.prechecker,
            parts.geo,
        ));
        let workers = Arc::new(WorkerPool::new(selector.clone(), config.workers.clone()));
        let maintenance = Arc::new(MaintenanceService::new(
            &config,
            pool.clone(),
            farm.clone(),
            sticky.clone(),
            cooldowns.clone(),
        ));

        Self {
            config,
            clock,
            sticky,
            cooldowns,
            farm,
            pool,
            selector,
            workers,
            maintenance,
            maintenance_handle: Mutex::new(None),
        }
    }

    /// Warm the farm, fill the free pool once, and start background
    /// maintenance. Calling it again only runs another maintenance cycle.
    ///
    /// Fails with [`EgressError::NoProxyAvailable`] when both the paid and
    /// free tiers are configured but neither produced anything usable.
    pub async fn init(&self) -> Result<()> {
        let report = self.maintenance.refresh_cycle().await;

        let free_configured =
            !self.config.free.sources.is_empty() || !self.config.free.seeds.is_empty();
        if self.config.paid.has_paid()
            && free_configured
            && report.forwarders == 0
            && report.healthy == 0
        {
            error!("No forwarder could be spawned and no free proxy passed validation");
            return Err(EgressError::NoProxyAvailable);
        }

        info!(
            forwarders = report.forwarders,
            healthy_free = report.healthy,
            "Egress pool initialized"
        );

        let mut handle = self.maintenance_handle.lock();
        if handle.is_none() {
            *handle = Some(self.maintenance.clone().start());
        }
        Ok(())
    }

    /// Stop maintenance and tear down every forwarder
    pub async fn shutdown(&self) {
        let handle = self.maintenance_handle.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
        self.farm.shutdown();
        info!("Egress pool shut down");
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        PoolSnapshot {
            generated_at: Utc::now(),
            free: self.pool.stats(),
            forwarders: self.farm.stats(),
            sticky_assignments: self.sticky.len(),
            cooling_services: self.cooldowns.cooling_services(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    pub fn selector(&self) -> &Arc<ProxySelector> {
        &self.selector
    }

    pub fn worker_pool(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    pub fn farm(&self) -> &Arc<ForwarderFarm> {
        &self.farm
    }

    pub fn free_pool(&self) -> &Arc<FreeProxyPool> {
        &self.pool
    }

    pub fn is_maintaining(&self) -> bool {
        self.maintenance_handle
            .lock()
            .as_ref()
            .map(MaintenanceHandle::is_running)
            .unwrap_or(false)
    }
}

impl Drop for ProxyManager {
    fn drop(&mut self) {
        if let Some(handle) = self.maintenance_handle.get_mut().take() {
            handle.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::proxy::descriptor::ProxyKind;
    use crate::proxy::selector::tests::{test_config, PassAll, StubGeo, StubPrechecker};
    use crate::proxy::selector::SelectOptions;
    use crate::proxy::source::StaticCandidateSource;
    use crate::runner::worker_pool::{RunOptions, WorkerContext};

    fn manager(paid: usize, free: &[&str], precheck_passes: bool) -> ProxyManager {
        let mut config = test_config(paid);
        config.paid.forwarder_count = 2;
        config.free.min_healthy = free.len().max(1);
        let parts = ManagerParts {
            source: Arc::new(StaticCandidateSource::new(free.iter().copied())),
            validator: Arc::new(PassAll),
            prechecker: Arc::new(StubPrechecker::new(precheck_passes)),
            geo: Arc::new(StubGeo::default()),
            clock: Arc::new(ManualClock::new()),
        };
        ProxyManager::with_parts(config, parts)
    }

    #[tokio::test]
    async fn test_init_snapshot_and_shutdown() {
        let manager = manager(3, &["1.1.1.1:8080", "2.2.2.2:8080"], true);
        manager.init().await.unwrap();
        assert!(manager.is_maintaining());

        let lease = manager
            .selector()
            .select("chase", &SelectOptions { prefer_paid: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(lease.kind(), ProxyKind::Paid);

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.forwarders.len(), 2);
        assert_eq!(snapshot.total_active_leases(), 1);
        assert_eq!(snapshot.free.healthy, 2);
        assert!(snapshot.cooling_services.is_empty());

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["free"]["candidates"], 2);
        assert!(!json["forwarders"][0]["upstream"]
            .as_str()
            .unwrap()
            .contains("pass"));

        drop(lease);
        manager.shutdown().await;
        assert!(!manager.is_maintaining());
        assert!(manager.farm().is_empty());
    }

    struct FailAll;

    #[async_trait::async_trait]
    impl ProxyValidator for FailAll {
        async fn validate(&self, _address: &str, _timeout: std::time::Duration) -> bool {
            false
        }
    }

    #[tokio::test]
    async fn test_init_fails_when_no_tier_comes_up() {
        let mut config = test_config(1);
        // Not a local address, so no forwarder can bind.
        config.paid.bind_host = "192.0.2.1".to_string();
        config.free.seeds = vec!["1.1.1.1:8080".to_string()];
        let parts = ManagerParts {
            source: Arc::new(StaticCandidateSource::new(["1.1.1.1:8080"])),
            validator: Arc::new(FailAll),
            prechecker: Arc::new(StubPrechecker::new(true)),
            geo: Arc::new(StubGeo::default()),
            clock: Arc::new(ManualClock::new()),
        };
        let manager = ProxyManager::with_parts(config, parts);

        let err = manager.init().await.unwrap_err();
        assert!(matches!(err, EgressError::NoProxyAvailable));
        assert!(!manager.is_maintaining());
        assert!(manager.free_pool().is_dead("1.1.1.1:8080"));
    }

    #[tokio::test]
    async fn test_managers_do_not_share_state() {
        let a = manager(1, &["1.1.1.1:8080"], false);
        let b = manager(1, &["1.1.1.1:8080"], false);
        a.init().await.unwrap();
        b.init().await.unwrap();

        a.selector()
            .select("chase", &SelectOptions { prefer_paid: true, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(a.snapshot().cooling_services, vec!["chase"]);
        assert!(b.snapshot().cooling_services.is_empty());

        a.free_pool().mark_dead("1.1.1.1:8080");
        assert!(!b.free_pool().is_dead("1.1.1.1:8080"));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_worker_pool_through_manager() {
        let manager = manager(0, &["1.1.1.1:8080", "2.2.2.2:8080"], true);
        manager.init().await.unwrap();

        let outcomes = manager
            .worker_pool()
            .run_across_workers(
                vec!["a", "b", "c", "d"],
                |ctx: WorkerContext<&str>| async move {
                    Ok::<_, String>(ctx.proxy.free_address().map(str::to_string))
                },
                RunOptions {
                    min: Some(2),
                    max: Some(2),
                    ..RunOptions::new("zillow")
                },
            )
            .await;

        // Items on the same worker slot share its sticky proxy.
        let proxy_of = |i: usize| outcomes[i].result.as_ref().unwrap().clone();
        assert!(proxy_of(0).is_some());
        assert_eq!(proxy_of(0), proxy_of(2));
        assert_eq!(proxy_of(1), proxy_of(3));
        assert_eq!(manager.snapshot().sticky_assignments, 2);

        manager.shutdown().await;
    }
}
