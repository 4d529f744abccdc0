//! Egress selection policy
//!
//! Tiers are evaluated in a fixed order with early return:
//!
//! 1. Paid-only override: paid with a passing precheck, otherwise direct.
//!    Free proxies are never used in this mode.
//! 2. Hard-preference services: paid with a passing precheck.
//! 3. `prefer_paid` callers whose service flag allows it: same as 2.
//! 4. Free pool, with timezone affinity for services that need it.
//! 5. Direct, when allowed.
//!
//! A failed precheck opens the service's cooldown window and falls through.
//! Cooling services skip the paid tiers entirely.

use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{debug, info, instrument, warn};

use crate::config::{Config, FreeConfig, SelectionConfig};
use crate::error::{EgressError, Result};
use crate::proxy::cooldown::ServiceCooldownTracker;
use crate::proxy::descriptor::{ProxyDescriptor, ProxyKind};
use crate::proxy::farm::{AcquireOptions, ForwarderFarm};
use crate::proxy::free_pool::FreeProxyPool;
use crate::proxy::geo::GeoLocator;
use crate::proxy::precheck::Prechecker;
use crate::proxy::sticky::{StickyAssignmentRegistry, StickyTarget};

/// Per-call selection options
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    pub prefer_paid: bool,
    pub sticky: bool,
    pub key: Option<String>,
    /// Precheck timeout override
    pub timeout: Option<Duration>,
    /// Precheck URL override
    pub probe_url: Option<String>,
    /// Host the caller is about to visit
    pub target_host: Option<String>,
    pub sticky_ttl: Option<Duration>,
}

impl SelectOptions {
    fn sticky_key(&self) -> Option<&str> {
        self.key.as_deref().filter(|_| self.sticky)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tier {
    Paid,
    Free,
    Direct,
}

/// Top-level proxy policy shared by every automation path
pub struct ProxySelector {
    selection: SelectionConfig,
    free: FreeConfig,
    sticky_ttl: Duration,
    farm: Arc<ForwarderFarm>,
    pool: Arc<FreeProxyPool>,
    cooldowns: Arc<ServiceCooldownTracker>,
    sticky: Arc<StickyAssignmentRegistry>,
    prechecker: Arc<dyn Prechecker>,
    geo: Arc<dyn GeoLocator>,
}

impl ProxySelector {
    pub fn new(
        config: &Config,
        farm: Arc<ForwarderFarm>,
        pool: Arc<FreeProxyPool>,
        cooldowns: Arc<ServiceCooldownTracker>,
        sticky: Arc<StickyAssignmentRegistry>,
        prechecker: Arc<dyn Prechecker>,
        geo: Arc<dyn GeoLocator>,
    ) -> Self {
        Self {
            selection: config.selection.clone(),
            free: config.free.clone(),
            sticky_ttl: config.workers.sticky_ttl,
            farm,
            pool,
            cooldowns,
            sticky,
            prechecker,
            geo,
        }
    }

    pub fn farm(&self) -> &Arc<ForwarderFarm> {
        &self.farm
    }

    pub fn pool(&self) -> &Arc<FreeProxyPool> {
        &self.pool
    }

    pub fn cooldowns(&self) -> &Arc<ServiceCooldownTracker> {
        &self.cooldowns
    }

    pub fn sticky(&self) -> &Arc<StickyAssignmentRegistry> {
        &self.sticky
    }

    /// Pick an egress path for `service`.
    ///
    /// Fails with [`EgressError::NoProxyAvailable`] only when every tier is
    /// exhausted or disallowed. Precheck and validation failures never
    /// surface here.
    #[instrument(skip(self, options), fields(prefer_paid = options.prefer_paid, sticky = options.sticky))]
    pub async fn select(&self, service: &str, options: &SelectOptions) -> Result<ProxyDescriptor> {
        if let Some(host) = options.target_host.as_deref() {
            if self.selection.is_bypassed(host) {
                debug!(host, "Target host bypasses every proxy");
                return Ok(ProxyDescriptor::none(self.bypass()));
            }
        }

        for tier in self.plan(service, options) {
            let descriptor = match tier {
                Tier::Paid => self.try_paid(service, options).await,
                Tier::Free => self.try_free(service, options).await,
                Tier::Direct => Some(ProxyDescriptor::direct(self.bypass())),
            };
            if let Some(descriptor) = descriptor {
                debug!(kind = %descriptor.kind(), "Proxy selected");
                return Ok(descriptor);
            }
        }

        warn!(service, "Every egress tier exhausted");
        Err(EgressError::NoProxyAvailable)
    }

    /// Ordered tiers to try for this call
    pub(crate) fn plan(&self, service: &str, options: &SelectOptions) -> Vec<Tier> {
        let paid_ready = self.farm.has_upstreams() && !self.cooldowns.is_cooling_down(service);

        if self.selection.force_paid_only {
            let mut tiers = Vec::with_capacity(2);
            if paid_ready {
                tiers.push(Tier::Paid);
            }
            tiers.push(Tier::Direct);
            return tiers;
        }

        let mut tiers = Vec::with_capacity(3);
        let preferred = self.selection.is_preferred(service);
        let requested = options.prefer_paid && self.selection.service_uses_paid(service);
        if paid_ready && (preferred || requested) {
            tiers.push(Tier::Paid);
        }
        tiers.push(Tier::Free);
        if self.selection.allow_direct {
            tiers.push(Tier::Direct);
        }
        tiers
    }

    async fn try_paid(&self, service: &str, options: &SelectOptions) -> Option<ProxyDescriptor> {
        let acquire = AcquireOptions {
            sticky: options.sticky,
            key: options.key.clone(),
            ttl: Some(options.sticky_ttl.unwrap_or(self.sticky_ttl)),
        };
        let lease = match self.farm.acquire(&acquire).await {
            Ok(lease) => lease,
            Err(e) => {
                warn!(service, "Cannot lease a paid forwarder: {}", e);
                return None;
            }
        };

        let probe_url = options
            .probe_url
            .as_deref()
            .unwrap_or_else(|| self.selection.probe_url_for(service));
        let timeout = options.timeout.unwrap_or(self.selection.precheck_timeout);

        if self.prechecker.precheck(lease.local_url(), probe_url, timeout).await {
            return Some(ProxyDescriptor::paid(lease, self.bypass()));
        }

        warn!(
            service,
            forwarder = %lease.forwarder().upstream,
            cooldown_secs = self.selection.cooldown.as_secs(),
            "Paid precheck failed, cooling down service"
        );
        drop(lease);
        if let Some(key) = options.sticky_key() {
            self.sticky.invalidate(key);
        }
        self.cooldowns.cooldown(service, self.selection.cooldown);
        None
    }

    async fn try_free(&self, service: &str, options: &SelectOptions) -> Option<ProxyDescriptor> {
        let key = options.sticky_key();

        if let Some(key) = key {
            if let Some(StickyTarget::Free(address)) = self.sticky.lookup(key) {
                if self.pool.is_healthy(&address) {
                    debug!(key, %address, "Sticky free proxy hit");
                    return Some(ProxyDescriptor::free(address, self.bypass()));
                }
                self.sticky.invalidate(key);
            }
        }

        self.pool.refresh_if_stale(false).await;
        self.pool
            .ensure_healthy_floor(
                self.free.min_healthy,
                self.free.sample_size,
                self.free.validate_concurrency,
                self.free.validate_timeout,
            )
            .await;

        let address = match self.selection.timezone_for(service) {
            Some(prefix) => self.pick_in_timezone(service, prefix, options).await,
            None => self.pool.pick_random_healthy(),
        };
        let Some(address) = address else {
            info!(service, "No healthy free proxy available");
            return None;
        };

        if let Some(key) = key {
            self.sticky.assign(
                key,
                StickyTarget::Free(address.clone()),
                options.sticky_ttl.unwrap_or(self.sticky_ttl),
            );
        }
        Some(ProxyDescriptor::free(address, self.bypass()))
    }

    /// Probe healthy candidates' exit timezone, blacklisting mismatches.
    /// Gives up after the configured attempts and returns an unverified
    /// candidate if one was seen.
    async fn pick_in_timezone(
        &self,
        service: &str,
        prefix: &str,
        options: &SelectOptions,
    ) -> Option<String> {
        let timeout = options.timeout.unwrap_or(self.selection.precheck_timeout);
        let mut fallback = None;

        let mut candidates = self.pool.healthy_addresses();
        candidates.shuffle(&mut rand::thread_rng());
        candidates.truncate(self.selection.timezone_attempts.max(1));

        for address in candidates {
            let proxy_url = format!("http://{}", address);

            match self.geo.timezone_via(&proxy_url, timeout).await {
                Some(timezone) if timezone.starts_with(prefix) => {
                    debug!(service, %address, %timezone, "Free proxy matches timezone");
                    return Some(address);
                }
                Some(timezone) => {
                    warn!(service, %address, %timezone, expected = prefix, "Free proxy outside timezone, discarding");
                    self.pool.mark_dead(&address);
                    self.sticky
                        .invalidate_target(&StickyTarget::Free(address));
                }
                None => {
                    fallback.get_or_insert(address);
                }
            }
        }

        fallback.or_else(|| self.pool.pick_random_healthy())
    }

    /// Report that `descriptor` failed at the network level.
    ///
    /// Forgets the sticky assignment for `key`. Free proxies are also
    /// blacklisted and dropped from every other key that pointed at them.
    pub fn report_dead(&self, descriptor: &ProxyDescriptor, key: Option<&str>) {
        if let Some(key) = key {
            self.sticky.invalidate(key);
        }

        if descriptor.kind() == ProxyKind::Free {
            if let Some(address) = descriptor.free_address() {
                if self.pool.mark_dead(address) {
                    info!(%address, "Free proxy reported dead");
                }
                self.sticky
                    .invalidate_target(&StickyTarget::Free(address.to_string()));
            }
        }
    }

    fn bypass(&self) -> Vec<String> {
        self.selection.bypass_domains.clone()
    }
}
