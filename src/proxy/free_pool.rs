//! Free-proxy pool
//!
//! Caches every candidate seen so far together with its health state. Dead
//! candidates stay dead for the rest of the process, even when a later list
//! refresh rediscovers them. Healthy candidates expire after the healthy TTL
//! and must be validated again before they are served.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::clock::SharedClock;
use crate::config::FreeConfig;
use crate::models::{CandidateOrigin, CandidateState, FreePoolStats, ProxyCandidate};
use crate::proxy::source::CandidateSource;
use crate::proxy::validator::ProxyValidator;

#[derive(Debug, Default)]
struct PoolState {
    candidates: HashMap<String, ProxyCandidate>,
    last_refresh: Option<Instant>,
}

/// Health-tracked cache of free HTTP proxies
pub struct FreeProxyPool {
    state: RwLock<PoolState>,
    source: Arc<dyn CandidateSource>,
    validator: Arc<dyn ProxyValidator>,
    clock: SharedClock,
    refresh_interval: Duration,
    healthy_ttl: Duration,
    refresh_lock: Mutex<()>,
    probe_lock: Mutex<()>,
}

impl FreeProxyPool {
    pub fn new(
        config: &FreeConfig,
        source: Arc<dyn CandidateSource>,
        validator: Arc<dyn ProxyValidator>,
        clock: SharedClock,
    ) -> Self {
        Self {
            state: RwLock::new(PoolState::default()),
            source,
            validator,
            clock,
            refresh_interval: config.refresh_interval,
            healthy_ttl: config.healthy_ttl,
            refresh_lock: Mutex::new(()),
            probe_lock: Mutex::new(()),
        }
    }

    /// Merge candidates without touching ones already known
    pub fn insert_candidates<I>(&self, entries: I) -> usize
    where
        I: IntoIterator<Item = (String, CandidateOrigin)>,
    {
        let mut state = self.state.write();
        let before = state.candidates.len();
        for (address, origin) in entries {
            state
                .candidates
                .entry(address.clone())
                .or_insert_with(|| ProxyCandidate::new(address, origin));
        }
        state.candidates.len() - before
    }

    /// Fetch new candidates when the cache is older than the refresh
    /// interval, or unconditionally when `force` is set. Returns how many
    /// previously unseen candidates were added.
    #[instrument(skip(self))]
    pub async fn refresh_if_stale(&self, force: bool) -> usize {
        let _guard = self.refresh_lock.lock().await;

        if !force && !self.is_stale() {
            return 0;
        }

        let fetched = self.source.fetch_all().await;
        let fetched_count = fetched.len();
        let added = self.insert_candidates(fetched);
        self.state.write().last_refresh = Some(self.clock.now());

        info!(
            fetched = fetched_count,
            added,
            total = self.len(),
            "Free proxy candidates refreshed"
        );
        added
    }

    fn is_stale(&self) -> bool {
        let now = self.clock.now();
        match self.state.read().last_refresh {
            Some(at) => now.saturating_duration_since(at) >= self.refresh_interval,
            None => true,
        }
    }

    /// Validate candidates until at least `min` are healthy.
    ///
    /// Probes at most `sample_size` candidates per round with `concurrency`
    /// probes in flight, stopping as soon as the floor is met. When a round
    /// falls short and most known candidates are dead, the candidate list is
    /// force-refreshed and one more round runs. Returns the healthy count.
    #[instrument(skip(self))]
    pub async fn ensure_healthy_floor(
        &self,
        min: usize,
        sample_size: usize,
        concurrency: usize,
        timeout: Duration,
    ) -> usize {
        let _guard = self.probe_lock.lock().await;

        let mut healthy = self.healthy_count();
        if healthy >= min {
            return healthy;
        }

        healthy = self.probe_round(healthy, min, sample_size, concurrency, timeout).await;

        if healthy < min && self.needs_fresh_candidates() {
            info!("Most free proxy candidates are dead, forcing a list refresh");
            self.refresh_if_stale(true).await;
            healthy = self.probe_round(healthy, min, sample_size, concurrency, timeout).await;
        }

        if healthy < min {
            warn!(healthy, min, "Free proxy pool is below its healthy floor");
        }
        healthy
    }

    async fn probe_round(
        &self,
        mut healthy: usize,
        min: usize,
        sample_size: usize,
        concurrency: usize,
        timeout: Duration,
    ) -> usize {
        let sample = self.probe_sample(sample_size);
        if sample.is_empty() {
            return healthy;
        }
        debug!(sample = sample.len(), concurrency, "Probing free proxy candidates");

        // Once the floor is met no new probe starts, but probes already in
        // flight are drained so their verdicts are recorded.
        let floor_met = AtomicBool::new(false);
        let mut probes = stream::iter(sample)
            .take_while(|_| future::ready(!floor_met.load(Ordering::Acquire)))
            .map(|address| {
                let validator = self.validator.clone();
                async move {
                    let passed = validator.validate(&address, timeout).await;
                    (address, passed)
                }
            })
            .buffer_unordered(concurrency.max(1));

        while let Some((address, passed)) = probes.next().await {
            if passed {
                if self.mark_healthy(&address) {
                    healthy += 1;
                }
            } else {
                self.mark_dead(&address);
            }
            if healthy >= min {
                floor_met.store(true, Ordering::Release);
            }
        }
        healthy
    }

    /// Previously healthy candidates whose TTL lapsed go first, then a random
    /// draw of never-checked ones.
    fn probe_sample(&self, sample_size: usize) -> Vec<String> {
        let now = self.clock.now();
        let state = self.state.read();

        let mut stale = Vec::new();
        let mut unknown = Vec::new();
        for candidate in state.candidates.values() {
            if candidate.is_dead() || candidate.is_fresh_healthy(now, self.healthy_ttl) {
                continue;
            }
            if candidate.state == CandidateState::Healthy {
                stale.push(candidate.address.clone());
            } else {
                unknown.push(candidate.address.clone());
            }
        }
        drop(state);

        let mut rng = rand::thread_rng();
        stale.shuffle(&mut rng);
        unknown.shuffle(&mut rng);
        stale.extend(unknown);
        stale.truncate(sample_size);
        stale
    }

    fn needs_fresh_candidates(&self) -> bool {
        let state = self.state.read();
        let total = state.candidates.len();
        let dead = state.candidates.values().filter(|c| c.is_dead()).count();
        total == 0 || dead * 2 > total
    }

    /// A random currently-healthy address
    pub fn pick_random_healthy(&self) -> Option<String> {
        let healthy = self.healthy_addresses();
        healthy.choose(&mut rand::thread_rng()).cloned()
    }

    pub fn healthy_addresses(&self) -> Vec<String> {
        let now = self.clock.now();
        self.state
            .read()
            .candidates
            .values()
            .filter(|c| c.is_fresh_healthy(now, self.healthy_ttl))
            .map(|c| c.address.clone())
            .collect()
    }

    pub fn healthy_count(&self) -> usize {
        let now = self.clock.now();
        self.state
            .read()
            .candidates
            .values()
            .filter(|c| c.is_fresh_healthy(now, self.healthy_ttl))
            .count()
    }

    /// Whether `address` may be served right now
    pub fn is_healthy(&self, address: &str) -> bool {
        let now = self.clock.now();
        self.state
            .read()
            .candidates
            .get(address)
            .map(|c| c.is_fresh_healthy(now, self.healthy_ttl))
            .unwrap_or(false)
    }

    pub fn is_dead(&self, address: &str) -> bool {
        self.state
            .read()
            .candidates
            .get(address)
            .map(|c| c.is_dead())
            .unwrap_or(false)
    }

    /// Record a passed probe. Dead candidates are never promoted back.
    pub fn mark_healthy(&self, address: &str) -> bool {
        let now = self.clock.now();
        let mut state = self.state.write();
        let candidate = state
            .candidates
            .entry(address.to_string())
            .or_insert_with(|| ProxyCandidate::new(address, CandidateOrigin::FetchedList));
        if candidate.is_dead() {
            return false;
        }
        candidate.state = CandidateState::Healthy;
        candidate.last_checked_at = Some(now);
        true
    }

    /// Blacklist `address` for the rest of the process. Returns `false` if it
    /// was already dead.
    pub fn mark_dead(&self, address: &str) -> bool {
        let now = self.clock.now();
        let mut state = self.state.write();
        let candidate = state
            .candidates
            .entry(address.to_string())
            .or_insert_with(|| ProxyCandidate::new(address, CandidateOrigin::FetchedList));
        if candidate.is_dead() {
            return false;
        }
        candidate.state = CandidateState::Dead;
        candidate.last_checked_at = Some(now);
        debug!(address, "Free proxy marked dead");
        true
    }

    pub fn len(&self) -> usize {
        self.state.read().candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().candidates.is_empty()
    }

    pub fn stats(&self) -> FreePoolStats {
        let now = self.clock.now();
        let state = self.state.read();
        let mut stats = FreePoolStats {
            candidates: state.candidates.len(),
            ..Default::default()
        };
        for candidate in state.candidates.values() {
            if candidate.is_dead() {
                stats.dead += 1;
            } else if candidate.is_fresh_healthy(now, self.healthy_ttl) {
                stats.healthy += 1;
            } else {
                stats.unknown += 1;
            }
        }
        stats
    }
}
