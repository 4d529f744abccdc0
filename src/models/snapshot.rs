use chrono::{DateTime, Utc};
use serde::Serialize;

/// Counts over the free-proxy candidate set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FreePoolStats {
    pub candidates: usize,
    pub healthy: usize,
    pub dead: usize,
    pub unknown: usize,
}

/// One forwarder in the farm
#[derive(Debug, Clone, Serialize)]
pub struct ForwarderStats {
    pub id: u64,
    pub upstream: String,
    pub local_url: String,
    pub active_leases: usize,
}

/// Point-in-time view of the whole egress pool
#[derive(Debug, Clone, Serialize)]
pub struct PoolSnapshot {
    pub generated_at: DateTime<Utc>,
    pub free: FreePoolStats,
    pub forwarders: Vec<ForwarderStats>,
    pub sticky_assignments: usize,
    pub cooling_services: Vec<String>,
}

impl PoolSnapshot {
    pub fn total_active_leases(&self) -> usize {
        self.forwarders.iter().map(|f| f.active_leases).sum()
    }
}
