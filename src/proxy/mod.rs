//! Egress proxy pool
//!
//! This module provides:
//! - Free-proxy discovery, validation and health tracking
//! - Local forwarders for credentialed paid upstreams
//! - Sticky assignments and per-service cooldowns
//! - The selection policy that ties the tiers together

pub mod cooldown;
pub mod descriptor;
pub mod farm;
pub mod forwarder;
pub mod free_pool;
pub mod geo;
pub mod precheck;
pub mod selector;
pub mod source;
pub mod sticky;
pub mod transport;
pub mod tunnel;
pub mod validator;

pub use cooldown::ServiceCooldownTracker;
pub use descriptor::{Credentials, ProxyDescriptor, ProxyKind};
pub use farm::{AcquireOptions, ForwarderFarm, Lease};
pub use forwarder::{ForwarderHandle, ForwarderServer, ForwarderSettings};
pub use free_pool::FreeProxyPool;
pub use selector::{ProxySelector, SelectOptions};
pub use source::{CandidateSource, HttpCandidateSource, StaticCandidateSource};
pub use sticky::{StickyAssignmentRegistry, StickyTarget};
pub use transport::ProxyTransport;
pub use validator::{ConnectValidator, ProxyValidator};
