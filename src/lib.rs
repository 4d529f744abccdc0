//! Egress - proxy pool and concurrency management
//!
//! Multiplexes automation tasks over an unreliable pool of egress paths.
//!
//! ## Features
//!
//! - Health-tracked free HTTP proxies with TTL-bounded re-validation
//! - Local anonymizing forwarders for paid HTTP and SOCKS5 upstreams
//! - Sticky per-worker proxy assignment and per-service circuit breaking
//! - Bounded-concurrency worker pool with one retry on transient failures

pub mod clock;
pub mod config;
pub mod error;
pub mod manager;
pub mod models;
pub mod proxy;
pub mod runner;
pub mod services;

pub use config::Config;
pub use error::{EgressError, Result};
pub use manager::{ManagerParts, ProxyManager};
pub use proxy::{ProxyDescriptor, ProxyKind, ProxySelector, SelectOptions};
pub use runner::{AbortFlag, ItemOutcome, RunOptions, WorkerContext, WorkerPool};
