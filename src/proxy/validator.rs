//! Free-proxy validation probe
//!
//! A candidate passes when it accepts a TCP connection, answers an HTTP
//! `CONNECT` to a well-known `host:443` with a 2xx status line, and does so
//! within the timeout. The probe holds no state, so callers bound fan-out
//! themselves.

use std::time::Duration;

use async_trait::async_trait;
use tokio::time::timeout;
use tracing::{debug, instrument};

use crate::error::{EgressError, Result};
use crate::proxy::transport::ProxyTransport;

/// Decides whether a free-proxy candidate is usable
#[async_trait]
pub trait ProxyValidator: Send + Sync {
    async fn validate(&self, address: &str, timeout: Duration) -> bool;
}

/// Tunnel-establishment check against a fixed target
#[derive(Debug, Clone)]
pub struct ConnectValidator {
    target_host: String,
    target_port: u16,
}

impl ConnectValidator {
    pub fn new(target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
        }
    }

    /// Parse a `host:port` validation target
    pub fn from_target(target: &str) -> Result<Self> {
        let (host, port) = ProxyTransport::parse_authority(target)?;
        if host.is_empty() {
            return Err(EgressError::InvalidConfig(format!(
                "invalid validation target: {}",
                target
            )));
        }
        Ok(Self::new(host, port))
    }
}

#[async_trait]
impl ProxyValidator for ConnectValidator {
    #[instrument(skip(self))]
    async fn validate(&self, address: &str, probe_timeout: Duration) -> bool {
        let probe = ProxyTransport::open_tunnel(address, None, &self.target_host, self.target_port);

        match timeout(probe_timeout, probe).await {
            Ok(Ok(_stream)) => {
                debug!("Candidate {} passed CONNECT probe", address);
                true
            }
            Ok(Err(e)) => {
                debug!("Candidate {} failed CONNECT probe: {}", address, e);
                false
            }
            Err(_) => {
                debug!("Candidate {} timed out", address);
                false
            }
        }
    }
}
