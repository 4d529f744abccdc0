//! Proxy descriptors handed to automation callers

use serde::Serialize;

use crate::models::Upstream;
use crate::proxy::farm::Lease;
use crate::proxy::sticky::StickyTarget;

/// Which egress tier a descriptor came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Paid,
    Free,
    Direct,
    /// Target host is on the bypass list
    None,
}

impl ProxyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyKind::Paid => "paid",
            ProxyKind::Free => "free",
            ProxyKind::Direct => "direct",
            ProxyKind::None => "none",
        }
    }
}

impl std::fmt::Display for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

/// A usable egress path.
///
/// Paid descriptors hold a forwarder lease that is released when the
/// descriptor is dropped, or earlier through [`release`](Self::release).
#[derive(Debug)]
pub struct ProxyDescriptor {
    kind: ProxyKind,
    server: Option<String>,
    upstream: Option<Upstream>,
    bypass: Vec<String>,
    target: Option<StickyTarget>,
    lease: Option<Lease>,
}

impl ProxyDescriptor {
    pub(crate) fn paid(lease: Lease, bypass: Vec<String>) -> Self {
        Self {
            kind: ProxyKind::Paid,
            server: Some(lease.local_url().to_string()),
            upstream: Some(lease.forwarder().upstream.clone()),
            bypass,
            target: lease.forwarder_id().map(StickyTarget::Forwarder),
            lease: Some(lease),
        }
    }

    pub(crate) fn free(address: String, bypass: Vec<String>) -> Self {
        Self {
            kind: ProxyKind::Free,
            server: Some(format!("http://{}", address)),
            upstream: None,
            bypass,
            target: Some(StickyTarget::Free(address)),
            lease: None,
        }
    }

    pub(crate) fn direct(bypass: Vec<String>) -> Self {
        Self::unproxied(ProxyKind::Direct, bypass)
    }

    pub(crate) fn none(bypass: Vec<String>) -> Self {
        Self::unproxied(ProxyKind::None, bypass)
    }

    fn unproxied(kind: ProxyKind, bypass: Vec<String>) -> Self {
        Self {
            kind,
            server: None,
            upstream: None,
            bypass,
            target: None,
            lease: None,
        }
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    /// Proxy URL to configure an HTTP client with
    pub fn server(&self) -> Option<&str> {
        self.server.as_deref()
    }

    /// Browser launch argument, e.g. `--proxy-server=http://127.0.0.1:41234`
    pub fn proxy_arg(&self) -> Option<String> {
        self.server.as_ref().map(|s| format!("--proxy-server={}", s))
    }

    /// Browser launch argument listing hosts that skip the proxy
    pub fn bypass_arg(&self) -> Option<String> {
        (!self.bypass.is_empty())
            .then(|| format!("--proxy-bypass-list={}", self.bypass.join(";")))
    }

    pub fn bypass_domains(&self) -> &[String] {
        &self.bypass
    }

    /// Credentials of the paid upstream behind the forwarder, for clients
    /// that dial the upstream themselves. The forwarder injects them already.
    pub fn credentials(&self) -> Option<Credentials> {
        self.upstream
            .as_ref()
            .and_then(|u| u.credentials())
            .map(|(username, password)| Credentials {
                username: username.to_string(),
                password: password.to_string(),
            })
    }

    pub fn upstream(&self) -> Option<&Upstream> {
        self.upstream.as_ref()
    }

    /// What a sticky key for this descriptor points at
    pub fn target(&self) -> Option<&StickyTarget> {
        self.target.as_ref()
    }

    /// `host:port` of a free proxy
    pub fn free_address(&self) -> Option<&str> {
        match &self.target {
            Some(StickyTarget::Free(address)) => Some(address),
            _ => None,
        }
    }

    pub fn is_proxied(&self) -> bool {
        self.server.is_some()
    }

    /// Return any held forwarder lease now
    pub fn release(mut self) {
        self.lease.take();
    }

    /// Release and tear down a single-use forwarder, if one backs this
    /// descriptor
    pub fn close(self) {
        self.release();
    }
}
