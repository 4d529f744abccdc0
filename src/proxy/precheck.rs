//! Paid-path precheck
//!
//! Before committing real work to a paid lease, one lightweight request is
//! sent to a service-specific probe URL through it. A 2xx or 3xx answer
//! within the timeout counts as usable. Anything else is a negative probe,
//! which the selector turns into a cooldown rather than an error.

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::{EgressError, Result};

/// Verifies a proxy path against a probe URL
#[async_trait]
pub trait Prechecker: Send + Sync {
    async fn precheck(&self, proxy_url: &str, probe_url: &str, timeout: Duration) -> bool;
}

/// Probe request over reqwest
#[derive(Debug, Default, Clone)]
pub struct HttpPrechecker;

impl HttpPrechecker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Prechecker for HttpPrechecker {
    #[instrument(skip(self))]
    async fn precheck(&self, proxy_url: &str, probe_url: &str, timeout: Duration) -> bool {
        let client = match proxied_client(proxy_url, timeout) {
            Ok(client) => client,
            Err(e) => {
                debug!("Cannot build precheck client: {}", e);
                return false;
            }
        };

        match client.get(probe_url).send().await {
            Ok(response) => {
                let status = response.status();
                debug!(status = status.as_u16(), "Precheck answered");
                status.is_success() || status.is_redirection()
            }
            Err(e) => {
                debug!("Precheck request failed: {}", e);
                false
            }
        }
    }
}

/// One-off client routed through `proxy_url`. Redirects are not followed so a
/// 3xx from the probe target is observed as is.
pub(crate) fn proxied_client(proxy_url: &str, timeout: Duration) -> Result<reqwest::Client> {
    let proxy = reqwest::Proxy::all(proxy_url)
        .map_err(|e| EgressError::InvalidProxyAddress(format!("{}: {}", proxy_url, e)))?;

    reqwest::Client::builder()
        .proxy(proxy)
        .timeout(timeout)
        .connect_timeout(timeout)
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| EgressError::Internal(format!("cannot build proxied client: {}", e)))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// A proxy that answers every request with `reply` and closes
    pub(crate) async fn canned_proxy(reply: String) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut client, _)) = listener.accept().await {
                let reply = reply.clone();
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 4096];
                    let _ = client.read(&mut buf).await;
                    let _ = client.write_all(reply.as_bytes()).await;
                    let _ = client.shutdown().await;
                });
            }
        });
        format!("http://{}", addr)
    }

    const PROBE: &str = "http://probe.test/generate_204";

    #[tokio::test]
    async fn test_precheck_accepts_2xx_and_3xx() {
        let checker = HttpPrechecker::new();

        let ok = canned_proxy("HTTP/1.1 204 No Content\r\nContent-Length: 0\r\n\r\n".into()).await;
        assert!(checker.precheck(&ok, PROBE, Duration::from_secs(2)).await);

        let redirect = canned_proxy(
            "HTTP/1.1 302 Found\r\nLocation: http://probe.test/\r\nContent-Length: 0\r\n\r\n".into(),
        )
        .await;
        assert!(checker.precheck(&redirect, PROBE, Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_precheck_rejects_errors() {
        let checker = HttpPrechecker::new();

        let denied =
            canned_proxy("HTTP/1.1 407 Proxy Authentication Required\r\nContent-Length: 0\r\n\r\n".into())
                .await;
        assert!(!checker.precheck(&denied, PROBE, Duration::from_secs(2)).await);

        let blocked = canned_proxy("HTTP/1.1 403 Forbidden\r\nContent-Length: 0\r\n\r\n".into()).await;
        assert!(!checker.precheck(&blocked, PROBE, Duration::from_secs(2)).await);

        assert!(
            !checker
                .precheck("http://127.0.0.1:9", PROBE, Duration::from_secs(2))
                .await
        );
    }
}
