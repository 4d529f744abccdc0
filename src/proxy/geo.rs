//! Geo-IP timezone lookup through a proxy

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::proxy::precheck::proxied_client;

/// Resolves the timezone a proxy's exit IP appears in
#[async_trait]
pub trait GeoLocator: Send + Sync {
    async fn timezone_via(&self, proxy_url: &str, timeout: Duration) -> Option<String>;
}

#[derive(Debug, Deserialize)]
struct GeoResponse {
    #[serde(default)]
    timezone: Option<String>,
}

/// Queries a public JSON geo-IP endpoint that reports a `timezone` field
#[derive(Debug, Clone)]
pub struct HttpGeoLocator {
    endpoint: String,
}

impl HttpGeoLocator {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl GeoLocator for HttpGeoLocator {
    #[instrument(skip(self))]
    async fn timezone_via(&self, proxy_url: &str, timeout: Duration) -> Option<String> {
        let client = proxied_client(proxy_url, timeout).ok()?;
        let response = match client.get(&self.endpoint).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(status = response.status().as_u16(), "Geo-IP lookup rejected");
                return None;
            }
            Err(e) => {
                debug!("Geo-IP lookup failed: {}", e);
                return None;
            }
        };

        match response.json::<GeoResponse>().await {
            Ok(geo) => geo.timezone.filter(|tz| !tz.is_empty()),
            Err(e) => {
                debug!("Geo-IP response unreadable: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::precheck::tests::canned_proxy;

    fn json_reply(body: &str) -> String {
        format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
    }

    #[tokio::test]
    async fn test_timezone_via_parses_field() {
        let proxy = canned_proxy(json_reply(
            r#"{"status":"success","countryCode":"US","timezone":"America/Chicago"}"#,
        ))
        .await;
        let geo = HttpGeoLocator::new("http://geo.test/json");
        assert_eq!(
            geo.timezone_via(&proxy, Duration::from_secs(2)).await.as_deref(),
            Some("America/Chicago")
        );
    }

    #[tokio::test]
    async fn test_timezone_via_unknown() {
        let geo = HttpGeoLocator::new("http://geo.test/json");

        let missing = canned_proxy(json_reply(r#"{"status":"fail"}"#)).await;
        assert!(geo.timezone_via(&missing, Duration::from_secs(2)).await.is_none());

        let garbage = canned_proxy(json_reply("not json")).await;
        assert!(geo.timezone_via(&garbage, Duration::from_secs(2)).await.is_none());

        assert!(geo
            .timezone_via("http://127.0.0.1:9", Duration::from_secs(2))
            .await
            .is_none());
    }
}
