//! Free-proxy candidate discovery
//!
//! Fetches plaintext `host:port` lists from external providers and merges
//! them with a static seed list. A failing provider is logged and skipped so
//! one dead list never blocks a refresh.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument, warn};

use crate::config::FreeConfig;
use crate::error::{EgressError, Result};
use crate::models::CandidateOrigin;

/// Supplies raw free-proxy candidates
#[async_trait]
pub trait CandidateSource: Send + Sync {
    /// Every candidate currently known to the source. Never fails: provider
    /// errors are swallowed.
    async fn fetch_all(&self) -> HashMap<String, CandidateOrigin>;
}

/// Fetches candidate lists over HTTP
pub struct HttpCandidateSource {
    client: reqwest::Client,
    urls: Vec<String>,
    seeds: Vec<String>,
}

impl HttpCandidateSource {
    pub fn new(urls: Vec<String>, seeds: Vec<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("egress/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EgressError::Internal(format!("cannot build list client: {}", e)))?;

        Ok(Self {
            client,
            urls,
            seeds,
        })
    }

    pub fn from_config(config: &FreeConfig) -> Result<Self> {
        Self::new(
            config.sources.clone(),
            config.seeds.clone(),
            Duration::from_secs(20),
        )
    }

    #[instrument(skip(self))]
    async fn fetch_one(&self, url: &str) -> Result<Vec<String>> {
        let response = self.client.get(url).send().await?;
        if !response.status().is_success() {
            return Err(EgressError::Http(format!(
                "list provider returned {}",
                response.status()
            )));
        }
        let body = response.text().await?;
        Ok(parse_candidate_list(&body))
    }
}

#[async_trait]
impl CandidateSource for HttpCandidateSource {
    async fn fetch_all(&self) -> HashMap<String, CandidateOrigin> {
        let fetches = self.urls.iter().map(|url| async move {
            (url.as_str(), self.fetch_one(url).await)
        });

        let mut candidates = HashMap::new();
        for (url, result) in futures::future::join_all(fetches).await {
            match result {
                Ok(list) => {
                    debug!("Fetched {} candidates from {}", list.len(), url);
                    for address in list {
                        candidates.insert(address, CandidateOrigin::FetchedList);
                    }
                }
                Err(e) => {
                    warn!("Proxy list provider {} failed: {}", url, e);
                }
            }
        }

        for seed in &self.seeds {
            candidates.insert(seed.clone(), CandidateOrigin::StaticSeed);
        }
        candidates
    }
}

/// Fixed candidate list
pub struct StaticCandidateSource {
    entries: Vec<String>,
}

impl StaticCandidateSource {
    pub fn new<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            entries: entries.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl CandidateSource for StaticCandidateSource {
    async fn fetch_all(&self) -> HashMap<String, CandidateOrigin> {
        self.entries
            .iter()
            .map(|e| (e.clone(), CandidateOrigin::StaticSeed))
            .collect()
    }
}

/// Extract `host:port` entries from a plaintext list body
pub fn parse_candidate_list(body: &str) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    body.split_whitespace()
        .filter_map(normalize_candidate)
        .filter(|c| seen.insert(c.clone()))
        .collect()
}

fn normalize_candidate(raw: &str) -> Option<String> {
    let entry = raw
        .trim()
        .trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/');

    let (host, port) = entry.rsplit_once(':')?;
    if host.is_empty() || host.contains('/') || host.contains('@') {
        return None;
    }
    let port: u16 = port.parse().ok()?;
    if port == 0 {
        return None;
    }
    Some(format!("{}:{}", host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_candidate_list() {
        let body = "1.1.1.1:8080\r\n2.2.2.2:3128 http://3.3.3.3:80/\n\
                    junk\n4.4.4.4:notaport\n5.5.5.5:0\nuser@6.6.6.6:80\n1.1.1.1:8080\n";
        assert_eq!(
            parse_candidate_list(body),
            vec!["1.1.1.1:8080", "2.2.2.2:3128", "3.3.3.3:80"]
        );
    }

    #[tokio::test]
    async fn test_fetch_all_swallows_failed_providers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/good.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("1.1.1.1:8080\n2.2.2.2:8080\n"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/broken.txt"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let source = HttpCandidateSource::new(
            vec![
                format!("{}/good.txt", server.uri()),
                format!("{}/broken.txt", server.uri()),
                "http://127.0.0.1:9/unreachable.txt".to_string(),
            ],
            vec!["9.9.9.9:80".to_string(), "1.1.1.1:8080".to_string()],
            Duration::from_secs(2),
        )
        .unwrap();

        let candidates = source.fetch_all().await;
        assert_eq!(candidates.len(), 3);
        assert_eq!(
            candidates.get("2.2.2.2:8080"),
            Some(&CandidateOrigin::FetchedList)
        );
        assert_eq!(candidates.get("9.9.9.9:80"), Some(&CandidateOrigin::StaticSeed));
        assert_eq!(
            candidates.get("1.1.1.1:8080"),
            Some(&CandidateOrigin::StaticSeed)
        );
    }
}
