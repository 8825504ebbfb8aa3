//! Request-interception proxy.
//!
//! Runs in its own independently scheduled context and shares nothing with
//! the application beyond the local store. Every outbound GET is classified
//! by shape into one of three answer strategies; mutating and unknown
//! cross-origin requests pass through untouched.

pub mod cache;
pub mod control;
pub mod fetch;
pub mod strategy;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::persistence::LocalStore;

use cache::ResponseCache;
use fetch::Fetcher;
use strategy::{offline_notice, ProxyResult, Strategy};

/// Result of one intercepted request, plus the background refresh task when
/// the stale-while-revalidate path started one. Callers that care about the
/// refresh completing (tests, shutdown) can await the handle; everyone else
/// drops it and the task finishes on its own.
pub struct Handled {
    pub result: ProxyResult,
    pub revalidation: Option<JoinHandle<()>>,
}

impl Handled {
    fn done(result: ProxyResult) -> Handled {
        Handled {
            result,
            revalidation: None,
        }
    }
}

pub struct RequestProxy {
    config: SyncConfig,
    origin: Option<reqwest::Url>,
    cache: Arc<ResponseCache>,
    fetcher: Arc<dyn Fetcher>,
}

impl RequestProxy {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn LocalStore>,
        fetcher: Arc<dyn Fetcher>,
    ) -> RequestProxy {
        let cache = Arc::new(ResponseCache::new(store, &config));
        let origin = reqwest::Url::parse(&config.origin).ok();
        if origin.is_none() {
            warn!(origin = %config.origin, "own origin does not parse, all requests bypass");
        }
        RequestProxy {
            config,
            origin,
            cache,
            fetcher,
        }
    }

    pub fn cache(&self) -> &ResponseCache {
        &self.cache
    }

    /// Retire cache partitions left behind by previous deployments. Call once
    /// when this proxy version takes over.
    pub fn activate(&self) -> Result<()> {
        let retired = self.cache.activate()?;
        info!(retired = retired.len(), "proxy activated");
        Ok(())
    }

    /// Pick the strategy for one request, from its shape alone.
    pub fn classify(&self, method: &str, url: &str) -> Strategy {
        if !method.eq_ignore_ascii_case("GET") {
            return Strategy::Bypass;
        }
        let Ok(parsed) = reqwest::Url::parse(url) else {
            return Strategy::Bypass;
        };
        // Origin identity is scheme + host + port; a string-prefix test
        // would let `localhost:8080.evil.com` impersonate `localhost:8080`.
        let same_origin = self.origin.as_ref().is_some_and(|origin| {
            parsed.scheme() == origin.scheme()
                && parsed.host_str() == origin.host_str()
                && parsed.port_or_known_default() == origin.port_or_known_default()
        });
        if !same_origin {
            let allowed = parsed
                .host_str()
                .map(|host| self.config.allowed_hosts.iter().any(|h| h == host))
                .unwrap_or(false);
            return if allowed {
                Strategy::StaleWhileRevalidate
            } else {
                Strategy::Bypass
            };
        }
        let path = parsed.path();
        if self.config.static_resources.iter().any(|r| r == path) {
            Strategy::CacheFirst
        } else if path == "/api" || path.starts_with("/api/") {
            Strategy::NetworkFirst
        } else {
            Strategy::StaleWhileRevalidate
        }
    }

    /// Answer one outbound request. Store failures are real errors; network
    /// failures never escape, they degrade into cache hits or the synthetic
    /// offline notice.
    pub async fn handle(&self, method: &str, url: &str) -> Result<Handled> {
        match self.classify(method, url) {
            Strategy::Bypass => {
                debug!(%url, "bypass");
                Ok(Handled::done(ProxyResult::Bypass))
            }
            Strategy::CacheFirst => self.cache_first(url).await,
            Strategy::NetworkFirst => self.network_first(url).await,
            Strategy::StaleWhileRevalidate => self.stale_while_revalidate(url).await,
        }
    }

    async fn cache_first(&self, url: &str) -> Result<Handled> {
        let partition = self.cache.static_partition();
        if let Some(hit) = self.cache.get(partition, url)? {
            return Ok(Handled::done(ProxyResult::Served(hit)));
        }
        match self.fetcher.fetch(url).await {
            Ok(response) => {
                if response.is_success() {
                    self.cache.put(partition, url, &response)?;
                }
                Ok(Handled::done(ProxyResult::Served(response)))
            }
            Err(e) => {
                warn!(%url, "static fetch failed with empty cache: {e}");
                Ok(Handled::done(ProxyResult::Unavailable(offline_notice())))
            }
        }
    }

    async fn network_first(&self, url: &str) -> Result<Handled> {
        let partition = self.cache.api_partition();
        match self.fetcher.fetch(url).await {
            Ok(response) if response.is_success() => {
                self.cache.put(partition, url, &response)?;
                Ok(Handled::done(ProxyResult::Served(response)))
            }
            Ok(response) => {
                debug!(%url, status = response.status, "api fetch non-success, trying cache");
                self.api_fallback(partition, url)
            }
            Err(e) => {
                debug!(%url, "api fetch failed, trying cache: {e}");
                self.api_fallback(partition, url)
            }
        }
    }

    fn api_fallback(&self, partition: &str, url: &str) -> Result<Handled> {
        match self.cache.get(partition, url)? {
            Some(hit) => Ok(Handled::done(ProxyResult::Served(hit))),
            None => Ok(Handled::done(ProxyResult::Unavailable(offline_notice()))),
        }
    }

    async fn stale_while_revalidate(&self, url: &str) -> Result<Handled> {
        let partition = self.cache.dynamic_partition();
        if let Some(hit) = self.cache.get(partition, url)? {
            let revalidation = self.spawn_revalidate(url.to_string());
            return Ok(Handled {
                result: ProxyResult::Served(hit),
                revalidation: Some(revalidation),
            });
        }
        // Cold cache: the caller waits on the fetch like network-first.
        match self.fetcher.fetch(url).await {
            Ok(response) if response.is_success() => {
                self.cache.put(partition, url, &response)?;
                Ok(Handled::done(ProxyResult::Served(response)))
            }
            Ok(response) => Ok(Handled::done(ProxyResult::Served(response))),
            Err(e) => {
                debug!(%url, "cold fetch failed: {e}");
                Ok(Handled::done(ProxyResult::Unavailable(offline_notice())))
            }
        }
    }

    fn spawn_revalidate(&self, url: String) -> JoinHandle<()> {
        let cache = Arc::clone(&self.cache);
        let fetcher = Arc::clone(&self.fetcher);
        tokio::spawn(async move {
            match fetcher.fetch(&url).await {
                Ok(response) if response.is_success() => {
                    let partition = cache.dynamic_partition();
                    if let Err(e) = cache.put(partition, &url, &response) {
                        warn!(%url, "revalidation store failed: {e}");
                    }
                }
                Ok(response) => {
                    debug!(%url, status = response.status, "revalidation kept stale entry")
                }
                Err(e) => debug!(%url, "revalidation fetch failed: {e}"),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{memory_store, MockFetcher};

    fn proxy() -> (RequestProxy, Arc<MockFetcher>) {
        let fetcher = Arc::new(MockFetcher::new());
        let proxy = RequestProxy::new(
            SyncConfig::default(),
            memory_store(),
            Arc::clone(&fetcher) as Arc<dyn Fetcher>,
        );
        (proxy, fetcher)
    }

    fn body_of(handled: &Handled) -> &[u8] {
        &handled.result.response().unwrap().body
    }

    #[test]
    fn classification_follows_request_shape() {
        let (proxy, _fetcher) = proxy();
        let base = "http://localhost:8080";
        assert_eq!(
            proxy.classify("POST", &format!("{base}/api/invoices")),
            Strategy::Bypass
        );
        assert_eq!(proxy.classify("GET", &format!("{base}/")), Strategy::CacheFirst);
        assert_eq!(
            proxy.classify("GET", &format!("{base}/app.css")),
            Strategy::CacheFirst
        );
        assert_eq!(
            proxy.classify("GET", &format!("{base}/api/bills")),
            Strategy::NetworkFirst
        );
        assert_eq!(
            proxy.classify("GET", &format!("{base}/reports/q3")),
            Strategy::StaleWhileRevalidate
        );
        assert_eq!(
            proxy.classify("GET", "https://fonts.googleapis.com/css?family=Inter"),
            Strategy::StaleWhileRevalidate
        );
        assert_eq!(
            proxy.classify("GET", "https://evil.example.com/x"),
            Strategy::Bypass
        );
    }

    #[test]
    fn hosts_that_merely_extend_the_origin_are_cross_origin() {
        let (proxy, _fetcher) = proxy();
        // Prefix collisions with "http://localhost:8080" must not count as
        // same-origin.
        assert_eq!(
            proxy.classify("GET", "http://localhost:8080.evil.com/api/invoices"),
            Strategy::Bypass
        );
        assert_eq!(
            proxy.classify("GET", "http://localhost:8081/api/invoices"),
            Strategy::Bypass
        );
        // Same host and scheme on the default port is still a different
        // origin than :8080.
        assert_eq!(
            proxy.classify("GET", "http://localhost/api/invoices"),
            Strategy::Bypass
        );
    }

    #[tokio::test]
    async fn cache_first_serves_cached_copy_when_network_dies() {
        let (proxy, fetcher) = proxy();
        let url = "http://localhost:8080/app.css";
        fetcher.insert(url, 200, b"body { margin: 0 }");

        let first = proxy.handle("GET", url).await.unwrap();
        assert_eq!(body_of(&first), b"body { margin: 0 }");

        fetcher.set_network_down(true);
        let second = proxy.handle("GET", url).await.unwrap();
        assert_eq!(body_of(&second), b"body { margin: 0 }");
        // The second request never touched the network.
        assert_eq!(fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn network_first_prefers_network_and_falls_back_to_cache() {
        let (proxy, fetcher) = proxy();
        let url = "http://localhost:8080/api/invoices";
        fetcher.insert(url, 200, b"[{\"id\":\"inv_1\"}]");

        let first = proxy.handle("GET", url).await.unwrap();
        assert_eq!(first.result.response().unwrap().status, 200);

        fetcher.set_network_down(true);
        let second = proxy.handle("GET", url).await.unwrap();
        assert!(!second.result.is_unavailable());
        assert_eq!(body_of(&second), b"[{\"id\":\"inv_1\"}]");
        // The network was tried both times.
        assert_eq!(fetcher.call_count(), 2);
    }

    #[tokio::test]
    async fn network_first_with_nothing_cached_returns_offline_notice() {
        let (proxy, fetcher) = proxy();
        fetcher.set_network_down(true);

        let handled = proxy
            .handle("GET", "http://localhost:8080/api/bills")
            .await
            .unwrap();
        assert!(handled.result.is_unavailable());
        let response = handled.result.response().unwrap();
        assert_eq!(response.status, 503);
        let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
        assert_eq!(body["error"], "offline");
    }

    #[tokio::test]
    async fn stale_while_revalidate_serves_stale_and_refreshes_once() {
        let (proxy, fetcher) = proxy();
        let url = "http://localhost:8080/reports/q3";
        fetcher.insert(url, 200, b"old report");

        // Cold cache: caller waits on the fetch.
        let first = proxy.handle("GET", url).await.unwrap();
        assert_eq!(body_of(&first), b"old report");
        assert!(first.revalidation.is_none());

        fetcher.insert(url, 200, b"new report");
        let second = proxy.handle("GET", url).await.unwrap();
        // Stale copy served immediately.
        assert_eq!(body_of(&second), b"old report");
        second.revalidation.unwrap().await.unwrap();
        // Exactly one background refresh ran.
        assert_eq!(fetcher.call_count(), 2);

        let third = proxy.handle("GET", url).await.unwrap();
        assert_eq!(body_of(&third), b"new report");
    }

    #[tokio::test]
    async fn non_success_api_response_does_not_clobber_cache() {
        let (proxy, fetcher) = proxy();
        let url = "http://localhost:8080/api/customers";
        fetcher.insert(url, 200, b"good data");
        proxy.handle("GET", url).await.unwrap();

        fetcher.insert(url, 500, b"boom");
        let handled = proxy.handle("GET", url).await.unwrap();
        assert_eq!(body_of(&handled), b"good data");
    }

    #[tokio::test]
    async fn mutating_requests_are_never_intercepted() {
        let (proxy, fetcher) = proxy();
        let handled = proxy
            .handle("POST", "http://localhost:8080/api/invoices")
            .await
            .unwrap();
        assert!(matches!(handled.result, ProxyResult::Bypass));
        assert_eq!(fetcher.call_count(), 0);
    }
}
