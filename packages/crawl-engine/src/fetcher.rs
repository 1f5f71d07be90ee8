//! HTTP content fetching with bounded retries and per-attempt proxy
//! selection.
//!
//! The contract is deliberately soft: `get` returns `None` only after
//! exhausting retries and never surfaces an error. Retried conditions are
//! transport failures, non-200 statuses, and body decode failures.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};
use tracing::{debug, warn};

use crate::config::SiteConfig;

const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36";

#[derive(Debug, thiserror::Error)]
enum FetchError {
    #[error("HTTP {0}")]
    Status(reqwest::StatusCode),
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// Contract of the external proxy pool: hand out a fresh proxy per request
/// attempt, or `None` to fall back to a direct connection.
#[async_trait]
pub trait ProxyProvider: Send + Sync {
    async fn acquire(&self) -> Option<reqwest::Proxy>;
}

pub struct Fetcher {
    headers: HeaderMap,
    timeout: Duration,
    encoding: Option<String>,
    max_retries: u32,
    proxy: Option<Arc<dyn ProxyProvider>>,
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(
        config: &SiteConfig,
        proxy: Option<Arc<dyn ProxyProvider>>,
    ) -> Result<Self, reqwest::Error> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.request.headers {
            match (
                name.parse::<HeaderName>(),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "skipping invalid request header"),
            }
        }
        if !headers.contains_key(USER_AGENT) {
            headers.insert(USER_AGENT, HeaderValue::from_static(DEFAULT_USER_AGENT));
        }

        let timeout = Duration::from_secs(config.request.timeout_secs);
        let client = Self::build_client(&headers, timeout, None)?;

        Ok(Self {
            headers,
            timeout,
            encoding: config.request.encoding.clone(),
            max_retries: config.crawl.max_retries,
            proxy,
            client,
        })
    }

    // Legacy targets routinely serve expired or self-signed certificates.
    fn build_client(
        headers: &HeaderMap,
        timeout: Duration,
        proxy: Option<reqwest::Proxy>,
    ) -> Result<reqwest::Client, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .timeout(timeout)
            .default_headers(headers.clone())
            .danger_accept_invalid_certs(true)
            .redirect(reqwest::redirect::Policy::limited(5));
        if let Some(proxy) = proxy {
            builder = builder.proxy(proxy);
        }
        builder.build()
    }

    /// Fetch with the configured retry budget.
    pub async fn get(&self, url: &str) -> Option<String> {
        self.get_with_retries(url, self.max_retries).await
    }

    /// Fetch with an explicit retry budget. Between attempts a fresh proxy
    /// is acquired when a provider is present.
    pub async fn get_with_retries(&self, url: &str, max_retries: u32) -> Option<String> {
        let attempts = max_retries.max(1);
        for attempt in 1..=attempts {
            let client = match &self.proxy {
                Some(provider) => match provider.acquire().await {
                    Some(proxy) => {
                        match Self::build_client(&self.headers, self.timeout, Some(proxy)) {
                            Ok(client) => client,
                            Err(e) => {
                                warn!(error = %e, "failed to build proxied client, using direct");
                                self.client.clone()
                            }
                        }
                    }
                    None => {
                        debug!("proxy provider returned nothing, using direct connection");
                        self.client.clone()
                    }
                },
                None => self.client.clone(),
            };

            match self.try_get(&client, url).await {
                Ok(text) => return Some(text),
                Err(e) => {
                    debug!(url = %url, attempt, error = %e, "fetch attempt failed");
                    if attempt == attempts {
                        warn!(url = %url, attempts, "giving up after exhausting retries");
                    }
                }
            }
        }
        None
    }

    async fn try_get(&self, client: &reqwest::Client, url: &str) -> Result<String, FetchError> {
        let response = client.get(url).send().await?;
        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(FetchError::Status(status));
        }
        // A forced encoding overrides whatever the response declares;
        // otherwise the declared charset applies with a UTF-8 fallback.
        let text = match &self.encoding {
            Some(encoding) => response.text_with_charset(encoding).await?,
            None => response.text().await?,
        };
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SiteConfig;

    fn config_for(base_url: &str, max_retries: u32) -> SiteConfig {
        SiteConfig::from_json(&serde_json::json!({
            "site": {"name": "test", "base_url": base_url},
            "crawl": {"request_delay_secs": 0, "max_retries": max_retries},
            "parsers": {
                "chapter_list": {
                    "items": {"expression": "//dd", "index": null},
                    "title": {"expression": ".//a/text()", "index": 0},
                    "url": {"expression": ".//a/@href", "index": 0}
                },
                "chapter_content": {
                    "content": {"expression": "//div//text()", "index": null}
                }
            }
        }))
        .expect("test config")
    }

    #[tokio::test]
    async fn returns_body_on_success() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/page")
            .with_status(200)
            .with_body("<html>ok</html>")
            .create_async()
            .await;

        let fetcher = Fetcher::new(&config_for(&server.url(), 1), None).unwrap();
        let body = fetcher.get(&format!("{}/page", server.url())).await;
        assert_eq!(body.as_deref(), Some("<html>ok</html>"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_errors_consume_the_whole_retry_budget() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky")
            .with_status(500)
            .expect(5)
            .create_async()
            .await;

        let fetcher = Fetcher::new(&config_for(&server.url(), 5), None).unwrap();
        let body = fetcher.get(&format!("{}/flaky", server.url())).await;
        assert!(body.is_none());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn exhausted_retries_yield_none() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/gone")
            .with_status(404)
            .expect(3)
            .create_async()
            .await;

        let fetcher = Fetcher::new(&config_for(&server.url(), 3), None).unwrap();
        let body = fetcher.get(&format!("{}/gone", server.url())).await;
        assert!(body.is_none());
        mock.assert_async().await;
    }
}
