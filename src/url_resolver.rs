//! Follows HTTP redirects of links found in a message so the landing page,
//! not just the link as written, is analyzed.

use crate::domain_utils::DomainUtils;
use crate::features::link_analyzer::UrlAssessment;
use reqwest::header::{CONTENT_TYPE, LOCATION};
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedirectConfig {
    pub enabled: bool,
    /// Follow every link instead of only known shorteners
    pub follow_all_links: bool,
    pub max_redirects: usize,
    /// Links followed per message
    pub max_links: usize,
    pub timeout_seconds: u64,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            follow_all_links: false,
            max_redirects: 5,
            max_links: 5,
            timeout_seconds: 5,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ResolveError {
    #[error("invalid URL '{0}'")]
    InvalidUrl(String),
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("redirect from {url} to unusable location '{location}'")]
    InvalidLocation { url: String, location: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedirectHop {
    pub from: String,
    pub to: String,
    pub status: u16,
}

/// Where a link ended up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedirectChain {
    pub original_url: String,
    pub hops: Vec<RedirectHop>,
    pub final_url: String,
    pub final_host: Option<String>,
    /// Media type of the final response, without parameters
    pub content_type: Option<String>,
    /// Still redirecting when `max_redirects` was reached
    pub truncated: bool,
}

impl RedirectChain {
    pub fn redirect_count(&self) -> usize {
        self.hops.len()
    }

    /// Registrable domains along the chain, first visit order
    pub fn domains(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        std::iter::once(self.original_url.as_str())
            .chain(self.hops.iter().map(|hop| hop.to.as_str()))
            .filter_map(|url| Url::parse(url).ok()?.host_str().map(|h| h.to_lowercase()))
            .map(|host| {
                if DomainUtils::is_ip_literal(&host) {
                    host
                } else {
                    DomainUtils::registrable_domain(&host)
                }
            })
            .filter(|domain| seen.insert(domain.clone()))
            .collect()
    }
}

pub struct UrlResolver {
    client: Client,
    config: RedirectConfig,
}

impl UrlResolver {
    pub fn new(config: RedirectConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds.max(1)))
            .user_agent(concat!("phishguard/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self { client, config })
    }

    /// Links worth following: shorteners, or every non-safe link when
    /// `follow_all_links` is set
    pub fn select_links(&self, assessments: &[UrlAssessment]) -> Vec<String> {
        let mut seen = HashSet::new();
        assessments
            .iter()
            .filter(|a| a.host.is_some() && !a.safe_listed)
            .filter(|a| {
                self.config.follow_all_links || a.indicators.iter().any(|i| i == "url_shortener")
            })
            .map(|a| a.url.clone())
            .filter(|url| url.starts_with("http://") || url.starts_with("https://"))
            .filter(|url| seen.insert(url.clone()))
            .take(self.config.max_links)
            .collect()
    }

    /// Follow redirects of `url` until a non-redirect response or the hop limit
    pub async fn resolve(&self, url: &str) -> Result<RedirectChain, ResolveError> {
        let mut current = Url::parse(url).map_err(|_| ResolveError::InvalidUrl(url.to_string()))?;
        let mut hops = Vec::new();
        let mut truncated = false;
        let mut content_type = None;

        loop {
            let response = self.fetch(&current).await?;
            let status = response.status();

            if !status.is_redirection() {
                content_type = response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.split(';').next())
                    .map(|v| v.trim().to_ascii_lowercase())
                    .filter(|v| !v.is_empty());
                break;
            }

            let Some(location) = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
            else {
                break;
            };

            if hops.len() >= self.config.max_redirects {
                truncated = true;
                break;
            }

            // Relative locations resolve against the current URL
            let next = current
                .join(&location)
                .map_err(|_| ResolveError::InvalidLocation {
                    url: current.to_string(),
                    location: location.clone(),
                })?;
            log::debug!("{} redirects ({}) to {}", current, status.as_u16(), next);
            hops.push(RedirectHop {
                from: current.to_string(),
                to: next.to_string(),
                status: status.as_u16(),
            });
            current = next;
        }

        Ok(RedirectChain {
            original_url: url.to_string(),
            hops,
            final_host: current.host_str().map(|h| h.to_lowercase()),
            final_url: current.to_string(),
            content_type,
            truncated,
        })
    }

    /// Resolve each link, keyed by the link as written; failures are skipped
    pub async fn resolve_all(&self, urls: &[String]) -> HashMap<String, RedirectChain> {
        let mut chains = HashMap::new();
        for url in urls {
            match self.resolve(url).await {
                Ok(chain) => {
                    chains.insert(url.clone(), chain);
                }
                Err(e) => log::debug!("Could not follow {url}: {e}"),
            }
        }
        chains
    }

    /// HEAD first; some servers only answer GET
    async fn fetch(&self, url: &Url) -> Result<Response, ResolveError> {
        let request_error = |e: reqwest::Error| ResolveError::Request {
            url: url.to_string(),
            message: e.to_string(),
        };

        let response = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(request_error)?;
        if matches!(
            response.status(),
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_IMPLEMENTED
        ) {
            return self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(request_error);
        }
        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use httpmock::Method::HEAD;

    fn resolver(max_redirects: usize) -> UrlResolver {
        UrlResolver::new(RedirectConfig {
            max_redirects,
            timeout_seconds: 2,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_follows_absolute_and_relative_redirects() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/s/abc");
                then.status(301).header("Location", server.url("/hop"));
            })
            .await;
        server
            .mock_async(|when, then| {
                when.path("/hop");
                then.status(302).header("Location", "/files/invoice.zip");
            })
            .await;
        server
            .mock_async(|when, then| {
                when.path("/files/invoice.zip");
                then.status(200)
                    .header("Content-Type", "application/zip; name=invoice.zip");
            })
            .await;

        let start = server.url("/s/abc");
        let chain = resolver(5).resolve(&start).await.unwrap();

        assert_eq!(chain.original_url, start);
        assert_eq!(chain.redirect_count(), 2);
        assert_eq!(chain.hops[0].status, 301);
        assert_eq!(chain.hops[1].status, 302);
        assert_eq!(chain.final_url, server.url("/files/invoice.zip"));
        assert_eq!(chain.final_host.as_deref(), Some("127.0.0.1"));
        assert_eq!(chain.content_type.as_deref(), Some("application/zip"));
        assert!(!chain.truncated);
    }

    #[tokio::test]
    async fn test_stops_at_redirect_limit() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.path("/loop");
                then.status(302).header("Location", "/loop");
            })
            .await;

        let chain = resolver(3).resolve(&server.url("/loop")).await.unwrap();
        assert_eq!(chain.redirect_count(), 3);
        assert!(chain.truncated);
        assert!(chain.content_type.is_none());
    }

    #[tokio::test]
    async fn test_falls_back_to_get_when_head_is_refused() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(HEAD).path("/r");
                then.status(405);
            })
            .await;
        let get = server
            .mock_async(|when, then| {
                when.method(GET).path("/r");
                then.status(200).header("Content-Type", "text/html");
            })
            .await;

        let chain = resolver(5).resolve(&server.url("/r")).await.unwrap();
        get.assert_async().await;
        assert_eq!(chain.redirect_count(), 0);
        assert_eq!(chain.content_type.as_deref(), Some("text/html"));
    }

    #[tokio::test]
    async fn test_unreachable_links_are_skipped() {
        let resolver = resolver(5);
        let chains = resolver
            .resolve_all(&["http://127.0.0.1:1/x".to_string(), "not a url".to_string()])
            .await;
        assert!(chains.is_empty());
    }

    #[test]
    fn test_domains_in_visit_order() {
        let hop = |from: &str, to: &str| RedirectHop {
            from: from.to_string(),
            to: to.to_string(),
            status: 302,
        };
        let chain = RedirectChain {
            original_url: "https://bit.ly/x".to_string(),
            hops: vec![
                hop("https://bit.ly/x", "https://t.tracker.example.com/c"),
                hop("https://t.tracker.example.com/c", "https://www.tracker.example.com/d"),
                hop("https://www.tracker.example.com/d", "https://login.evil.example.net/"),
            ],
            final_url: "https://login.evil.example.net/".to_string(),
            final_host: Some("login.evil.example.net".to_string()),
            content_type: Some("text/html".to_string()),
            truncated: false,
        };
        assert_eq!(
            chain.domains(),
            vec!["bit.ly", "example.com", "example.net"]
        );
    }

    #[test]
    fn test_select_links() {
        use crate::email::{ExtractedUrl, UrlSource};
        use crate::features::link_analyzer::LinkAnalyzer;

        let analyzer = LinkAnalyzer::default();
        let assessments: Vec<UrlAssessment> = [
            "https://bit.ly/3xYz",
            "https://bit.ly/3xYz",
            "https://shop.example/deal",
            "https://www.paypal.com/signin",
        ]
        .iter()
        .map(|u| analyzer.assess(&ExtractedUrl::new(u, None, UrlSource::Text)))
        .collect();

        assert_eq!(
            resolver(5).select_links(&assessments),
            vec!["https://bit.ly/3xYz".to_string()]
        );

        let all = UrlResolver::new(RedirectConfig {
            follow_all_links: true,
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            all.select_links(&assessments),
            vec![
                "https://bit.ly/3xYz".to_string(),
                "https://shop.example/deal".to_string()
            ]
        );
    }
}
