//! 📡 The HTTP muscle shared by every Elasticsearch generation.
//!
//! URL building, auth, and "did it work" checks. The generation-specific bits (paths with
//! or without mapping types) live next door in `generation.rs`. This file does not care
//! what year your cluster was installed.

use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use tracing::trace;

use super::ElasticsearchConfig;

/// 🔧 A `reqwest::Client` plus the base URL and credentials, built once and reused.
#[derive(Debug, Clone)]
pub(crate) struct EsHttp {
    client: reqwest::Client,
    base_url: Url,
    username: Option<String>,
    password: Option<String>,
    api_key: Option<String>,
}

impl EsHttp {
    /// 🚀 Build the client with sane timeouts. Like a polite person: we will wait, but not forever.
    pub(crate) fn new(config: &ElasticsearchConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("💀 The HTTP client refused to be born. Probably a missing TLS cert or a cursed system OpenSSL. Either way: tragic.")?;

        let base_url = Url::parse(&config.url).with_context(|| {
            format!("💀 '{}' is not a URL we can talk to. Include the scheme, e.g. http://localhost:9200", config.url)
        })?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("💀 '{}' cannot be used as a base URL", config.url);
        }

        Ok(Self {
            client,
            base_url,
            username: config.username.clone(),
            password: config.password.clone(),
            api_key: config.api_key.clone(),
        })
    }

    /// 📐 Base URL + percent-encoded path segments. Ids with slashes stay one segment.
    pub(crate) fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url
                .path_segments_mut()
                .map_err(|_| anyhow!("💀 base URL '{}' has no path to extend", self.base_url))?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    /// 📐 Same as [`EsHttp::url`], with a pre-encoded query string.
    pub(crate) fn url_with_query(&self, segments: &[&str], query: &str) -> Result<Url> {
        let mut url = self.url(segments)?;
        url.set_query(Some(query));
        Ok(url)
    }

    /// 🔒 Request builder with auth applied. API key wins over basic auth. This is not a democracy.
    pub(crate) fn request(&self, method: Method, url: Url) -> RequestBuilder {
        trace!("📡 {} {}", method, url);
        let request = self.client.request(method, url);
        if let Some(ref api_key) = self.api_key {
            request.header("Authorization", format!("ApiKey {}", api_key))
        } else if let Some(ref username) = self.username {
            request.basic_auth(username, self.password.as_ref())
        } else {
            request
        }
    }

    /// 📦 JSON request body, serialized by us so the client needs no extra features.
    pub(crate) fn json_request(&self, method: Method, url: Url, body: &serde_json::Value) -> RequestBuilder {
        self.request(method, url)
            .header("Content-Type", "application/json")
            .body(body.to_string())
    }

    /// 📡 Send, and context the network failure with what we were trying to do.
    pub(crate) async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        request
            .send()
            .await
            .with_context(|| format!("💀 could not {what}: the request never made it to Elasticsearch"))
    }

    /// ✅ Send, demand a 2xx, hand back the body text.
    pub(crate) async fn send_expect_success(&self, request: RequestBuilder, what: &str) -> Result<String> {
        let response = self.send(request, what).await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("💀 could not {what}: Elasticsearch answered {status} but the body never arrived"))?;
        if !status.is_success() {
            anyhow::bail!("💀 could not {what}: Elasticsearch answered {status} with '{body}'");
        }
        Ok(body)
    }

    /// 🔍 Send, treat 404 as "nothing there", anything else non-2xx as an error.
    pub(crate) async fn send_allow_404(&self, request: RequestBuilder, what: &str) -> Result<Option<String>> {
        let response = self.send(request, what).await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let body = response
            .text()
            .await
            .with_context(|| format!("💀 could not {what}: Elasticsearch answered {status} but the body never arrived"))?;
        if !status.is_success() {
            anyhow::bail!("💀 could not {what}: Elasticsearch answered {status} with '{body}'");
        }
        Ok(Some(body))
    }
}
