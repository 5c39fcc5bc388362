//! # 📡 THE ELASTICSEARCH BACKEND
//!
//! *Previously, on ixl...*
//!
//! 🎬 COLD OPEN - INT. SERVER ROOM - 3:47 AM
//!
//! Two clusters. One still on 6.x because "the upgrade is next quarter" (it has been next
//! quarter for three years). One on 8.x, shiny and typeless. Same engine has to drive both.
//!
//! [`ElasticsearchBackend<G>`] is the REST adapter. All the shared plumbing lives here and in
//! `http.rs`; the bits that changed between majors are behind the [`ApiGeneration`] marker
//! `G` (see `generation.rs`). `EsVersion` in config picks which marker gets built.
//!
//! 🦆 (mandatory duck, no context provided, none shall be requested)

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use tracing::{debug, trace};

use super::{
    AliasAction, AliasLookup, AliasMap, BulkItemResult, HealthReport, HealthStatus, SearchBackend,
    SettingsUpdate,
};
use crate::common::BulkOperation;
use crate::errors::BulkTransportError;

mod bulk_codec;
mod generation;
mod http;

pub use generation::{ApiGeneration, TypedApi, TypelessApi};
use http::EsHttp;

/// 🧬 Which REST generation the cluster speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EsVersion {
    V6,
    #[default]
    V7,
    V8,
}

/// 📡 ElasticsearchConfig: "It's just Elasticsearch", she said, before the cluster went red.
///
/// 🔧 auth is tri-modal: api_key, username+password, or "I hope anonymous works".
#[derive(Debug, Deserialize, Clone)]
pub struct ElasticsearchConfig {
    /// 📡 Cluster URL. Include scheme + port. Yes, all of it.
    pub url: String,
    #[serde(default)]
    pub version: EsVersion,
    /// 🏷️ Only consulted for 6.x clusters.
    #[serde(default = "default_mapping_type")]
    pub mapping_type: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_mapping_type() -> String {
    "_doc".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize)]
struct HealthBody {
    status: HealthStatus,
    #[serde(default)]
    timed_out: bool,
}

/// 📡 The REST adapter, generic over the API generation.
#[derive(Debug, Clone)]
pub struct ElasticsearchBackend<G: ApiGeneration> {
    http: EsHttp,
    generation: G,
    request_timeout: Duration,
}

impl<G: ApiGeneration> ElasticsearchBackend<G> {
    /// 🚀 Build the adapter. No network traffic yet; the health wait at open time is the
    /// first real handshake.
    pub fn new(config: &ElasticsearchConfig, generation: G) -> Result<Self> {
        debug!(
            "🔌 Elasticsearch backend for {} speaking the {} dialect",
            config.url,
            generation.name()
        );
        Ok(Self {
            http: EsHttp::new(config)?,
            generation,
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        })
    }
}

#[async_trait]
impl<G: ApiGeneration> SearchBackend for ElasticsearchBackend<G> {
    async fn index_exists(&self, index: &str) -> Result<bool> {
        let url = self.http.url(&[index])?;
        let response = self
            .http
            .send(self.http.request(Method::HEAD, url), "check whether the index exists")
            .await?;
        match response.status() {
            status if status.is_success() => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => anyhow::bail!("💀 HEAD /{index} answered {status}; cannot tell whether it exists"),
        }
    }

    async fn create_index(&self, index: &str, settings: &Value, mappings: &Value) -> Result<()> {
        let mut the_body = Map::new();
        if !settings.is_null() {
            the_body.insert("settings".to_string(), settings.clone());
        }
        if !mappings.is_null() {
            the_body.insert("mappings".to_string(), self.generation.mappings_body(mappings));
        }
        let url = self.http.url(&[index])?;
        self.http
            .send_expect_success(
                self.http.json_request(Method::PUT, url, &Value::Object(the_body)),
                &format!("create index '{index}'"),
            )
            .await?;
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        let url = self.http.url(&[index])?;
        self.http
            .send_expect_success(self.http.request(Method::DELETE, url), &format!("delete index '{index}'"))
            .await?;
        Ok(())
    }

    async fn refresh_index(&self, index: &str) -> Result<()> {
        let url = self.http.url(&[index, "_refresh"])?;
        self.http
            .send_expect_success(self.http.request(Method::POST, url), &format!("refresh index '{index}'"))
            .await?;
        Ok(())
    }

    async fn wait_for_health(&self, min_status: HealthStatus, timeout: Duration) -> Result<HealthReport> {
        // -- ⏳ the server waits up to `timeout`; the client must outlast it or we never hear the verdict
        let query = format!("wait_for_status={}&timeout={}s", min_status, timeout.as_secs().max(1));
        let url = self.http.url_with_query(&["_cluster", "health"], &query)?;
        let request = self
            .http
            .request(Method::GET, url)
            .timeout(timeout + self.request_timeout);
        let response = self.http.send(request, "wait for cluster health").await?;
        let status = response.status();
        let body = response
            .text()
            .await
            .with_context(|| format!("💀 cluster health answered {status} but its body was lost in transit"))?;
        // -- 🩺 408 is how ES says "I waited and it never got there". Still a valid health body.
        if !status.is_success() && status != StatusCode::REQUEST_TIMEOUT {
            anyhow::bail!("💀 cluster health answered {status} with '{body}'");
        }
        let the_health: HealthBody =
            serde_json::from_str(&body).context("💀 cluster health response did not parse")?;
        Ok(HealthReport {
            timed_out: the_health.timed_out || the_health.status < min_status,
            status: the_health.status,
        })
    }

    async fn get_aliases(&self, lookup: AliasLookup<'_>) -> Result<AliasMap> {
        let (url, what) = match lookup {
            AliasLookup::Alias(alias) => (self.http.url(&["_alias", alias])?, format!("look up alias '{alias}'")),
            AliasLookup::Index(index) => (
                self.http.url(&[index, "_alias"])?,
                format!("list aliases of index '{index}'"),
            ),
        };
        match self.http.send_allow_404(self.http.request(Method::GET, url), &what).await? {
            Some(body) => bulk_codec::decode_aliases(&body),
            None => Ok(AliasMap::new()),
        }
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<()> {
        let url = self.http.url(&["_aliases"])?;
        let the_body = json!({ "actions": actions });
        self.http
            .send_expect_success(self.http.json_request(Method::POST, url, &the_body), "apply alias actions")
            .await?;
        Ok(())
    }

    async fn update_index_settings(&self, index: &str, update: &SettingsUpdate) -> Result<()> {
        let url = self.http.url(&[index, "_settings"])?;
        let the_body = json!({ "index": update });
        self.http
            .send_expect_success(
                self.http.json_request(Method::PUT, url, &the_body),
                &format!("update settings of '{index}'"),
            )
            .await?;
        Ok(())
    }

    async fn bulk(
        &self,
        index: &str,
        operations: &[BulkOperation],
    ) -> std::result::Result<Vec<BulkItemResult>, BulkTransportError> {
        let payload = bulk_codec::encode_bulk_body(&self.generation, index, operations)
            .map_err(|err| BulkTransportError::fatal(format!("{err:#}")))?;
        let url = self
            .http
            .url(&["_bulk"])
            .map_err(|err| BulkTransportError::fatal(format!("{err:#}")))?;

        trace!("📡 sending {} bytes to /_bulk", payload.len());
        let request = self
            .http
            .request(Method::POST, url)
            // ⚠️ application/x-ndjson, not application/json. The bulk API is picky.
            .header("Content-Type", "application/x-ndjson")
            .body(payload);

        // -- 🌩️ no response at all: network trouble, worth another try
        let response = request
            .send()
            .await
            .map_err(|err| BulkTransportError::retryable(format!("bulk request never arrived: {err}")))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| BulkTransportError::retryable(format!("bulk response body was lost: {err}")))?;

        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(BulkTransportError::retryable(format!("bulk answered {status}: {body}")));
        }
        if !status.is_success() {
            return Err(BulkTransportError::fatal(format!("bulk answered {status}: {body}")));
        }
        bulk_codec::decode_bulk_response(operations, &body)
    }

    async fn get_document(&self, index: &str, id: &str) -> Result<Option<String>> {
        let url = self.http.url(&self.generation.document_path(index, id))?;
        let Some(body) = self
            .http
            .send_allow_404(self.http.request(Method::GET, url), &format!("get document '{id}'"))
            .await?
        else {
            return Ok(None);
        };
        let the_response: Value = serde_json::from_str(&body).context("💀 document response did not parse")?;
        if the_response.get("found").and_then(Value::as_bool) == Some(false) {
            return Ok(None);
        }
        Ok(the_response.get("_source").map(Value::to_string))
    }

    async fn index_document(&self, index: &str, id: &str, body: &str) -> Result<()> {
        let url = self.http.url(&self.generation.document_path(index, id))?;
        let request = self
            .http
            .request(Method::PUT, url)
            .header("Content-Type", "application/json")
            .body(body.to_string());
        self.http
            .send_expect_success(request, &format!("index document '{id}'"))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn the_config(server: &MockServer, version: EsVersion) -> ElasticsearchConfig {
        ElasticsearchConfig {
            url: server.uri(),
            version,
            mapping_type: "doc".to_string(),
            username: Some("elastic".to_string()),
            password: Some("changeme".to_string()),
            api_key: None,
            connect_timeout_secs: 2,
            request_timeout_secs: 5,
        }
    }

    #[tokio::test]
    async fn the_one_where_head_requests_answer_the_existential_question() -> Result<()> {
        let the_server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(path("/books"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&the_server)
            .await;
        Mock::given(method("HEAD"))
            .and(path("/ghosts"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&the_server)
            .await;

        let the_backend = ElasticsearchBackend::new(&the_config(&the_server, EsVersion::V7), TypelessApi)?;
        assert!(the_backend.index_exists("books").await?);
        assert!(!the_backend.index_exists("ghosts").await?);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_six_creates_indices_with_typed_mappings() -> Result<()> {
        let the_server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/books"))
            .and(body_json(json!({
                "settings": {"index": {"number_of_shards": 1}},
                "mappings": {"doc": {"properties": {"title": {"type": "text"}}}}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
            .expect(1)
            .mount(&the_server)
            .await;

        let the_backend = ElasticsearchBackend::new(&the_config(&the_server, EsVersion::V6), TypedApi::new("doc"))?;
        the_backend
            .create_index(
                "books",
                &json!({"index": {"number_of_shards": 1}}),
                &json!({"properties": {"title": {"type": "text"}}}),
            )
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_bulk_reports_item_failures_without_failing_the_batch() -> Result<()> {
        let the_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errors": true,
                "items": [
                    {"index": {"_id": "A", "status": 201}},
                    {"index": {"_id": "B", "status": 400, "error": {"type": "mapper_parsing_exception", "reason": "nope"}}}
                ]
            })))
            .mount(&the_server)
            .await;

        let the_backend = ElasticsearchBackend::new(&the_config(&the_server, EsVersion::V6), TypedApi::new("doc"))?;
        let the_results = the_backend
            .bulk(
                "books",
                &[BulkOperation::index("A", "{}"), BulkOperation::index("B", "{}")],
            )
            .await
            .expect("💀 a 200 bulk response is not a transport failure");

        assert!(the_results[0].error.is_none());
        assert_eq!(the_results[1].error.as_deref(), Some("mapper_parsing_exception: nope"));

        // -- 🔍 the 6.x dialect must have put _type on the action lines
        let the_requests = the_server.received_requests().await.unwrap_or_default();
        let the_sent = String::from_utf8_lossy(&the_requests[0].body).to_string();
        assert!(the_sent.contains(r#""_type":"doc""#));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_503_is_worth_another_try() -> Result<()> {
        let the_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .respond_with(ResponseTemplate::new(503).set_body_string("cluster is napping"))
            .mount(&the_server)
            .await;

        let the_backend = ElasticsearchBackend::new(&the_config(&the_server, EsVersion::V8), TypelessApi)?;
        let the_error = the_backend
            .bulk("books", &[BulkOperation::index("A", "{}")])
            .await
            .expect_err("💀 503 must surface as a transport failure");
        assert!(the_error.retryable);
        assert!(the_error.message.contains("503"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_health_timeouts_are_reported_not_thrown() -> Result<()> {
        let the_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_cluster/health"))
            .and(query_param("wait_for_status", "yellow"))
            .respond_with(
                ResponseTemplate::new(408).set_body_json(json!({"status": "red", "timed_out": true})),
            )
            .mount(&the_server)
            .await;

        let the_backend = ElasticsearchBackend::new(&the_config(&the_server, EsVersion::V7), TypelessApi)?;
        let the_report = the_backend
            .wait_for_health(HealthStatus::Yellow, Duration::from_secs(1))
            .await?;
        assert!(the_report.timed_out);
        assert_eq!(the_report.status, HealthStatus::Red);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_missing_aliases_are_just_empty() -> Result<()> {
        let the_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/_alias/books"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": "alias [books] missing", "status": 404})))
            .mount(&the_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/books1/_alias"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "books1": {"aliases": {"books": {}, "books-recent": {"filter": {"term": {"recent": true}}}}}
            })))
            .mount(&the_server)
            .await;

        let the_backend = ElasticsearchBackend::new(&the_config(&the_server, EsVersion::V7), TypelessApi)?;
        assert!(the_backend.get_aliases(AliasLookup::Alias("books")).await?.is_empty());
        let the_aliases = the_backend.get_aliases(AliasLookup::Index("books1")).await?;
        assert_eq!(the_aliases["books1"].len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_alias_plans_ship_in_one_request() -> Result<()> {
        let the_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_aliases"))
            .and(body_json(json!({"actions": [
                {"remove": {"index": "books1", "alias": "books"}},
                {"add": {"index": "books2", "alias": "books"}}
            ]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"acknowledged": true})))
            .expect(1)
            .mount(&the_server)
            .await;

        let the_backend = ElasticsearchBackend::new(&the_config(&the_server, EsVersion::V7), TypelessApi)?;
        the_backend
            .update_aliases(&[
                AliasAction::Remove {
                    index: "books1".to_string(),
                    alias: "books".to_string(),
                },
                AliasAction::Add {
                    index: "books2".to_string(),
                    alias: "books".to_string(),
                    filter: None,
                },
            ])
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_documents_come_home_as_their_source() -> Result<()> {
        let the_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/books/_doc/A"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_index": "books", "_id": "A", "found": true, "_source": {"title": "Dune"}
            })))
            .mount(&the_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/books/_doc/Z"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({"found": false})))
            .mount(&the_server)
            .await;

        let the_backend = ElasticsearchBackend::new(&the_config(&the_server, EsVersion::V7), TypelessApi)?;
        assert_eq!(
            the_backend.get_document("books", "A").await?.as_deref(),
            Some(r#"{"title":"Dune"}"#)
        );
        assert_eq!(the_backend.get_document("books", "Z").await?, None);
        Ok(())
    }
}
