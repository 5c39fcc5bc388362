//! 🔌 Backends: where the real I/O happens.
//!
//! 🎭 This module is the casting agency. The lifecycle manager and the ingestion engine only
//! ever talk to a [`SearchBackend`]. Whether that backend is an Elasticsearch 6 cluster with
//! mapping types, a typeless 7/8 cluster, or a `BTreeMap` in RAM wearing a fake moustache is
//! decided once, at startup, by configuration. Not by reflection. Not by a class name in a
//! string. By a `match`. As nature intended.
//!
//! 🧠 Knowledge graph:
//! - trait `SearchBackend` → concrete impls (`InMemoryBackend`, `ElasticsearchBackend<G>`)
//!   → `Backend` enum dispatcher → `Backend::from_config`
//! - Same shape as the source/sink backends this codebase grew up with.
//!
//! 🦆 The duck is here because every file must have one.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::common::{BulkOperation, OpKind};
use crate::errors::BulkTransportError;

pub mod elasticsearch;
pub mod in_mem;

pub use elasticsearch::{ElasticsearchBackend, ElasticsearchConfig, EsVersion, TypedApi, TypelessApi};
pub use in_mem::{InMemoryBackend, InMemoryConfig};

// ===== Wire-level vocabulary =====

/// 🩺 Cluster health, ordered from "on fire" to "chef's kiss".
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Red,
    Yellow,
    Green,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Red => "red",
            HealthStatus::Yellow => "yellow",
            HealthStatus::Green => "green",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 🩺 What the health endpoint said after we waited on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthReport {
    pub timed_out: bool,
    pub status: HealthStatus,
}

/// 🔍 How to look up aliases: by alias name, or everything hanging off one index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasLookup<'a> {
    Alias(&'a str),
    Index(&'a str),
}

/// 🗺️ index name → alias name → optional filter query.
pub type AliasMap = BTreeMap<String, BTreeMap<String, Option<serde_json::Value>>>;

/// 🔀 One entry of an atomic alias update. Serializes straight into the `_aliases` body.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AliasAction {
    Add {
        index: String,
        alias: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        filter: Option<serde_json::Value>,
    },
    Remove {
        index: String,
        alias: String,
    },
}

/// 🔧 The two knobs we turn around a bulk window. Absent fields are left alone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SettingsUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub number_of_replicas: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_interval: Option<String>,
}

impl SettingsUpdate {
    pub fn is_empty(&self) -> bool {
        self.number_of_replicas.is_none() && self.refresh_interval.is_none()
    }
}

/// 📬 Per-item verdict from a bulk call, positionally aligned with the submitted operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkItemResult {
    pub kind: OpKind,
    pub id: String,
    pub status: u16,
    /// 💀 present only when the backend reported an explicit per-item error
    pub error: Option<String>,
}

impl BulkItemResult {
    pub fn ok(kind: OpKind, id: impl Into<String>, status: u16) -> Self {
        Self {
            kind,
            id: id.into(),
            status,
            error: None,
        }
    }

    pub fn failed(kind: OpKind, id: impl Into<String>, status: u16, error: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            status,
            error: Some(error.into()),
        }
    }

    /// 🚦 the backend was too busy for this item. Try again later, politely.
    pub fn is_rejected(&self) -> bool {
        self.status == 429
    }
}

// ===== The trait =====

/// 🔌 Everything the engine needs from a search backend. Nothing more.
///
/// # Contract
/// - `update_aliases` applies the whole action list atomically or not at all.
/// - `bulk` returns one result per submitted operation, in order, or a transport error
///   for the batch as a whole.
/// - `get_aliases` returns an empty map when nothing matches. Not an error.
#[async_trait]
pub trait SearchBackend: fmt::Debug + Send + Sync + 'static {
    async fn index_exists(&self, index: &str) -> Result<bool>;
    async fn create_index(
        &self,
        index: &str,
        settings: &serde_json::Value,
        mappings: &serde_json::Value,
    ) -> Result<()>;
    async fn delete_index(&self, index: &str) -> Result<()>;
    async fn refresh_index(&self, index: &str) -> Result<()>;
    async fn wait_for_health(&self, min_status: HealthStatus, timeout: Duration) -> Result<HealthReport>;
    async fn get_aliases(&self, lookup: AliasLookup<'_>) -> Result<AliasMap>;
    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<()>;
    async fn update_index_settings(&self, index: &str, update: &SettingsUpdate) -> Result<()>;
    async fn bulk(
        &self,
        index: &str,
        operations: &[BulkOperation],
    ) -> std::result::Result<Vec<BulkItemResult>, BulkTransportError>;
    async fn get_document(&self, index: &str, id: &str) -> Result<Option<String>>;
    async fn index_document(&self, index: &str, id: &str, body: &str) -> Result<()>;
}

// ===== Config + dispatcher =====

/// 📋 Which backend to talk to. Externally tagged, so TOML reads `[backend.Elasticsearch]`.
#[derive(Debug, Clone, Deserialize)]
pub enum BackendConfig {
    Elasticsearch(ElasticsearchConfig),
    InMemory(InMemoryConfig),
}

/// 🎭 The many faces of a backend. Chosen once from config, dispatched with a `match`.
#[derive(Debug, Clone)]
pub enum Backend {
    InMemory(InMemoryBackend),
    Typed(ElasticsearchBackend<TypedApi>),
    Typeless(ElasticsearchBackend<TypelessApi>),
}

impl Backend {
    /// 🔧 The registry. `EsVersion` picks the REST generation, no runtime class loading involved.
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        Ok(match config {
            BackendConfig::InMemory(in_mem_config) => {
                Backend::InMemory(InMemoryBackend::from_config(in_mem_config))
            }
            BackendConfig::Elasticsearch(es_config) => match es_config.version {
                EsVersion::V6 => Backend::Typed(ElasticsearchBackend::new(
                    es_config,
                    TypedApi::new(es_config.mapping_type.clone()),
                )?),
                EsVersion::V7 | EsVersion::V8 => {
                    Backend::Typeless(ElasticsearchBackend::new(es_config, TypelessApi)?)
                }
            },
        })
    }
}

// -- 🎭 one macro-free match per method. Repetitive? Yes. Greppable? Also yes.
#[async_trait]
impl SearchBackend for Backend {
    async fn index_exists(&self, index: &str) -> Result<bool> {
        match self {
            Backend::InMemory(b) => b.index_exists(index).await,
            Backend::Typed(b) => b.index_exists(index).await,
            Backend::Typeless(b) => b.index_exists(index).await,
        }
    }

    async fn create_index(
        &self,
        index: &str,
        settings: &serde_json::Value,
        mappings: &serde_json::Value,
    ) -> Result<()> {
        match self {
            Backend::InMemory(b) => b.create_index(index, settings, mappings).await,
            Backend::Typed(b) => b.create_index(index, settings, mappings).await,
            Backend::Typeless(b) => b.create_index(index, settings, mappings).await,
        }
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        match self {
            Backend::InMemory(b) => b.delete_index(index).await,
            Backend::Typed(b) => b.delete_index(index).await,
            Backend::Typeless(b) => b.delete_index(index).await,
        }
    }

    async fn refresh_index(&self, index: &str) -> Result<()> {
        match self {
            Backend::InMemory(b) => b.refresh_index(index).await,
            Backend::Typed(b) => b.refresh_index(index).await,
            Backend::Typeless(b) => b.refresh_index(index).await,
        }
    }

    async fn wait_for_health(&self, min_status: HealthStatus, timeout: Duration) -> Result<HealthReport> {
        match self {
            Backend::InMemory(b) => b.wait_for_health(min_status, timeout).await,
            Backend::Typed(b) => b.wait_for_health(min_status, timeout).await,
            Backend::Typeless(b) => b.wait_for_health(min_status, timeout).await,
        }
    }

    async fn get_aliases(&self, lookup: AliasLookup<'_>) -> Result<AliasMap> {
        match self {
            Backend::InMemory(b) => b.get_aliases(lookup).await,
            Backend::Typed(b) => b.get_aliases(lookup).await,
            Backend::Typeless(b) => b.get_aliases(lookup).await,
        }
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<()> {
        match self {
            Backend::InMemory(b) => b.update_aliases(actions).await,
            Backend::Typed(b) => b.update_aliases(actions).await,
            Backend::Typeless(b) => b.update_aliases(actions).await,
        }
    }

    async fn update_index_settings(&self, index: &str, update: &SettingsUpdate) -> Result<()> {
        match self {
            Backend::InMemory(b) => b.update_index_settings(index, update).await,
            Backend::Typed(b) => b.update_index_settings(index, update).await,
            Backend::Typeless(b) => b.update_index_settings(index, update).await,
        }
    }

    async fn bulk(
        &self,
        index: &str,
        operations: &[BulkOperation],
    ) -> std::result::Result<Vec<BulkItemResult>, BulkTransportError> {
        match self {
            Backend::InMemory(b) => b.bulk(index, operations).await,
            Backend::Typed(b) => b.bulk(index, operations).await,
            Backend::Typeless(b) => b.bulk(index, operations).await,
        }
    }

    async fn get_document(&self, index: &str, id: &str) -> Result<Option<String>> {
        match self {
            Backend::InMemory(b) => b.get_document(index, id).await,
            Backend::Typed(b) => b.get_document(index, id).await,
            Backend::Typeless(b) => b.get_document(index, id).await,
        }
    }

    async fn index_document(&self, index: &str, id: &str, body: &str) -> Result<()> {
        match self {
            Backend::InMemory(b) => b.index_document(index, id, body).await,
            Backend::Typed(b) => b.index_document(index, id, body).await,
            Backend::Typeless(b) => b.index_document(index, id, body).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn the_one_where_alias_actions_speak_fluent_aliases_api() {
        let the_actions = vec![
            AliasAction::Remove {
                index: "books1".to_string(),
                alias: "books".to_string(),
            },
            AliasAction::Add {
                index: "books2".to_string(),
                alias: "books-recent".to_string(),
                filter: Some(json!({"range": {"year": {"gte": 2020}}})),
            },
            AliasAction::Add {
                index: "books2".to_string(),
                alias: "books".to_string(),
                filter: None,
            },
        ];

        let the_wire = serde_json::to_value(&the_actions).expect("💀 alias actions must serialize");
        assert_eq!(
            the_wire,
            json!([
                {"remove": {"index": "books1", "alias": "books"}},
                {"add": {"index": "books2", "alias": "books-recent", "filter": {"range": {"year": {"gte": 2020}}}}},
                {"add": {"index": "books2", "alias": "books"}}
            ])
        );
    }

    #[test]
    fn the_one_where_health_has_a_pecking_order() {
        assert!(HealthStatus::Green > HealthStatus::Yellow);
        assert!(HealthStatus::Yellow > HealthStatus::Red);
        assert_eq!(HealthStatus::Yellow.to_string(), "yellow");
    }

    #[test]
    fn the_one_where_the_config_picks_the_generation() {
        let the_in_mem = Backend::from_config(&BackendConfig::InMemory(InMemoryConfig::default()))
            .expect("💀 in-memory backend should always build");
        assert!(matches!(the_in_mem, Backend::InMemory(_)));
    }

    #[test]
    fn the_one_where_settings_updates_skip_what_they_do_not_touch() {
        let the_update = SettingsUpdate {
            number_of_replicas: Some(0),
            refresh_interval: None,
        };
        assert_eq!(
            serde_json::to_value(&the_update).expect("💀 settings update must serialize"),
            json!({"number_of_replicas": 0})
        );
        assert!(SettingsUpdate::default().is_empty());
    }
}
