//! # Previously, on ixl...
//!
//! 🎬 The cluster was down for maintenance. The tests still had to run. Someone had to
//! pretend to be Elasticsearch convincingly enough that the lifecycle manager would not
//! notice. That someone was this module.
//!
//! [`InMemoryBackend`] implements the whole [`SearchBackend`] contract on top of a
//! `BTreeMap` behind an `Arc<Mutex<...>>`. Clone it, hand one copy to the engine, keep the
//! other, and inspect what arrived afterwards: alias update calls, bulk batch sizes, the
//! settings history of every index. Great for assertions, great for trust issues.
//!
//! 🧪 It also fails on command: per-id item failures, whole-batch transport failures,
//! 429 rejections, a cluster stuck at red. Chaos, but deterministic.
//!
//! ⚠️ Not for production data. `[backend.InMemory]` exists for dry runs of a config.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use super::{
    AliasAction, AliasLookup, AliasMap, BulkItemResult, HealthReport, HealthStatus, SearchBackend,
    SettingsUpdate,
};
use crate::common::{BulkOperation, OpKind};
use crate::errors::BulkTransportError;

/// 📋 Dry-run knobs. Mostly here so TOML can say `[backend.InMemory]` and mean it.
#[derive(Debug, Clone, Deserialize)]
pub struct InMemoryConfig {
    /// 🩺 the health the pretend cluster reports
    #[serde(default = "default_health")]
    pub health: HealthStatus,
}

fn default_health() -> HealthStatus {
    HealthStatus::Green
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            health: default_health(),
        }
    }
}

/// 📦 One pretend index.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIndex {
    pub settings: serde_json::Value,
    pub mappings: serde_json::Value,
    pub number_of_replicas: u32,
    pub refresh_interval: String,
    pub docs: BTreeMap<String, String>,
    pub aliases: BTreeMap<String, Option<serde_json::Value>>,
    pub refresh_count: usize,
}

/// 🔒 The vault. Every field is public so tests can stage a scene and inspect the aftermath.
#[derive(Debug)]
pub struct InMemoryState {
    pub indices: BTreeMap<String, InMemoryIndex>,
    pub health: HealthStatus,
    /// 🔀 every `update_aliases` call, one entry per call
    pub alias_updates: Vec<Vec<AliasAction>>,
    /// 📦 operation count of every bulk call that reached the backend, in arrival order
    pub bulk_batches: Vec<usize>,
    /// 🔧 every settings change, `(index, update)`
    pub settings_history: Vec<(String, SettingsUpdate)>,
    /// 💀 ids whose index/update ops fail with a mapping error
    pub failing_ids: BTreeSet<String>,
    /// 🌩️ the next N bulk calls fail below the item level
    pub transport_failures_remaining: usize,
    pub transport_failures_retryable: bool,
    /// 🚦 the next N items get a 429 instead of being applied
    pub rejections_remaining: usize,
    /// ⏳ artificial latency per bulk call, for drain-timeout experiments
    pub bulk_latency: Option<Duration>,
}

impl Default for InMemoryState {
    fn default() -> Self {
        Self {
            indices: BTreeMap::new(),
            health: HealthStatus::Green,
            alias_updates: Vec::new(),
            bulk_batches: Vec::new(),
            settings_history: Vec::new(),
            failing_ids: BTreeSet::new(),
            transport_failures_remaining: 0,
            transport_failures_retryable: false,
            rejections_remaining: 0,
            bulk_latency: None,
        }
    }
}

/// 🧠 A search backend that lives entirely in RAM, gone the moment you blink.
///
/// Clone-able because tests need to peek inside after handing a copy to the session.
/// The `Arc` means everyone shares the same state.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBackend {
    state: Arc<Mutex<InMemoryState>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &InMemoryConfig) -> Self {
        let state = InMemoryState {
            health: config.health,
            ..InMemoryState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    /// 🎬 Stage the scene: mutate state before the run starts.
    pub async fn configure<F>(&self, f: F)
    where
        F: FnOnce(&mut InMemoryState),
    {
        let mut state = self.state.lock().await;
        f(&mut state);
    }

    /// 🔍 Inspect the aftermath without taking the lock home with you.
    pub async fn inspect<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&InMemoryState) -> R,
    {
        let state = self.state.lock().await;
        f(&state)
    }

    /// 🏗️ Convenience for tests: an existing index with the given aliases and docs.
    pub async fn seed_index(&self, name: &str, aliases: &[(&str, Option<serde_json::Value>)], docs: &[(&str, &str)]) {
        let mut state = self.state.lock().await;
        let index = state.indices.entry(name.to_string()).or_insert_with(|| InMemoryIndex {
            number_of_replicas: 1,
            refresh_interval: "1s".to_string(),
            ..InMemoryIndex::default()
        });
        for (alias, filter) in aliases {
            index.aliases.insert(alias.to_string(), filter.clone());
        }
        for (id, body) in docs {
            index.docs.insert(id.to_string(), body.to_string());
        }
    }
}

// -- 🔎 settings payloads come both flat (`number_of_replicas`) and nested (`index.number_of_replicas`)
fn read_setting<'a>(settings: &'a serde_json::Value, key: &str) -> Option<&'a serde_json::Value> {
    settings
        .get("index")
        .and_then(|index| index.get(key))
        .or_else(|| settings.get(key))
        .or_else(|| settings.get(format!("index.{key}")))
}

fn replicas_from(settings: &serde_json::Value) -> u32 {
    match read_setting(settings, "number_of_replicas") {
        Some(serde_json::Value::Number(n)) => n.as_u64().map_or(1, |n| n as u32),
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(1),
        _ => 1,
    }
}

fn refresh_from(settings: &serde_json::Value) -> String {
    read_setting(settings, "refresh_interval")
        .and_then(|v| v.as_str())
        .unwrap_or("1s")
        .to_string()
}

// -- 🩹 partial update: shallow merge of top-level keys, the way a `doc` update behaves for flat docs
fn merge_documents(existing: &str, patch: &str) -> Result<String> {
    let mut the_base: serde_json::Value =
        serde_json::from_str(existing).context("💀 stored document is not JSON. Who put that there?")?;
    let the_patch: serde_json::Value =
        serde_json::from_str(patch).context("💀 partial update body is not JSON")?;
    match (the_base.as_object_mut(), the_patch.as_object()) {
        (Some(base), Some(patch)) => {
            for (key, value) in patch {
                base.insert(key.clone(), value.clone());
            }
        }
        _ => bail!("💀 partial updates need JSON objects on both sides"),
    }
    Ok(the_base.to_string())
}

#[async_trait]
impl SearchBackend for InMemoryBackend {
    async fn index_exists(&self, index: &str) -> Result<bool> {
        Ok(self.state.lock().await.indices.contains_key(index))
    }

    async fn create_index(
        &self,
        index: &str,
        settings: &serde_json::Value,
        mappings: &serde_json::Value,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.indices.contains_key(index) {
            bail!("💀 resource_already_exists_exception: index '{index}' already exists");
        }
        debug!("🏗️ in-memory backend creating index '{index}'");
        state.indices.insert(
            index.to_string(),
            InMemoryIndex {
                settings: settings.clone(),
                mappings: mappings.clone(),
                number_of_replicas: replicas_from(settings),
                refresh_interval: refresh_from(settings),
                ..InMemoryIndex::default()
            },
        );
        Ok(())
    }

    async fn delete_index(&self, index: &str) -> Result<()> {
        match self.state.lock().await.indices.remove(index) {
            Some(_) => Ok(()),
            None => bail!("💀 index_not_found_exception: no such index '{index}'"),
        }
    }

    async fn refresh_index(&self, index: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let the_index = state
            .indices
            .get_mut(index)
            .with_context(|| format!("💀 cannot refresh '{index}', it does not exist"))?;
        the_index.refresh_count += 1;
        Ok(())
    }

    async fn wait_for_health(&self, min_status: HealthStatus, _timeout: Duration) -> Result<HealthReport> {
        // -- ⏱️ no waiting in RAM. The cluster is what it is, instantly.
        let status = self.state.lock().await.health;
        Ok(HealthReport {
            timed_out: status < min_status,
            status,
        })
    }

    async fn get_aliases(&self, lookup: AliasLookup<'_>) -> Result<AliasMap> {
        let state = self.state.lock().await;
        let mut the_map = AliasMap::new();
        for (index_name, index) in &state.indices {
            let matching: BTreeMap<String, Option<serde_json::Value>> = match lookup {
                AliasLookup::Alias(alias) => index
                    .aliases
                    .iter()
                    .filter(|(name, _)| name.as_str() == alias)
                    .map(|(name, filter)| (name.clone(), filter.clone()))
                    .collect(),
                AliasLookup::Index(wanted) if wanted == index_name => index.aliases.clone(),
                AliasLookup::Index(_) => continue,
            };
            if !matching.is_empty() {
                the_map.insert(index_name.clone(), matching);
            }
        }
        Ok(the_map)
    }

    async fn update_aliases(&self, actions: &[AliasAction]) -> Result<()> {
        let mut state = self.state.lock().await;
        // -- ⚛️ validate everything first. All or nothing, like the real thing.
        for action in actions {
            let (AliasAction::Add { index, .. } | AliasAction::Remove { index, .. }) = action;
            if !state.indices.contains_key(index) {
                bail!("💀 alias action targets missing index '{index}'; nothing applied");
            }
        }
        for action in actions {
            match action {
                AliasAction::Add { index, alias, filter } => {
                    if let Some(the_index) = state.indices.get_mut(index) {
                        the_index.aliases.insert(alias.clone(), filter.clone());
                    }
                }
                AliasAction::Remove { index, alias } => {
                    if let Some(the_index) = state.indices.get_mut(index) {
                        the_index.aliases.remove(alias);
                    }
                }
            }
        }
        state.alias_updates.push(actions.to_vec());
        Ok(())
    }

    async fn update_index_settings(&self, index: &str, update: &SettingsUpdate) -> Result<()> {
        let mut state = self.state.lock().await;
        let the_index = state
            .indices
            .get_mut(index)
            .with_context(|| format!("💀 cannot update settings of '{index}', it does not exist"))?;
        if let Some(replicas) = update.number_of_replicas {
            the_index.number_of_replicas = replicas;
        }
        if let Some(ref refresh) = update.refresh_interval {
            the_index.refresh_interval = refresh.clone();
        }
        state.settings_history.push((index.to_string(), update.clone()));
        Ok(())
    }

    async fn bulk(
        &self,
        index: &str,
        operations: &[BulkOperation],
    ) -> std::result::Result<Vec<BulkItemResult>, BulkTransportError> {
        let latency = self.state.lock().await.bulk_latency;
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.lock().await;
        state.bulk_batches.push(operations.len());
        trace!("📦 in-memory bulk of {} ops into '{index}'", operations.len());

        if state.transport_failures_remaining > 0 {
            state.transport_failures_remaining -= 1;
            let message = "🌩️ simulated transport failure".to_string();
            return Err(if state.transport_failures_retryable {
                BulkTransportError::retryable(message)
            } else {
                BulkTransportError::fatal(message)
            });
        }

        let mut results = Vec::with_capacity(operations.len());
        for op in operations {
            if state.rejections_remaining > 0 {
                state.rejections_remaining -= 1;
                results.push(BulkItemResult::failed(
                    op.kind,
                    &op.id,
                    429,
                    "es_rejected_execution_exception: queue full",
                ));
                continue;
            }
            let poisoned = op.kind != OpKind::Delete && state.failing_ids.contains(&op.id);
            let Some(the_index) = state.indices.get_mut(index) else {
                results.push(BulkItemResult::failed(
                    op.kind,
                    &op.id,
                    404,
                    format!("index_not_found_exception: no such index [{index}]"),
                ));
                continue;
            };
            if poisoned {
                results.push(BulkItemResult::failed(
                    op.kind,
                    &op.id,
                    400,
                    "mapper_parsing_exception: failed to parse",
                ));
                continue;
            }
            let result = match (op.kind, op.body.as_deref()) {
                (OpKind::Index, Some(body)) => {
                    let created = the_index.docs.insert(op.id.clone(), body.to_string()).is_none();
                    BulkItemResult::ok(op.kind, &op.id, if created { 201 } else { 200 })
                }
                (OpKind::Update, Some(patch)) => match the_index.docs.get(&op.id) {
                    Some(existing) => match merge_documents(existing, patch) {
                        Ok(merged) => {
                            the_index.docs.insert(op.id.clone(), merged);
                            BulkItemResult::ok(op.kind, &op.id, 200)
                        }
                        Err(err) => BulkItemResult::failed(op.kind, &op.id, 400, err.to_string()),
                    },
                    None => BulkItemResult::failed(
                        op.kind,
                        &op.id,
                        404,
                        format!("document_missing_exception: [{}]: document missing", op.id),
                    ),
                },
                (OpKind::Delete, _) => {
                    let existed = the_index.docs.remove(&op.id).is_some();
                    BulkItemResult::ok(op.kind, &op.id, if existed { 200 } else { 404 })
                }
                (_, None) => BulkItemResult::failed(op.kind, &op.id, 400, "action_request_validation_exception: source is missing"),
            };
            results.push(result);
        }
        Ok(results)
    }

    async fn get_document(&self, index: &str, id: &str) -> Result<Option<String>> {
        let state = self.state.lock().await;
        Ok(state
            .indices
            .get(index)
            .and_then(|the_index| the_index.docs.get(id).cloned()))
    }

    async fn index_document(&self, index: &str, id: &str, body: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let the_index = state
            .indices
            .get_mut(index)
            .with_context(|| format!("💀 cannot index '{id}' into missing index '{index}'"))?;
        the_index.docs.insert(id.to_string(), body.to_string());
        Ok(())
    }
}
