//! 🔧 App Configuration: the TOML-to-struct pipeline.
//!
//! 📡 "Config not found: we looked everywhere. Under the couch. Behind the fridge." 🦆
//!
//! Powered by Figment: `IXL_*` environment variables first, an optional TOML file on top.
//! Nested keys in env vars use `__`, so `IXL_INDEX__NAME=books` is `[index] name = "books"`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::backends::BackendConfig;
use crate::common::IndexSettings;
use crate::errors::IndexError;
use crate::ingest::{BackoffPolicy, IngestOptions};
use crate::lifecycle::{IndexPayload, LifecycleOptions};
use crate::naming::NamingPolicy;
use crate::session::SessionOptions;

/// 📦 One struct to rule them all.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub index: IndexConfig,
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// 🏷️ What to write into, and how to build it.
#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    /// 🏷️ base name; doubles as the alias name
    pub name: String,
    /// 📅 e.g. `yyyyMMdd`; absent means no time-windowed rebuilds
    #[serde(default)]
    pub time_window: Option<String>,
    /// 🩹 incremental run against an existing index
    #[serde(default)]
    pub update: bool,
    /// 🗑️ drop and recreate the target index
    #[serde(default)]
    pub delete: bool,
    #[serde(default)]
    pub settings_file: Option<PathBuf>,
    #[serde(default)]
    pub mappings_file: Option<PathBuf>,
    #[serde(default)]
    pub settings: Option<Value>,
    #[serde(default)]
    pub mappings: Option<Value>,
    /// 🔧 replicas, refresh and bulk sizing live right in `[index]`
    #[serde(flatten)]
    pub tuning: IndexSettings,
}

impl IndexConfig {
    pub fn naming_policy(&self) -> Result<NamingPolicy, IndexError> {
        NamingPolicy::new(&self.name, self.time_window.as_deref(), self.update)
    }

    /// 📜 The create-index payloads: from files, inline tables, or nothing at all.
    pub async fn load_payload(&self) -> Result<IndexPayload> {
        Ok(IndexPayload {
            settings: load_json_part("settings", self.settings_file.as_deref(), self.settings.as_ref()).await?,
            mappings: load_json_part("mappings", self.mappings_file.as_deref(), self.mappings.as_ref()).await?,
        })
    }
}

async fn load_json_part(what: &str, file: Option<&Path>, inline: Option<&Value>) -> Result<Value> {
    match (file, inline) {
        (Some(_), Some(_)) => bail!("💀 index {what} are given both as a file and inline; pick one"),
        (Some(path), None) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("💀 could not read index {what} from '{}'", path.display()))?;
            serde_json::from_str(&raw)
                .with_context(|| format!("💀 index {what} file '{}' is not valid JSON", path.display()))
        }
        (None, Some(inline)) => Ok(inline.clone()),
        (None, None) => Ok(Value::Object(Default::default())),
    }
}

/// 📂 Where the records come from. No file means an open/close run with no writes.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct InputConfig {
    #[serde(default)]
    pub file: Option<PathBuf>,
}

/// ⏱️ Run-level knobs.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    #[serde(default = "default_true")]
    pub switch_alias: bool,
    #[serde(default = "default_health_timeout_secs")]
    pub health_timeout_secs: u64,
    #[serde(default = "default_flush_timeout_secs")]
    pub flush_timeout_secs: u64,
    /// 📊 terminal progress bar while reading records
    #[serde(default = "default_true")]
    pub progress: bool,
    #[serde(default)]
    pub backoff: BackoffPolicy,
}

fn default_true() -> bool {
    true
}

fn default_health_timeout_secs() -> u64 {
    60
}

fn default_flush_timeout_secs() -> u64 {
    120
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            switch_alias: true,
            health_timeout_secs: default_health_timeout_secs(),
            flush_timeout_secs: default_flush_timeout_secs(),
            progress: true,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl RuntimeConfig {
    pub fn session_options(&self, index: &IndexConfig) -> SessionOptions {
        SessionOptions {
            lifecycle: LifecycleOptions {
                update_mode: index.update,
                delete_requested: index.delete,
                health_timeout: Duration::from_secs(self.health_timeout_secs),
            },
            ingest: IngestOptions {
                backoff: self.backoff,
                flush_timeout: Duration::from_secs(self.flush_timeout_secs),
            },
        }
    }
}

/// 🚀 Load the config from env vars and, when given, a TOML file. The file wins on conflicts.
///
/// - `None` → env vars only (`IXL_*`).
/// - `Some(path)` → env vars + TOML file, merged.
pub fn load_config(config_file_name: Option<&Path>) -> Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed("IXL_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (IXL_*). \
             Check the section names: [backend.Elasticsearch] or [backend.InMemory], [index], [input], [runtime].",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (IXL_*). \
                 No file was provided, so this one is all on the environment."
            .to_string(),
    };

    config.extract().context(context_msg)
}
