//! 🔁 Lifecycle: create the index, guard it, and hand the alias over when the run is done.
//!
//! 🎬 COLD OPEN - INT. SEARCH CLUSTER - MOMENTS BEFORE A REINDEX
//!
//! Readers are hitting `books`. `books` points at `books1`. A new run is about to fill
//! `books2`. Nobody must ever see `books2` half full. Nobody must ever see it empty.
//! Nobody must ever see it at all if the run failed.
//!
//! The manager walks one path per run:
//!
//! ```text
//! Uninitialized ──open──▶ Ensured ──switch_index──▶ Switched
//!                                          └──────▶ Skipped
//! ```
//!
//! `open` decides the name, creates or validates the index and waits for the cluster to be
//! at least yellow. `switch_index` is the one-shot cutover: every alias on the old index
//! moves to the new one in a single atomic `update_aliases` call. 🦆

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::backends::{AliasAction, AliasLookup, HealthStatus, SearchBackend};
use crate::common::{IndexIdentity, IndexSettings, RunTally};
use crate::errors::IndexError;
use crate::naming::{Clock, NamingPolicy};

/// 📜 The creation payloads. Opaque JSON we pass through, plus the two knobs we own.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexPayload {
    pub settings: Value,
    pub mappings: Value,
}

impl IndexPayload {
    /// 🔧 Fold the configured replica/refresh values into the settings payload, so the
    /// index is born with the exact values the bulk window later restores.
    pub fn with_managed_settings(&self, settings: &IndexSettings) -> Value {
        let mut the_settings = match &self.settings {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };

        let mut managed: Vec<(&str, Value)> = Vec::new();
        if let Some(replicas) = settings.number_of_replicas {
            managed.push(("number_of_replicas", Value::from(replicas)));
        }
        if let Some(refresh) = &settings.refresh_interval {
            managed.push(("refresh_interval", Value::from(refresh.as_str())));
        }

        for (key, value) in managed {
            // -- 🧹 one spelling per setting, or the backend complains about duplicates
            the_settings.remove(&format!("index.{key}"));
            match the_settings.get_mut("index").and_then(Value::as_object_mut) {
                Some(nested) => {
                    nested.insert(key.to_string(), value);
                    the_settings.remove(key);
                }
                None => {
                    the_settings.insert(key.to_string(), value);
                }
            }
        }
        Value::Object(the_settings)
    }
}

/// 🚦 Knobs for how `open` treats the target index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleOptions {
    /// 🩹 incremental run: the index must already exist, nothing gets created or deleted
    pub update_mode: bool,
    /// 🗑️ drop and recreate even when the index exists
    pub delete_requested: bool,
    pub health_timeout: Duration,
}

impl Default for LifecycleOptions {
    fn default() -> Self {
        Self {
            update_mode: false,
            delete_requested: false,
            health_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Ensured,
    Switched,
    Skipped,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Ensured => "ensured",
            LifecycleState::Switched => "switched",
            LifecycleState::Skipped => "skipped",
        }
    }
}

/// 🙅 Why the cutover did not happen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// 💀 at least one item or batch failed
    RunFailed,
    /// 🫥 nothing was written, and an empty index must never go live
    NothingSucceeded,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::RunFailed => f.write_str("the run recorded failures"),
            SkipReason::NothingSucceeded => f.write_str("no document was written successfully"),
        }
    }
}

/// 🏁 What `close` reports about the alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwitchOutcome {
    Switched {
        alias: String,
        old_index: Option<String>,
        new_index: String,
        /// 🏷️ every alias that moved, the main one included
        aliases: Vec<String>,
    },
    Skipped(SkipReason),
    /// 🎯 the alias already points at this run's index
    AlreadyCurrent,
    /// 🙈 the caller asked us not to switch
    NotRequested,
    /// 🚫 no alias configured, the run wrote straight into a concrete index
    NotApplicable,
}

impl fmt::Display for SwitchOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SwitchOutcome::Switched {
                alias,
                old_index,
                new_index,
                ..
            } => match old_index {
                Some(old) => write!(f, "switched '{alias}' from '{old}' to '{new_index}'"),
                None => write!(f, "switched '{alias}' to '{new_index}'"),
            },
            SwitchOutcome::Skipped(reason) => write!(f, "skipped ({reason})"),
            SwitchOutcome::AlreadyCurrent => f.write_str("already current"),
            SwitchOutcome::NotRequested => f.write_str("not requested"),
            SwitchOutcome::NotApplicable => f.write_str("not applicable (no alias)"),
        }
    }
}

/// 🗺️ Every alias that moves from the old index to the new one, with its filter.
#[derive(Debug, Clone, PartialEq)]
pub struct AliasSwitchPlan {
    pub old_index: Option<String>,
    pub new_index: String,
    pub alias_name: String,
    pub aliases: BTreeMap<String, Option<Value>>,
}

impl AliasSwitchPlan {
    /// 📜 Removes first, then adds. The backend applies them as one unit anyway.
    pub fn actions(&self) -> Vec<AliasAction> {
        let mut the_actions = Vec::with_capacity(self.aliases.len() * 2);
        if let Some(old) = &self.old_index {
            the_actions.extend(self.aliases.keys().map(|alias| AliasAction::Remove {
                index: old.clone(),
                alias: alias.clone(),
            }));
        }
        the_actions.extend(self.aliases.iter().map(|(alias, filter)| AliasAction::Add {
            index: self.new_index.clone(),
            alias: alias.clone(),
            filter: filter.clone(),
        }));
        the_actions
    }
}

/// 🔁 Owns the target index for one run. See the module docs for the state walk.
#[derive(Debug)]
pub struct IndexLifecycleManager<B: SearchBackend> {
    backend: Arc<B>,
    identity: IndexIdentity,
    settings: IndexSettings,
    options: LifecycleOptions,
    state: LifecycleState,
    index_created: bool,
}

impl<B: SearchBackend> IndexLifecycleManager<B> {
    /// 🚀 Resolve the name, ensure the index, wait for the cluster. Returns only when the
    /// index is ready to receive writes.
    pub async fn open(
        backend: Arc<B>,
        naming: &NamingPolicy,
        clock: &dyn Clock,
        settings: IndexSettings,
        payload: &IndexPayload,
        options: LifecycleOptions,
    ) -> Result<Self, IndexError> {
        let identity = naming.resolve(backend.as_ref(), clock).await?;
        info!(
            "🎯 this run writes into '{}'{}",
            identity.concrete_index_name,
            identity
                .alias_name
                .as_deref()
                .map(|alias| format!(" behind alias '{alias}'"))
                .unwrap_or_default()
        );

        let mut the_manager = Self {
            backend,
            identity,
            settings,
            options,
            state: LifecycleState::Uninitialized,
            index_created: false,
        };
        the_manager.ensure_index(payload).await?;
        the_manager.await_health().await?;
        the_manager.state = LifecycleState::Ensured;
        Ok(the_manager)
    }

    async fn ensure_index(&mut self, payload: &IndexPayload) -> Result<(), IndexError> {
        let index = self.identity.concrete_index_name.clone();
        let exists = self.backend.index_exists(&index).await?;

        if self.options.update_mode {
            if !exists {
                return Err(IndexError::IndexNotFound { index });
            }
            debug!("🩹 update mode: writing into existing index '{index}' as-is");
            return Ok(());
        }

        if !self.options.delete_requested && exists {
            debug!("🏠 index '{index}' already exists; leaving it untouched");
            return Ok(());
        }

        if exists {
            info!("🗑️ deleting index '{index}' before recreating it");
            self.backend.delete_index(&index).await?;
        }
        let the_settings = payload.with_managed_settings(&self.settings);
        self.backend
            .create_index(&index, &the_settings, &payload.mappings)
            .await?;
        self.index_created = true;
        self.backend.refresh_index(&index).await?;
        info!("🏗️ created index '{index}'");
        Ok(())
    }

    async fn await_health(&self) -> Result<(), IndexError> {
        let timeout = self.options.health_timeout;
        let the_report = self.backend.wait_for_health(HealthStatus::Yellow, timeout).await?;
        if the_report.timed_out {
            return Err(IndexError::ClusterUnhealthy {
                status: the_report.status,
                timeout,
            });
        }
        debug!("🩺 cluster health is {}", the_report.status);
        Ok(())
    }

    pub fn identity(&self) -> &IndexIdentity {
        &self.identity
    }

    pub fn settings(&self) -> &IndexSettings {
        &self.settings
    }

    pub fn index_created(&self) -> bool {
        self.index_created
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn backend(&self) -> &Arc<B> {
        &self.backend
    }

    /// 🔍 The one index an alias points at, if any. Two or more is operator error.
    pub async fn current_alias_target(&self, alias: &str) -> Result<Option<String>, IndexError> {
        let the_aliases = self.backend.get_aliases(AliasLookup::Alias(alias)).await?;
        let mut the_indices: Vec<String> = the_aliases.into_keys().collect();
        match the_indices.len() {
            0 => Ok(None),
            1 => Ok(the_indices.pop()),
            _ => Err(IndexError::AliasAmbiguity {
                alias: alias.to_string(),
                indices: the_indices,
            }),
        }
    }

    /// 🔀 The cutover. Runs at most once. Failed or empty runs never go live.
    pub async fn switch_index(&mut self, tally: &RunTally) -> Result<SwitchOutcome, IndexError> {
        if self.state != LifecycleState::Ensured {
            return Err(IndexError::LifecycleFinished {
                state: self.state.as_str(),
            });
        }
        let Some(alias) = self.identity.alias_name.clone() else {
            return Ok(SwitchOutcome::NotApplicable);
        };
        let new_index = self.identity.concrete_index_name.clone();

        if tally.failed {
            warn!(
                "🙅 not switching alias '{alias}' to '{new_index}': {} item(s) failed",
                tally.counters.failed
            );
            self.state = LifecycleState::Skipped;
            return Ok(SwitchOutcome::Skipped(SkipReason::RunFailed));
        }
        if tally.counters.succeeded == 0 {
            warn!("🙅 not switching alias '{alias}' to '{new_index}': nothing succeeded");
            self.state = LifecycleState::Skipped;
            return Ok(SwitchOutcome::Skipped(SkipReason::NothingSucceeded));
        }

        let old_index = self.current_alias_target(&alias).await?;
        if old_index.as_deref() == Some(new_index.as_str()) {
            info!("🎯 alias '{alias}' already points at '{new_index}'");
            self.state = LifecycleState::Switched;
            return Ok(SwitchOutcome::AlreadyCurrent);
        }

        let the_plan = self.plan_switch(&alias, old_index, &new_index).await?;
        self.backend.update_aliases(&the_plan.actions()).await?;

        let the_moved: Vec<String> = the_plan.aliases.keys().cloned().collect();
        info!(
            "🔀 alias cutover to '{}' done, moved {:?} off {:?}",
            new_index, the_moved, the_plan.old_index
        );
        self.state = LifecycleState::Switched;
        Ok(SwitchOutcome::Switched {
            alias,
            old_index: the_plan.old_index,
            new_index,
            aliases: the_moved,
        })
    }

    async fn plan_switch(
        &self,
        alias: &str,
        old_index: Option<String>,
        new_index: &str,
    ) -> Result<AliasSwitchPlan, IndexError> {
        // -- 👻 an alias pointing at a vanished index gets a plain add, nothing to remove
        let the_old = match old_index {
            Some(old) => self.backend.index_exists(&old).await?.then_some(old),
            None => None,
        };

        let mut the_aliases = BTreeMap::new();
        if let Some(old) = &the_old {
            let mut the_attached = self.backend.get_aliases(AliasLookup::Index(old)).await?;
            if let Some(attached) = the_attached.remove(old) {
                the_aliases.extend(attached);
            }
        }
        the_aliases.entry(alias.to_string()).or_insert(None);

        Ok(AliasSwitchPlan {
            old_index: the_old,
            new_index: new_index.to_string(),
            alias_name: alias.to_string(),
            aliases: the_aliases,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryBackend;
    use crate::common::RunCounters;
    use crate::naming::FixedClock;
    use anyhow::Result;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn march_first() -> FixedClock {
        FixedClock(
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0)
                .single()
                .expect("💀 a real date"),
        )
    }

    fn a_clean_tally(succeeded: u64) -> RunTally {
        RunTally {
            counters: RunCounters {
                succeeded,
                failed: 0,
                deleted: 0,
            },
            failed: false,
        }
    }

    async fn open_windowed(backend: &InMemoryBackend) -> Result<IndexLifecycleManager<InMemoryBackend>, IndexError> {
        let the_policy = NamingPolicy::new("books", Some("yyyyMMdd"), false)?;
        IndexLifecycleManager::open(
            Arc::new(backend.clone()),
            &the_policy,
            &march_first(),
            IndexSettings::default(),
            &IndexPayload {
                settings: json!({"index": {"number_of_shards": 1}}),
                mappings: json!({"properties": {"title": {"type": "text"}}}),
            },
            LifecycleOptions::default(),
        )
        .await
    }

    #[tokio::test]
    async fn the_one_where_two_aliases_move_house_in_one_trip() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        let the_filter = json!({"term": {"recent": true}});
        the_backend
            .seed_index(
                "books1",
                &[("books", None), ("books-recent", Some(the_filter.clone()))],
                &[],
            )
            .await;

        let mut the_manager = open_windowed(&the_backend).await?;
        assert!(the_manager.index_created());
        let the_outcome = the_manager.switch_index(&a_clean_tally(3)).await?;

        assert!(matches!(the_outcome, SwitchOutcome::Switched { .. }));
        let (the_calls, the_new_aliases, the_old_aliases) = the_backend
            .inspect(|state| {
                (
                    state.alias_updates.clone(),
                    state.indices["books20240301"].aliases.clone(),
                    state.indices["books1"].aliases.clone(),
                )
            })
            .await;
        assert_eq!(the_calls.len(), 1, "one atomic call, no more");
        assert_eq!(the_calls[0].len(), 4);
        assert_eq!(the_new_aliases.get("books-recent"), Some(&Some(the_filter)));
        assert_eq!(the_new_aliases.get("books"), Some(&None));
        assert!(the_old_aliases.is_empty());
        assert_eq!(the_manager.state(), LifecycleState::Switched);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_the_first_run_just_adds_the_alias() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        let mut the_manager = open_windowed(&the_backend).await?;
        let the_outcome = the_manager.switch_index(&a_clean_tally(1)).await?;

        assert_eq!(
            the_outcome,
            SwitchOutcome::Switched {
                alias: "books".to_string(),
                old_index: None,
                new_index: "books20240301".to_string(),
                aliases: vec!["books".to_string()],
            }
        );
        let the_calls = the_backend.inspect(|state| state.alias_updates.clone()).await;
        assert_eq!(
            the_calls,
            vec![vec![AliasAction::Add {
                index: "books20240301".to_string(),
                alias: "books".to_string(),
                filter: None,
            }]]
        );
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_empty_and_failed_runs_stay_in_the_dark() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        the_backend.seed_index("books1", &[("books", None)], &[]).await;

        let mut the_empty = open_windowed(&the_backend).await?;
        assert_eq!(
            the_empty.switch_index(&a_clean_tally(0)).await?,
            SwitchOutcome::Skipped(SkipReason::NothingSucceeded)
        );

        let the_policy = NamingPolicy::new("books", Some("yyyyMMdd"), false)?;
        let mut the_failed = IndexLifecycleManager::open(
            Arc::new(the_backend.clone()),
            &the_policy,
            &march_first(),
            IndexSettings::default(),
            &IndexPayload::default(),
            LifecycleOptions {
                delete_requested: true,
                ..LifecycleOptions::default()
            },
        )
        .await?;
        let the_tally = RunTally {
            counters: RunCounters {
                succeeded: 10,
                failed: 1,
                deleted: 0,
            },
            failed: true,
        };
        assert_eq!(
            the_failed.switch_index(&the_tally).await?,
            SwitchOutcome::Skipped(SkipReason::RunFailed)
        );

        let (the_calls, the_old_aliases) = the_backend
            .inspect(|state| (state.alias_updates.len(), state.indices["books1"].aliases.clone()))
            .await;
        assert_eq!(the_calls, 0);
        assert!(the_old_aliases.contains_key("books"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_switch_index_is_a_one_shot() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        let mut the_manager = open_windowed(&the_backend).await?;
        the_manager.switch_index(&a_clean_tally(1)).await?;
        let the_error = the_manager
            .switch_index(&a_clean_tally(1))
            .await
            .expect_err("💀 the second switch must be refused");
        assert!(matches!(the_error, IndexError::LifecycleFinished { state: "switched" }));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_update_mode_finds_nothing_to_update() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        let the_policy = NamingPolicy::new("books", None, true)?;
        let the_error = IndexLifecycleManager::open(
            Arc::new(the_backend.clone()),
            &the_policy,
            &march_first(),
            IndexSettings::default(),
            &IndexPayload::default(),
            LifecycleOptions {
                update_mode: true,
                ..LifecycleOptions::default()
            },
        )
        .await
        .expect_err("💀 update mode on a missing index must fail");

        assert!(matches!(the_error, IndexError::IndexNotFound { ref index } if index == "books"));
        let the_index_count = the_backend.inspect(|state| state.indices.len()).await;
        assert_eq!(the_index_count, 0, "nothing may be created in update mode");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_red_cluster_stops_the_show() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        the_backend.configure(|state| state.health = HealthStatus::Red).await;

        let the_error = open_windowed(&the_backend)
            .await
            .expect_err("💀 a red cluster must not be written to");
        assert!(matches!(
            the_error,
            IndexError::ClusterUnhealthy {
                status: HealthStatus::Red,
                ..
            }
        ));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_existing_indices_are_left_alone_unless_asked() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        the_backend.seed_index("books", &[], &[("A", r#"{"title":"Dune"}"#)]).await;
        let the_policy = NamingPolicy::new("books", None, false)?;

        let the_untouched = IndexLifecycleManager::open(
            Arc::new(the_backend.clone()),
            &the_policy,
            &march_first(),
            IndexSettings::default(),
            &IndexPayload::default(),
            LifecycleOptions::default(),
        )
        .await?;
        assert!(!the_untouched.index_created());
        assert_eq!(the_untouched.identity(), &IndexIdentity::direct("books"));
        assert_eq!(the_backend.inspect(|state| state.indices["books"].docs.len()).await, 1);

        let the_recreated = IndexLifecycleManager::open(
            Arc::new(the_backend.clone()),
            &the_policy,
            &march_first(),
            IndexSettings::default(),
            &IndexPayload::default(),
            LifecycleOptions {
                delete_requested: true,
                ..LifecycleOptions::default()
            },
        )
        .await?;
        assert!(the_recreated.index_created());
        let (the_docs, the_refreshes, the_replicas) = the_backend
            .inspect(|state| {
                let the_index = &state.indices["books"];
                (the_index.docs.len(), the_index.refresh_count, the_index.number_of_replicas)
            })
            .await;
        assert_eq!(the_docs, 0);
        assert_eq!(the_refreshes, 1, "a fresh index is refreshed right away");
        assert_eq!(the_replicas, 1);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_no_alias_means_no_switch() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        let the_policy = NamingPolicy::new("books", None, false)?;
        let mut the_manager = IndexLifecycleManager::open(
            Arc::new(the_backend.clone()),
            &the_policy,
            &march_first(),
            IndexSettings::default(),
            &IndexPayload::default(),
            LifecycleOptions::default(),
        )
        .await?;
        assert_eq!(
            the_manager.switch_index(&a_clean_tally(5)).await?,
            SwitchOutcome::NotApplicable
        );
        Ok(())
    }

    #[test]
    fn the_one_where_managed_settings_find_their_nest() {
        let the_settings = IndexSettings {
            number_of_replicas: Some(2),
            refresh_interval: Some("5s".to_string()),
            ..IndexSettings::default()
        };

        let the_nested = IndexPayload {
            settings: json!({"index": {"number_of_shards": 3, "number_of_replicas": 9}}),
            mappings: Value::Null,
        };
        assert_eq!(
            the_nested.with_managed_settings(&the_settings),
            json!({"index": {"number_of_shards": 3, "number_of_replicas": 2, "refresh_interval": "5s"}})
        );

        let the_flat = IndexPayload {
            settings: json!({"index.refresh_interval": "1s", "analysis": {}}),
            mappings: Value::Null,
        };
        assert_eq!(
            the_flat.with_managed_settings(&the_settings),
            json!({"analysis": {}, "number_of_replicas": 2, "refresh_interval": "5s"})
        );

        let the_unmanaged = IndexSettings {
            number_of_replicas: None,
            refresh_interval: None,
            ..IndexSettings::default()
        };
        assert_eq!(
            IndexPayload::default().with_managed_settings(&the_unmanaged),
            json!({})
        );
    }
}
