//! 🎬 Session: one run, start to finish.
//!
//! An [`IngestSession`] pairs one [`IndexLifecycleManager`] with one [`BulkIngestionEngine`]
//! aimed at the same concrete index. `open` gets the index ready, `add_*` streams writes,
//! `flush` drains them, `close` decides whether the alias moves and returns a [`RunSummary`].
//!
//! 🧠 Knowledge graph: `run()` / the CLI → `IngestSession::open` → naming → lifecycle
//! → engine → `close` → `IndexLifecycleManager::switch_index`.

use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::backends::SearchBackend;
use crate::common::{IndexIdentity, IndexSettings, RunCounters};
use crate::errors::IndexError;
use crate::ingest::{BulkIngestionEngine, ChannelState, IngestOptions};
use crate::lifecycle::{IndexLifecycleManager, IndexPayload, LifecycleOptions, SwitchOutcome};
use crate::naming::{Clock, NamingPolicy};

/// 🎛️ Everything a session needs to know besides the backend and the name.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionOptions {
    pub lifecycle: LifecycleOptions,
    pub ingest: IngestOptions,
}

/// 🧾 The end-of-run report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub alias_name: Option<String>,
    pub concrete_index_name: String,
    pub index_created: bool,
    pub counters: RunCounters,
    pub failed: bool,
    /// ⏳ false when the last flush hit its timeout and aborted batches
    pub drained: bool,
    /// 🔀 human-readable switch outcome
    pub switch: String,
    #[serde(skip)]
    pub switch_outcome: SwitchOutcome,
}

/// 🎬 One run against one index.
#[derive(Debug)]
pub struct IngestSession<B: SearchBackend> {
    lifecycle: IndexLifecycleManager<B>,
    engine: BulkIngestionEngine<B>,
    drained: bool,
}

impl<B: SearchBackend> IngestSession<B> {
    /// 🚀 Resolve the name, ensure the index, wait for health. Nothing is written yet.
    pub async fn open(
        backend: Arc<B>,
        naming: &NamingPolicy,
        clock: &dyn Clock,
        settings: IndexSettings,
        payload: &IndexPayload,
        options: SessionOptions,
    ) -> Result<Self, IndexError> {
        let lifecycle = IndexLifecycleManager::open(
            Arc::clone(&backend),
            naming,
            clock,
            settings.clone(),
            payload,
            options.lifecycle,
        )
        .await?;
        let engine = BulkIngestionEngine::new(
            backend,
            lifecycle.identity().concrete_index_name.clone(),
            settings,
            lifecycle.index_created(),
            options.ingest,
        );
        Ok(Self {
            lifecycle,
            engine,
            drained: true,
        })
    }

    pub fn identity(&self) -> &IndexIdentity {
        self.lifecycle.identity()
    }

    pub fn index_created(&self) -> bool {
        self.lifecycle.index_created()
    }

    pub fn counters(&self) -> RunCounters {
        self.engine.counters()
    }

    pub async fn add_index(&mut self, id: &str, body: &str) -> Result<(), IndexError> {
        self.engine.add_index(id, body).await
    }

    pub async fn add_update(&mut self, id: &str, body: &str) -> Result<(), IndexError> {
        self.engine.add_update(id, body).await
    }

    pub async fn add_delete(&mut self, id: &str) -> Result<(), IndexError> {
        self.engine.add_delete(id).await
    }

    /// 🏁 Drain the bulk channel. Safe to call any number of times.
    pub async fn flush(&mut self) -> Result<bool, IndexError> {
        let drained = self.engine.flush().await?;
        self.drained &= drained;
        Ok(drained)
    }

    /// 🔍 Direct read from the target index, bypassing the alias.
    pub async fn get_document(&self, id: &str) -> Result<Option<String>, IndexError> {
        let index = &self.identity().concrete_index_name;
        Ok(self.lifecycle.backend().get_document(index, id).await?)
    }

    /// ✍️ Direct single-document write, outside the bulk channel and its counters.
    pub async fn index_document(&self, id: &str, body: &str) -> Result<(), IndexError> {
        let index = &self.identity().concrete_index_name;
        Ok(self.lifecycle.backend().index_document(index, id, body).await?)
    }

    /// 🧯 End a run that went wrong midway. Whatever is buffered or in flight is drained, the
    /// managed settings are restored and the index is refreshed. The alias never moves.
    pub async fn abort(mut self) -> Result<RunCounters, IndexError> {
        let index = self.identity().concrete_index_name.clone();
        warn!("🧯 aborting the run on '{index}'; the alias stays where it is");
        self.flush().await?;
        Ok(self.engine.counters())
    }

    /// 🎬 End the run. Pending writes are flushed first; then, if asked, the cutover.
    pub async fn close(mut self, switch_index: bool) -> Result<RunSummary, IndexError> {
        if self.engine.channel_state() == ChannelState::Open {
            self.flush().await?;
        }
        let tally = self.engine.tally();

        let switch_outcome = if !switch_index {
            SwitchOutcome::NotRequested
        } else {
            self.lifecycle.switch_index(&tally).await?
        };

        let identity = self.lifecycle.identity();
        info!(
            succeeded = tally.counters.succeeded,
            failed = tally.counters.failed,
            deleted = tally.counters.deleted,
            "🧾 run finished on '{}': alias switch {}",
            identity.concrete_index_name,
            switch_outcome
        );

        Ok(RunSummary {
            alias_name: identity.alias_name.clone(),
            concrete_index_name: identity.concrete_index_name.clone(),
            index_created: self.lifecycle.index_created(),
            counters: tally.counters,
            failed: tally.failed,
            drained: self.drained,
            switch: switch_outcome.to_string(),
            switch_outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::InMemoryBackend;
    use crate::ingest::BackoffPolicy;
    use crate::lifecycle::SkipReason;
    use crate::naming::FixedClock;
    use anyhow::Result;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn march_first() -> FixedClock {
        FixedClock(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0)
                .single()
                .expect("💀 a real date"),
        )
    }

    async fn open_books(backend: &InMemoryBackend) -> Result<IngestSession<InMemoryBackend>> {
        let the_policy = NamingPolicy::new("books", Some("yyyyMMdd"), false)?;
        Ok(IngestSession::open(
            Arc::new(backend.clone()),
            &the_policy,
            &march_first(),
            IndexSettings {
                bulk_actions: 2,
                ..IndexSettings::default()
            },
            &IndexPayload {
                settings: json!({}),
                mappings: json!({"properties": {"title": {"type": "text"}}}),
            },
            SessionOptions::default(),
        )
        .await?)
    }

    async fn alias_target(backend: &InMemoryBackend) -> Vec<String> {
        backend
            .inspect(|state| {
                state
                    .indices
                    .iter()
                    .filter(|(_, index)| index.aliases.contains_key("books"))
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .await
    }

    #[tokio::test]
    async fn the_one_where_a_clean_run_goes_live() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        the_backend.seed_index("books1", &[("books", None)], &[("old", "{}")]).await;

        let mut the_session = open_books(&the_backend).await?;
        for (id, title) in [("A", "Dune"), ("B", "Emma"), ("C", "Ubik")] {
            the_session.add_index(id, &json!({ "title": title }).to_string()).await?;
        }
        assert!(the_session.flush().await?);
        let the_summary = the_session.close(true).await?;

        assert_eq!(the_summary.counters.succeeded, 3);
        assert!(!the_summary.failed);
        assert!(matches!(the_summary.switch_outcome, SwitchOutcome::Switched { .. }));
        assert_eq!(alias_target(&the_backend).await, vec!["books20240301".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_empty_run_never_goes_live() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        the_backend.seed_index("books1", &[("books", None)], &[]).await;

        let the_session = open_books(&the_backend).await?;
        let the_summary = the_session.close(true).await?;

        assert_eq!(the_summary.switch_outcome, SwitchOutcome::Skipped(SkipReason::NothingSucceeded));
        assert_eq!(alias_target(&the_backend).await, vec!["books1".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_single_failure_keeps_readers_on_the_old_index() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        the_backend.seed_index("books1", &[("books", None)], &[]).await;
        the_backend
            .configure(|state| {
                state.failing_ids.insert("C".to_string());
            })
            .await;

        let mut the_session = open_books(&the_backend).await?;
        for id in ["A", "B", "C", "D"] {
            the_session.add_index(id, "{}").await?;
        }
        // -- 🙈 no explicit flush; close drains on its own
        let the_summary = the_session.close(true).await?;

        assert_eq!(the_summary.counters.succeeded, 3);
        assert_eq!(the_summary.counters.failed, 1);
        assert_eq!(the_summary.switch_outcome, SwitchOutcome::Skipped(SkipReason::RunFailed));
        let (the_alias_calls, the_docs) = the_backend
            .inspect(|state| (state.alias_updates.len(), state.indices["books20240301"].docs.len()))
            .await;
        assert_eq!(the_alias_calls, 0);
        assert_eq!(the_docs, 3);
        assert_eq!(alias_target(&the_backend).await, vec!["books1".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_delete_that_never_landed_keeps_the_alias_home() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        the_backend.seed_index("books1", &[("books", None)], &[]).await;
        let the_policy = NamingPolicy::new("books", Some("yyyyMMdd"), false)?;
        let mut the_session = IngestSession::open(
            Arc::new(the_backend.clone()),
            &the_policy,
            &march_first(),
            IndexSettings {
                bulk_actions: 1,
                bulk_requests: 0,
                ..IndexSettings::default()
            },
            &IndexPayload::default(),
            SessionOptions {
                ingest: IngestOptions {
                    backoff: BackoffPolicy {
                        initial_delay_ms: 1,
                        multiplier: 2.0,
                        max_delay_ms: 2,
                        max_retries: 1,
                    },
                    ..IngestOptions::default()
                },
                ..SessionOptions::default()
            },
        )
        .await?;

        the_session.add_index("A", "{}").await?;
        the_backend.configure(|state| state.rejections_remaining = 100).await;
        the_session.add_delete("B").await?;
        let the_summary = the_session.close(true).await?;

        assert_eq!(
            the_summary.counters,
            RunCounters {
                succeeded: 1,
                failed: 1,
                deleted: 0,
            }
        );
        assert!(the_summary.failed);
        assert_eq!(the_summary.switch_outcome, SwitchOutcome::Skipped(SkipReason::RunFailed));
        assert_eq!(alias_target(&the_backend).await, vec!["books1".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_abort_drains_and_restores_but_never_switches() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        the_backend.seed_index("books1", &[("books", None)], &[]).await;

        let mut the_session = open_books(&the_backend).await?;
        the_session.add_index("A", "{}").await?;
        let the_lowered = the_backend
            .inspect(|state| state.indices["books20240301"].number_of_replicas)
            .await;
        assert_eq!(the_lowered, 0);

        let the_counters = the_session.abort().await?;
        assert_eq!(the_counters.succeeded, 1);

        let (the_replicas, the_refresh, the_alias_calls) = the_backend
            .inspect(|state| {
                let the_index = &state.indices["books20240301"];
                (
                    the_index.number_of_replicas,
                    the_index.refresh_interval.clone(),
                    state.alias_updates.len(),
                )
            })
            .await;
        assert_eq!((the_replicas, the_refresh.as_str()), (1, "30s"));
        assert_eq!(the_alias_calls, 0);
        assert_eq!(alias_target(&the_backend).await, vec!["books1".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_nobody_asked_for_a_switch() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        let mut the_session = open_books(&the_backend).await?;
        the_session.add_index("A", "{}").await?;
        let the_summary = the_session.close(false).await?;

        assert_eq!(the_summary.switch_outcome, SwitchOutcome::NotRequested);
        assert_eq!(the_summary.switch, "not requested");
        assert!(alias_target(&the_backend).await.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_single_documents_skip_the_bulk_line() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        let the_session = open_books(&the_backend).await?;

        the_session.index_document("solo", r#"{"title":"Solaris"}"#).await?;
        assert_eq!(
            the_session.get_document("solo").await?.as_deref(),
            Some(r#"{"title":"Solaris"}"#)
        );
        assert_eq!(the_session.get_document("nobody").await?, None);
        assert_eq!(the_session.counters(), RunCounters::default());
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_update_mode_patches_in_place() -> Result<()> {
        let the_backend = InMemoryBackend::new();
        the_backend
            .seed_index("books3", &[("books", None)], &[("A", r#"{"title":"Dune","year":1964}"#)])
            .await;
        let the_policy = NamingPolicy::new("books", None, true)?;
        let mut the_session = IngestSession::open(
            Arc::new(the_backend.clone()),
            &the_policy,
            &march_first(),
            IndexSettings::default(),
            &IndexPayload::default(),
            SessionOptions {
                lifecycle: LifecycleOptions {
                    update_mode: true,
                    ..LifecycleOptions::default()
                },
                ..SessionOptions::default()
            },
        )
        .await?;
        assert!(!the_session.index_created());

        the_session.add_update("A", r#"{"year":1965}"#).await?;
        the_session.add_delete("gone").await?;
        let the_summary = the_session.close(true).await?;

        assert_eq!(the_summary.concrete_index_name, "books3");
        assert_eq!(the_summary.switch_outcome, SwitchOutcome::AlreadyCurrent);
        assert_eq!(the_summary.counters.deleted, 1);
        let the_doc = the_backend
            .inspect(|state| state.indices["books3"].docs["A"].clone())
            .await;
        let the_doc: serde_json::Value = serde_json::from_str(&the_doc)?;
        assert_eq!(the_doc, json!({"title": "Dune", "year": 1965}));
        Ok(())
    }
}
