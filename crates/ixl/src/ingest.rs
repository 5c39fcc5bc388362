//! 📥 Ingest: the bulk ingestion engine.
//!
//! 🎬 COLD OPEN - INT. BULK WINDOW - REPLICAS: 0, REFRESH: -1, VIBES: FAST
//!
//! The engine sits between a single upstream writer and a [`BulkChannel`]. It is `Closed`
//! until the first `add_*` call, which opens the channel and, for an index this run created,
//! turns replicas down to `0` and refresh off. `flush` drains everything in flight, puts the
//! settings back exactly as they were configured, and refreshes the index so readers (well,
//! the cutover) see every document.
//!
//! The engine never raises an item failure. It books it, flips the failed flag, and keeps
//! going. The cutover decision reads the flag later. 🦆

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::backends::{SearchBackend, SettingsUpdate};
use crate::common::{BulkOperation, IndexSettings, RunCounters, RunTally};
use crate::errors::IndexError;

pub mod backoff;
pub mod bulk_channel;
pub mod ledger;

pub use backoff::BackoffPolicy;
pub use bulk_channel::{BatchOutcome, BatchResult, BulkChannel, ChannelLimits};
pub use ledger::RunLedger;

// -- 🏎️ the bulk-window values for a freshly created index
const BULK_WINDOW_REPLICAS: u32 = 0;
const BULK_WINDOW_REFRESH: &str = "-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Closed,
    Open,
}

/// ⏳ Engine knobs that are not index settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IngestOptions {
    pub backoff: BackoffPolicy,
    pub flush_timeout: Duration,
}

impl Default for IngestOptions {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            flush_timeout: Duration::from_secs(120),
        }
    }
}

/// 📥 One writer, one index, one ledger.
#[derive(Debug)]
pub struct BulkIngestionEngine<B: SearchBackend> {
    backend: Arc<B>,
    index: String,
    settings: IndexSettings,
    index_created: bool,
    options: IngestOptions,
    ledger: Arc<RunLedger>,
    channel: Option<BulkChannel<B>>,
}

impl<B: SearchBackend> BulkIngestionEngine<B> {
    pub fn new(
        backend: Arc<B>,
        index: impl Into<String>,
        settings: IndexSettings,
        index_created: bool,
        options: IngestOptions,
    ) -> Self {
        Self {
            backend,
            index: index.into(),
            settings,
            index_created,
            options,
            ledger: Arc::new(RunLedger::new()),
            channel: None,
        }
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    pub fn channel_state(&self) -> ChannelState {
        if self.channel.is_some() {
            ChannelState::Open
        } else {
            ChannelState::Closed
        }
    }

    pub fn counters(&self) -> RunCounters {
        self.ledger.counters()
    }

    pub fn tally(&self) -> RunTally {
        self.ledger.tally()
    }

    /// 🔧 The bulk-window values for the settings we manage. Unmanaged ones stay `None`.
    fn bulk_window_update(&self) -> SettingsUpdate {
        SettingsUpdate {
            number_of_replicas: self.settings.number_of_replicas.map(|_| BULK_WINDOW_REPLICAS),
            refresh_interval: self
                .settings
                .refresh_interval
                .as_ref()
                .map(|_| BULK_WINDOW_REFRESH.to_string()),
        }
    }

    fn restore_update(&self) -> SettingsUpdate {
        SettingsUpdate {
            number_of_replicas: self.settings.number_of_replicas,
            refresh_interval: self.settings.refresh_interval.clone(),
        }
    }

    /// 🚰 Open the channel if it is not open yet. Idempotent.
    pub async fn create_bulk_channel(&mut self) -> Result<(), IndexError> {
        self.open_channel().await.map(|_| ())
    }

    async fn open_channel(&mut self) -> Result<&mut BulkChannel<B>, IndexError> {
        if self.channel.is_none() && self.index_created {
            let the_update = self.bulk_window_update();
            if !the_update.is_empty() {
                self.backend.update_index_settings(&self.index, &the_update).await?;
                debug!("🏎️ '{}' switched to bulk-window settings {:?}", self.index, the_update);
            }
        }
        Ok(self.channel.get_or_insert_with(|| {
            BulkChannel::open(
                Arc::clone(&self.backend),
                &self.index,
                ChannelLimits::from(&self.settings),
                self.options.backoff,
                Arc::clone(&self.ledger),
            )
        }))
    }

    /// 📥 Full document replace.
    pub async fn add_index(&mut self, id: &str, body: &str) -> Result<(), IndexError> {
        self.open_channel().await?.add(BulkOperation::index(id, body)).await;
        Ok(())
    }

    /// 🩹 Partial merge, sent as `{"doc": body}`.
    pub async fn add_update(&mut self, id: &str, body: &str) -> Result<(), IndexError> {
        self.open_channel().await?.add(BulkOperation::update(id, body)).await;
        Ok(())
    }

    /// 🗑️ Delete by id. A missing id is fine.
    pub async fn add_delete(&mut self, id: &str) -> Result<(), IndexError> {
        self.open_channel().await?.add(BulkOperation::delete(id)).await;
        Ok(())
    }

    /// 🏁 Drain, restore, refresh. Returns whether the drain completed within the timeout.
    pub async fn flush(&mut self) -> Result<bool, IndexError> {
        let Some(channel) = self.channel.take() else {
            self.backend.refresh_index(&self.index).await?;
            return Ok(true);
        };

        let drained = channel.close(self.options.flush_timeout).await;

        if self.index_created {
            let the_update = self.restore_update();
            if !the_update.is_empty() {
                self.backend.update_index_settings(&self.index, &the_update).await?;
                debug!("🔧 '{}' settings restored to {:?}", self.index, the_update);
            }
        }
        self.backend.refresh_index(&self.index).await?;

        let counters = self.ledger.counters();
        info!(
            "🏁 flushed '{}': {} succeeded, {} failed, {} deleted{}",
            self.index,
            counters.succeeded,
            counters.failed,
            counters.deleted,
            if drained { "" } else { " (partial drain)" }
        );
        Ok(drained)
    }
}
