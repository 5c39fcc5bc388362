//! 🚀 ixl: index lifecycle and bulk ingestion for Elasticsearch-style search backends.
//!
//! 🎬 *[narrator voice]* "It was supposed to be a simple reindex..."
//!
//! One run, top to bottom:
//! 1. 🏷️ [`naming`] decides the concrete index (and whether an alias gets cut over).
//! 2. 🔁 [`lifecycle`] creates or validates it, then waits for the cluster to be yellow.
//! 3. 📥 [`ingest`] streams records through the bulk channel and books every outcome.
//! 4. 🔀 [`lifecycle`] moves every alias in one atomic call, if and only if the run was clean.
//!
//! [`session::IngestSession`] is the facade that walks those steps; [`run`] drives it from an
//! [`app_config::AppConfig`] and an NDJSON record file. 🦆

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use tracing::{info, warn};

pub mod app_config;
pub mod backends;
pub mod common;
pub mod errors;
pub mod ingest;
pub mod lifecycle;
pub mod naming;
pub mod progress;
pub mod records;
pub mod session;

use crate::app_config::AppConfig;
use crate::backends::{Backend, SearchBackend};
use crate::common::OpKind;
use crate::naming::{Clock, SystemClock};
use crate::records::RecordSource;
use crate::session::{IngestSession, RunSummary};

pub use crate::errors::IndexError;

/// 🚀 Build the backend from config and run against the wall clock.
pub async fn run(config: AppConfig) -> Result<RunSummary> {
    let backend = Backend::from_config(&config.backend).context("💀 could not build the search backend")?;
    run_with_backend(Arc::new(backend), &config, &SystemClock).await
}

/// 🔧 The whole run against any backend. Tests hand in the in-memory one and a frozen clock.
pub async fn run_with_backend<B: SearchBackend>(
    backend: Arc<B>,
    config: &AppConfig,
    clock: &dyn Clock,
) -> Result<RunSummary> {
    let naming = config.index.naming_policy()?;
    let payload = config.index.load_payload().await?;
    let mut session = IngestSession::open(
        backend,
        &naming,
        clock,
        config.index.tuning.clone(),
        &payload,
        config.runtime.session_options(&config.index),
    )
    .await?;

    if let Err(err) = feed_records(&mut session, config).await {
        // -- 🧯 the bulk window must not outlive the run, even a broken one
        if let Err(abort_err) = session.abort().await {
            warn!("💀 could not restore the index after a failed run: {abort_err}");
        }
        return Err(err);
    }

    session.flush().await?;
    Ok(session.close(config.runtime.switch_alias).await?)
}

/// 📖 Stream the configured record file into the session, if there is one.
async fn feed_records<B: SearchBackend>(session: &mut IngestSession<B>, config: &AppConfig) -> Result<()> {
    if let Some(path) = &config.input.file {
        let mut source = RecordSource::open(path, config.runtime.progress).await?;
        let mut records_read = 0u64;
        while let Some(record) = source.next_record().await? {
            match (record.op, record.doc.as_deref()) {
                (OpKind::Delete, _) => session.add_delete(&record.id).await?,
                (OpKind::Index, Some(doc)) => session.add_index(&record.id, doc).await?,
                (OpKind::Update, Some(doc)) => session.add_update(&record.id, doc).await?,
                (op, None) => bail!("💀 '{}' record '{}' arrived without a document", op.as_str(), record.id),
            }
            records_read += 1;
        }
        info!("📖 read {records_read} record(s) from '{}'", path.display());
    } else {
        info!("📭 no input file configured; the run only opens and closes the index");
    }
    Ok(())
}
