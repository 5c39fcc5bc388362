//! 💀 Errors: the official registry of ways a run can die before it even gets going.
//!
//! 🎬 *[a run starts. the alias is nervous. the cluster is yellow-ish.]*
//!
//! Two families live here:
//! - [`IndexError`]: the fatal taxonomy. Raised to the caller, aborts the run. No retries,
//!   no heroics. The caller decides the exit code.
//! - [`BulkTransportError`]: a whole batch fell over below the item level. Never raised to
//!   the caller mid-stream. The ingestion engine absorbs it into the failed flag.
//!
//! Everything else that goes wrong inside a backend call rides in on `anyhow` and gets
//! wrapped as [`IndexError::Backend`]. 🦆

use std::time::Duration;

use thiserror::Error;

use crate::backends::HealthStatus;

/// 💀 The fatal taxonomy. If you are holding one of these, the run is over.
#[derive(Debug, Error)]
pub enum IndexError {
    /// 🔍 Update mode pointed at an index that is not there. We refuse to invent it.
    #[error("💀 update mode requested, but index '{index}' does not exist. Nothing was written.")]
    IndexNotFound { index: String },

    /// 🩺 The cluster never made it to the minimum health status before the timeout.
    #[error(
        "💀 cluster health stayed '{status}' for {timeout:?}; refusing to write into a cluster that cannot hold primaries"
    )]
    ClusterUnhealthy {
        status: HealthStatus,
        timeout: Duration,
    },

    /// 🎭 More than one concrete index claims the alias. Operator error, not ours to guess.
    #[error("💀 alias '{alias}' resolves to more than one candidate index: {indices:?}")]
    AliasAmbiguity { alias: String, indices: Vec<String> },

    /// 🏷️ The base name would be rejected by the backend anyway.
    #[error("💀 '{name}' is not a legal index name: {reason}")]
    InvalidIndexName { name: String, reason: &'static str },

    /// 📅 Time-window pattern contains letters we do not speak.
    #[error("💀 time window pattern '{pattern}' is not understood: {reason}")]
    InvalidTimeWindow { pattern: String, reason: String },

    /// 🔁 `switch_index` is a one-shot. The lifecycle already moved on.
    #[error("💀 the index lifecycle already finished ({state}); switch_index runs once per run")]
    LifecycleFinished { state: &'static str },

    /// 📡 Any other backend failure. The context chain tells the story.
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// 🌩️ An entire bulk batch failed at the transport layer.
///
/// `retryable` is the backend's opinion on whether trying again could help
/// (network hiccups, 429, 5xx). The bulk channel consults it before backing off.
#[derive(Debug, Clone, Error)]
#[error("bulk transport failure: {message}")]
pub struct BulkTransportError {
    pub message: String,
    pub retryable: bool,
}

impl BulkTransportError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}
