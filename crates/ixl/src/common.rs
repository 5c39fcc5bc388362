//! 📦 Common data structures: the building blocks of an ixl run.
//!
//! 🎬 COLD OPEN - INT. DATA CENTER - 3:47 AM
//!
//! The reindex has been running for six hours. The alias still points at yesterday's
//! index, as it should. Readers are happy. Readers do not know that a brand new index is
//! filling up next door, replicas off, refresh off, like a house being built with the
//! lights out. When it is done, the alias moves in one step. Nobody sees the furniture
//! being carried in.
//!
//! These structs carry the facts every component agrees on: which index we write to
//! ([`IndexIdentity`]), how we tune the write path ([`IndexSettings`]), what we ask the
//! backend to do ([`BulkOperation`]) and how it went ([`RunCounters`]). 🦆

use serde::{Deserialize, Serialize};

/// 🎯 Where this run writes, and which alias (if any) gets the cutover at the end.
///
/// Created once per run by the naming policy. Immutable afterwards.
/// `alias_name == None` means "write straight into the concrete index, never switch".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexIdentity {
    pub alias_name: Option<String>,
    pub concrete_index_name: String,
}

impl IndexIdentity {
    pub fn direct(concrete_index_name: impl Into<String>) -> Self {
        Self {
            alias_name: None,
            concrete_index_name: concrete_index_name.into(),
        }
    }

    pub fn aliased(alias_name: impl Into<String>, concrete_index_name: impl Into<String>) -> Self {
        Self {
            alias_name: Some(alias_name.into()),
            concrete_index_name: concrete_index_name.into(),
        }
    }
}

/// 🔧 Write-path tuning for one index.
///
/// `number_of_replicas` and `refresh_interval` are the values the index lives with outside
/// the bulk window. A freshly created index gets `0` / `"-1"` while the bulk channel is open
/// and these values back once it closes. `None` means "not ours to manage": we neither lower
/// nor restore that setting.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct IndexSettings {
    #[serde(default = "default_number_of_replicas")]
    pub number_of_replicas: Option<u32>,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: Option<String>,
    /// 📦 operations per batch before the channel dispatches
    #[serde(default = "default_bulk_actions")]
    pub bulk_actions: usize,
    /// 🧵 concurrent in-flight batches. 0 = every batch runs inline, synchronously
    #[serde(default = "default_bulk_requests")]
    pub bulk_requests: usize,
    /// 📏 byte ceiling per batch. None = unbounded, only `bulk_actions` triggers a dispatch
    #[serde(default)]
    pub bulk_size_bytes: Option<u64>,
}

fn default_number_of_replicas() -> Option<u32> {
    Some(1)
}

fn default_refresh_interval() -> Option<String> {
    Some("30s".to_string())
}

fn default_bulk_actions() -> usize {
    1000
}

fn default_bulk_requests() -> usize {
    2
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            number_of_replicas: default_number_of_replicas(),
            refresh_interval: default_refresh_interval(),
            bulk_actions: default_bulk_actions(),
            bulk_requests: default_bulk_requests(),
            bulk_size_bytes: None,
        }
    }
}

/// 🎭 The three things we ever ask a bulk endpoint to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    /// 📥 full document replace
    #[default]
    Index,
    /// 🩹 partial document merge
    Update,
    /// 🗑️ delete by id, idempotent
    Delete,
}

impl OpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpKind::Index => "index",
            OpKind::Update => "update",
            OpKind::Delete => "delete",
        }
    }
}

// -- 📏 per-item framing overhead on the wire: action line braces, keys, newlines.
// -- Rounded to a number that is wrong in a consistent way, which is the best kind of wrong.
const REQUEST_OVERHEAD_BYTES: u64 = 50;

/// 📦 One queued write. `body` is opaque serialized JSON and is `None` only for deletes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkOperation {
    pub kind: OpKind,
    pub id: String,
    pub body: Option<String>,
}

impl BulkOperation {
    pub fn index(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Index,
            id: id.into(),
            body: Some(body.into()),
        }
    }

    pub fn update(id: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Update,
            id: id.into(),
            body: Some(body.into()),
        }
    }

    pub fn delete(id: impl Into<String>) -> Self {
        Self {
            kind: OpKind::Delete,
            id: id.into(),
            body: None,
        }
    }

    /// 📏 Rough wire size, used for the `bulk_size_bytes` dispatch trigger.
    pub fn estimated_bytes(&self) -> u64 {
        let body_len = self.body.as_ref().map_or(0, |b| b.len() as u64);
        self.id.len() as u64 + body_len + REQUEST_OVERHEAD_BYTES
    }
}

/// 📊 Run-level tallies. A snapshot; the live counters are atomics in the ingest ledger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounters {
    pub succeeded: u64,
    pub failed: u64,
    pub deleted: u64,
}

/// ⚖️ What the cutover decision gets to look at: the counters plus the sticky failed flag.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunTally {
    pub counters: RunCounters,
    pub failed: bool,
}
