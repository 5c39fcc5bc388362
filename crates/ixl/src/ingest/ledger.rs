//! 📒 The run ledger: atomic counters plus the one flag that vetoes the cutover.
//!
//! Batches finish on whatever task they ran on; every one of them writes here. Counters only
//! go up. The failed flag only goes from `false` to `true`. Nothing ever resets mid-run.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tracing::{error, warn};

use crate::backends::BulkItemResult;
use crate::common::{OpKind, RunCounters, RunTally};
use crate::errors::BulkTransportError;

#[derive(Debug, Default)]
pub struct RunLedger {
    succeeded: AtomicU64,
    failed: AtomicU64,
    deleted: AtomicU64,
    failed_flag: AtomicBool,
}

impl RunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// 📬 Classify every item of a completed batch.
    ///
    /// A delete of an absent id arrives without an error and lands in `deleted`. A delete that
    /// carries an error (out of 429 retries, version conflict, blocked index) is a failure.
    pub fn record_items(&self, batch_id: u64, items: &[BulkItemResult]) {
        for (item_index, item) in items.iter().enumerate() {
            match (item.kind, &item.error) {
                (OpKind::Delete, None) => {
                    self.deleted.fetch_add(1, Ordering::Relaxed);
                }
                (_, None) => {
                    self.succeeded.fetch_add(1, Ordering::Relaxed);
                }
                (_, Some(message)) => {
                    self.failed.fetch_add(1, Ordering::Relaxed);
                    self.failed_flag.store(true, Ordering::Release);
                    warn!(batch_id, item_index, id = %item.id, "💀 bulk item failed: {message}");
                }
            }
        }
    }

    /// 🌩️ The whole batch died below the item level. Nothing gets counted, the run is failed.
    pub fn record_transport_failure(&self, batch_id: u64, item_count: usize, err: &BulkTransportError) {
        self.failed_flag.store(true, Ordering::Release);
        error!(batch_id, item_count, "🌩️ bulk batch lost to a transport failure: {}", err.message);
    }

    pub fn is_failed(&self) -> bool {
        self.failed_flag.load(Ordering::Acquire)
    }

    pub fn counters(&self) -> RunCounters {
        RunCounters {
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
        }
    }

    pub fn tally(&self) -> RunTally {
        RunTally {
            counters: self.counters(),
            failed: self.is_failed(),
        }
    }
}
