//! 🚰 The bulk channel: buffer, batch, dispatch, retry, settle.
//!
//! 🎬 *[the buffer fills. one thousand documents. a semaphore nods. a task is born.]*
//!
//! Operations pile up in a buffer until either `bulk_actions` of them are waiting or their
//! estimated size reaches `bulk_size_bytes`. Then the whole pile becomes one batch. Each batch
//! runs as its own task in a `JoinSet`, holding a semaphore permit, so at most
//! `bulk_requests` batches are in flight. With `bulk_requests = 0` there is no task at all:
//! the batch runs right there, inline, and the caller waits for it.
//!
//! Every batch ends as one [`BatchOutcome`]. The channel hands each outcome to
//! [`after_batch`], which books it in the [`RunLedger`]. No listener objects, no callbacks.
//!
//! 🧠 Knowledge graph: `BulkIngestionEngine` → `BulkChannel::open/add/close` →
//! `submit_batch` (retries under [`BackoffPolicy`]) → `SearchBackend::bulk`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, warn};

use super::backoff::BackoffPolicy;
use super::ledger::RunLedger;
use crate::backends::{BulkItemResult, SearchBackend};
use crate::common::{BulkOperation, IndexSettings};
use crate::errors::BulkTransportError;

/// 📐 When to cut a batch, and how many may fly at once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelLimits {
    pub bulk_actions: usize,
    pub bulk_requests: usize,
    pub bulk_size_bytes: Option<u64>,
}

impl From<&IndexSettings> for ChannelLimits {
    fn from(settings: &IndexSettings) -> Self {
        Self {
            // -- 🧱 a zero-sized batch would never fill; one op per batch is the floor
            bulk_actions: settings.bulk_actions.max(1),
            bulk_requests: settings.bulk_requests,
            bulk_size_bytes: settings.bulk_size_bytes,
        }
    }
}

#[derive(Debug)]
pub enum BatchResult {
    /// 📬 the backend answered, one result per submitted operation
    Completed(Vec<BulkItemResult>),
    /// 🌩️ the batch never got an item-level answer, even after retries
    TransportFailed(BulkTransportError),
}

/// 🏁 The single result of a single batch.
#[derive(Debug)]
pub struct BatchOutcome {
    pub batch_id: u64,
    pub item_count: usize,
    pub elapsed: Duration,
    pub result: BatchResult,
}

/// 📤 Logged right before a batch goes out.
pub fn before_batch(batch_id: u64, item_count: usize, byte_estimate: u64) {
    debug!(batch_id, item_count, byte_estimate, "📤 dispatching bulk batch");
}

/// 📥 Book a finished batch.
pub fn after_batch(ledger: &RunLedger, outcome: BatchOutcome) {
    let BatchOutcome {
        batch_id,
        item_count,
        elapsed,
        result,
    } = outcome;
    match result {
        BatchResult::Completed(items) => {
            debug!(batch_id, item_count, elapsed_ms = elapsed.as_millis() as u64, "📥 bulk batch completed");
            ledger.record_items(batch_id, &items);
        }
        BatchResult::TransportFailed(err) => {
            ledger.record_transport_failure(batch_id, item_count, &err);
        }
    }
}

// -- 🧟 a batch task that panicked has no outcome to book; its items are lost, so the run is failed
fn settle(ledger: &RunLedger, joined: Result<BatchOutcome, JoinError>) {
    match joined {
        Ok(outcome) => after_batch(ledger, outcome),
        Err(join_error) if join_error.is_cancelled() => {}
        Err(join_error) => {
            error!("💀 a bulk batch task died before reporting: {join_error}");
            ledger.record_transport_failure(0, 0, &BulkTransportError::fatal(join_error.to_string()));
        }
    }
}

/// 🔁 Send one batch, retrying what is worth retrying.
///
/// - retryable transport errors resend the whole (remaining) batch after the next delay
/// - items answered with 429 are resent on their own after the next delay
/// - when the delays run out, leftover 429s become item failures and a transport error
///   stays a transport error
pub async fn submit_batch<B: SearchBackend>(
    backend: Arc<B>,
    index: Arc<str>,
    batch_id: u64,
    operations: Vec<BulkOperation>,
    backoff: BackoffPolicy,
) -> BatchOutcome {
    let started = Instant::now();
    let item_count = operations.len();
    let mut the_delays = backoff.delays();
    let mut the_results: Vec<Option<BulkItemResult>> = vec![None; item_count];
    let mut the_pending: Vec<usize> = (0..item_count).collect();

    let result = loop {
        let the_attempt: Vec<BulkOperation> = the_pending.iter().map(|&slot| operations[slot].clone()).collect();
        match backend.bulk(&index, &the_attempt).await {
            Ok(items) if items.len() != the_attempt.len() => {
                break BatchResult::TransportFailed(BulkTransportError::fatal(format!(
                    "backend answered {} items for {} operations",
                    items.len(),
                    the_attempt.len()
                )));
            }
            Ok(items) => {
                let mut the_rejected = Vec::new();
                for (&slot, item) in the_pending.iter().zip(items) {
                    if item.is_rejected() {
                        the_rejected.push(slot);
                    }
                    the_results[slot] = Some(item);
                }
                if the_rejected.is_empty() {
                    break BatchResult::Completed(the_results.into_iter().flatten().collect());
                }
                match the_delays.next() {
                    Some(delay) => {
                        warn!(batch_id, rejected = the_rejected.len(), "🚦 backend pushed back; retrying in {delay:?}");
                        tokio::time::sleep(delay).await;
                        the_pending = the_rejected;
                    }
                    None => {
                        // -- 🚫 out of patience: whatever is still rejected counts as failed
                        let the_final: Vec<BulkItemResult> = the_results
                            .into_iter()
                            .flatten()
                            .map(|mut item| {
                                if item.is_rejected() && item.error.is_none() {
                                    item.error = Some("rejected with 429 and out of retries".to_string());
                                }
                                item
                            })
                            .collect();
                        break BatchResult::Completed(the_final);
                    }
                }
            }
            Err(err) if err.retryable => match the_delays.next() {
                Some(delay) => {
                    warn!(batch_id, "🌩️ {}; retrying in {delay:?}", err.message);
                    tokio::time::sleep(delay).await;
                }
                None => break give_up(the_results, &the_pending, &operations, err),
            },
            // -- 🪦 only a first-round transport failure leaves items uncounted; on a retry round the
            // earlier answers are booked and the stranded items count as failed
            Err(err) => break give_up(the_results, &the_pending, &operations, err),
        }
    };

    BatchOutcome {
        batch_id,
        item_count,
        elapsed: started.elapsed(),
        result,
    }
}

// -- 🪦 a transport error on a retry round still has earlier answers worth booking
fn give_up(
    results: Vec<Option<BulkItemResult>>,
    pending: &[usize],
    operations: &[BulkOperation],
    err: BulkTransportError,
) -> BatchResult {
    if pending.len() == operations.len() {
        return BatchResult::TransportFailed(err);
    }
    let mut the_results = results;
    for &slot in pending {
        let op = &operations[slot];
        the_results[slot] = Some(BulkItemResult::failed(op.kind, &op.id, 0, err.message.clone()));
    }
    BatchResult::Completed(the_results.into_iter().flatten().collect())
}

/// 🚰 One open bulk window against one index.
#[derive(Debug)]
pub struct BulkChannel<B: SearchBackend> {
    backend: Arc<B>,
    index: Arc<str>,
    limits: ChannelLimits,
    backoff: BackoffPolicy,
    ledger: Arc<RunLedger>,
    buffer: Vec<BulkOperation>,
    buffered_bytes: u64,
    next_batch_id: u64,
    permits: Arc<Semaphore>,
    in_flight: JoinSet<BatchOutcome>,
}

impl<B: SearchBackend> BulkChannel<B> {
    pub fn open(
        backend: Arc<B>,
        index: &str,
        limits: ChannelLimits,
        backoff: BackoffPolicy,
        ledger: Arc<RunLedger>,
    ) -> Self {
        debug!(
            "🚰 bulk channel open on '{index}': {} actions, {} concurrent, {:?} bytes",
            limits.bulk_actions, limits.bulk_requests, limits.bulk_size_bytes
        );
        Self {
            backend,
            index: Arc::from(index),
            limits,
            backoff,
            ledger,
            buffer: Vec::with_capacity(limits.bulk_actions),
            buffered_bytes: 0,
            next_batch_id: 0,
            permits: Arc::new(Semaphore::new(limits.bulk_requests.max(1))),
            in_flight: JoinSet::new(),
        }
    }

    /// 📥 Queue one operation, dispatching if a limit was reached.
    pub async fn add(&mut self, op: BulkOperation) {
        self.buffered_bytes += op.estimated_bytes();
        self.buffer.push(op);

        let full_by_count = self.buffer.len() >= self.limits.bulk_actions;
        let full_by_size = self
            .limits
            .bulk_size_bytes
            .is_some_and(|limit| self.buffered_bytes >= limit);
        if full_by_count || full_by_size {
            self.dispatch().await;
        }
    }

    pub fn batches_dispatched(&self) -> u64 {
        self.next_batch_id
    }

    async fn dispatch(&mut self) {
        self.reap_finished();
        if self.buffer.is_empty() {
            return;
        }
        let the_batch = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.limits.bulk_actions));
        let the_bytes = std::mem::take(&mut self.buffered_bytes);
        self.next_batch_id += 1;
        let batch_id = self.next_batch_id;
        before_batch(batch_id, the_batch.len(), the_bytes);

        let the_submission = submit_batch(
            Arc::clone(&self.backend),
            Arc::clone(&self.index),
            batch_id,
            the_batch,
            self.backoff,
        );

        if self.limits.bulk_requests == 0 {
            after_batch(&self.ledger, the_submission.await);
            return;
        }

        // -- 🎟️ no permit, no flight. Waiting here is the only backpressure the caller feels.
        match Arc::clone(&self.permits).acquire_owned().await {
            Ok(permit) => {
                self.in_flight.spawn(async move {
                    let outcome = the_submission.await;
                    drop(permit);
                    outcome
                });
            }
            Err(_) => after_batch(&self.ledger, the_submission.await),
        }
    }

    fn reap_finished(&mut self) {
        while let Some(joined) = self.in_flight.try_join_next() {
            settle(&self.ledger, joined);
        }
    }

    async fn drain(&mut self) {
        self.dispatch().await;
        while let Some(joined) = self.in_flight.join_next().await {
            settle(&self.ledger, joined);
        }
    }

    /// 🏁 Dispatch the remainder and wait for everything in flight, up to `timeout`.
    ///
    /// Returns `true` when every batch was booked. On timeout the stragglers are aborted,
    /// the run keeps its current failed flag, and the result is `false`.
    pub async fn close(mut self, timeout: Duration) -> bool {
        let drained = tokio::time::timeout(timeout, self.drain()).await.is_ok();
        if !drained {
            warn!(
                "⏳ bulk channel on '{}' drained only partially: {} batch(es) still in flight after {:?}, aborting them",
                self.index,
                self.in_flight.len(),
                timeout
            );
            self.in_flight.shutdown().await;
        }
        drained
    }
}
