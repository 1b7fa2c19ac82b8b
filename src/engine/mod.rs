mod conflict;
mod dashboard;
mod detect;
mod error;
mod mutations;
mod queries;
mod store;
mod usage;

pub use conflict::{check_allocation, validate_allocation, Proposal};
pub use dashboard::{summarize, DashboardOptions};
pub use detect::{detect_conflicts, detect_in_store};
pub use error::EngineError;
pub use mutations::{AllocationRequest, SpanUpdate};
pub use store::{InMemoryStore, Store};
pub use usage::{summarize_usage, usage_report, usage_report_all, utilization_percentage};

use std::io;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, Mutex, OwnedMutexGuard, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        change: Change,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        changes: Vec<Change>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond Ok to all senders.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { change, response } => {
                let mut batch = vec![(change, response)];

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { change, response }) => {
                            batch.push((change, response));
                        }
                        Ok(other) => {
                            // Flush current batch first, then handle the non-append command
                            flush_and_respond(&mut wal, &mut batch);
                            handle_non_append(&mut wal, other);
                            break;
                        }
                        Err(_) => break, // channel empty, flush batch
                    }
                }

                if !batch.is_empty() {
                    flush_and_respond(&mut wal, &mut batch);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn flush_and_respond(wal: &mut Wal, batch: &mut Vec<(Change, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    respond_batch(batch, &result);
}

fn flush_batch(wal: &mut Wal, batch: &mut [(Change, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (change, _) in batch.iter() {
        if let Err(e) = wal.append_buffered(change) {
            append_err = Some(e);
            break;
        }
    }
    // Always flush, even on append error, so partially buffered bytes
    // don't leak into the next batch (callers were told this batch failed).
    let flush_err = wal.flush_sync().err();
    if let Some(e) = append_err {
        return Err(e);
    }
    if let Some(e) = flush_err {
        return Err(e);
    }
    Ok(())
}

fn respond_batch(batch: &mut Vec<(Change, oneshot::Sender<io::Result<()>>)>, result: &io::Result<()>) {
    for (_, tx) in batch.drain(..) {
        let r = match result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { changes, response } => {
            let result = Wal::write_compact_file(wal.path(), &changes)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { .. } => unreachable!(),
    }
}

/// Owns the store, the WAL writer and the write locks.
///
/// Writes to one resource are serialized: every mutation that can add or
/// move an allocation holds the lock of each resource and event it touches
/// from validation until the change is durable and applied. That is what
/// makes the validator's read-then-decide sound under concurrent requests.
pub struct Engine {
    pub store: InMemoryStore,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    /// Per-entity write locks, keyed by resource or event id.
    pub(super) locks: DashMap<Ulid, Arc<Mutex<()>>>,
    pub(super) next_seq: AtomicU64,
    /// Writers hold it shared from WAL append through apply; compaction
    /// holds it exclusively so its snapshot covers every acknowledged write.
    pub(super) wal_barrier: RwLock<()>,
    pub options: DashboardOptions,
}

impl Engine {
    pub fn new(wal_path: PathBuf, options: DashboardOptions) -> io::Result<Self> {
        let changes = Wal::replay(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let store = InMemoryStore::new();
        for change in &changes {
            store.apply(change);
        }
        let next_seq = AtomicU64::new(store.max_seq() + 1);

        Ok(Self {
            store,
            wal_tx,
            locks: DashMap::new(),
            next_seq,
            wal_barrier: RwLock::new(()),
            options,
        })
    }

    /// Write a record to the WAL via the background group-commit writer.
    async fn wal_append(&self, change: &Change) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                change: change.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// WAL-append + apply in one call.
    pub(super) async fn persist_and_apply(&self, change: &Change) -> Result<(), EngineError> {
        let _barrier = self.wal_barrier.read().await;
        self.wal_append(change).await?;
        self.store.apply(change);
        Ok(())
    }

    /// Lock every id in ascending order; duplicates are locked once.
    pub(super) async fn lock_all(&self, ids: &[Ulid]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids = ids.to_vec();
        ids.sort();
        ids.dedup();
        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let lock = self.locks.entry(id).or_default().value().clone();
            guards.push(lock.lock_owned().await);
        }
        guards
    }

    /// Drop the lock entry of a deleted entity unless someone else holds or
    /// awaits it. Call after the entity's guard is released.
    pub(super) fn forget_lock(&self, id: Ulid) {
        self.locks.remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Lock an event plus every resource it currently holds. Retries until
    /// the held set is stable under the lock.
    pub(super) async fn lock_event_and_resources(&self, event_id: Ulid) -> Vec<OwnedMutexGuard<()>> {
        loop {
            let mut ids = resource_ids_of(&self.store.allocations_for_event(event_id));
            ids.push(event_id);
            let guards = self.lock_all(&ids).await;

            let held = resource_ids_of(&self.store.allocations_for_event(event_id));
            if held.iter().all(|rid| ids.contains(rid)) {
                return guards;
            }
        }
    }
}

fn resource_ids_of(allocations: &[Allocation]) -> Vec<Ulid> {
    allocations.iter().map(|a| a.resource_id).collect()
}
