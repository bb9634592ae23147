//! The journal writer thread.
//!
//! One thread performs every physical write and sync. Callers only enqueue
//! records and, when they need durability, wait on the force synchronizer.

use crate::config::JournalConfig;
use crate::error::JournalResult;
use crate::file::JournalFile;
use crate::force::ForceSynchronizer;
use crate::pool::BufferPool;
use crate::queue::{AppendQueue, PendingRecord};
use crate::record::now_millis;
use crate::tracked::TrackedTransactions;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const MIN_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(1);
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// State shared by the journal handle and its writer thread.
#[derive(Debug)]
pub(crate) struct WriterShared {
    pub(crate) queue: AppendQueue,
    pub(crate) sync: ForceSynchronizer,
    /// Structural lock: every open, write, rollover, grow, force and read of
    /// the file goes through it.
    pub(crate) file: Mutex<JournalFile>,
    pub(crate) tracked: TrackedTransactions,
    pub(crate) pool: BufferPool,
    pub(crate) config: JournalConfig,
    pub(crate) pending_forces: AtomicUsize,
    pub(crate) shutdown: AtomicBool,
    pub(crate) interrupted: AtomicBool,
    /// Set between a rollover and the successful re-append of unfinished
    /// transactions into the new generation.
    pub(crate) carry_pending: AtomicBool,
}

impl WriterShared {
    pub(crate) fn new(
        file: JournalFile,
        tracked: TrackedTransactions,
        last_sequence: u64,
        config: JournalConfig,
    ) -> Self {
        Self {
            queue: AppendQueue::new(last_sequence + 1),
            sync: ForceSynchronizer::new(last_sequence),
            file: Mutex::new(file),
            tracked,
            pool: BufferPool::new(config.concurrency, config.standard_buffer_size),
            config,
            pending_forces: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            carry_pending: AtomicBool::new(false),
        }
    }

    fn recycle(&self, batch: Vec<PendingRecord>) {
        for record in batch {
            self.pool.recycle(record.payload);
        }
    }
}

/// Sequence numbers written since the last successful force.
#[derive(Debug, Clone, Copy)]
struct Unforced {
    first: u64,
    last: u64,
}

/// Writer thread main loop.
pub(crate) fn run(shared: Arc<WriterShared>) {
    info!("journal writer started");
    let mut unforced: Option<Unforced> = None;
    let mut iterations: u32 = 0;
    let mut backoff = MIN_BACKOFF;
    let mut last_purge = Instant::now();

    loop {
        if shared.interrupted.load(Ordering::Acquire) {
            abandon(&shared, unforced.take());
            break;
        }

        let has_unforced = unforced.is_some();
        let batch = shared.queue.drain(shared.config.concurrency, || {
            let force_pending = shared.pending_forces.load(Ordering::Acquire) > 0;
            let stopping = shared.shutdown.load(Ordering::Acquire)
                || shared.interrupted.load(Ordering::Acquire);
            if stopping || (force_pending && has_unforced) {
                None
            } else {
                Some(shared.config.write_delay)
            }
        });

        if batch.is_empty() && last_purge.elapsed() >= PURGE_INTERVAL {
            shared
                .tracked
                .purge_expired(now_millis(), shared.config.max_transaction_lifetime);
            last_purge = Instant::now();
        }

        let mut fault = false;
        if let (Some(first), Some(last)) = (batch.first(), batch.last()) {
            let (first, last) = (first.sequence, last.sequence);
            match write_batch(&shared, &batch) {
                Ok(()) => {
                    unforced = Some(match unforced {
                        Some(range) => Unforced {
                            first: range.first,
                            last,
                        },
                        None => Unforced { first, last },
                    });
                }
                Err(err) => {
                    error!(first, last, error = %err, "failed to write journal batch");
                    shared.sync.mark_failed(first, last);
                    fault = true;
                }
            }
            shared.recycle(batch);
        }

        if unforced.is_some() {
            iterations += 1;
        }

        let shutting_down = shared.shutdown.load(Ordering::Acquire);
        let force_requested = shared.pending_forces.load(Ordering::Acquire) > 0;
        if force_requested
            || shutting_down
            || iterations >= shared.config.write_iterations_before_force
        {
            if let Some(range) = unforced.take() {
                iterations = 0;
                if let Err(err) = force_range(&shared, range) {
                    error!(error = %err, "failed to force journal");
                    fault = true;
                }
            }
        }

        if shutting_down && unforced.is_none() && shared.queue.is_empty() {
            break;
        }

        if fault {
            thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        } else {
            backoff = MIN_BACKOFF;
        }
    }
    info!("journal writer stopped");
}

fn force_range(shared: &WriterShared, range: Unforced) -> JournalResult<()> {
    let result = shared.file.lock().force();
    match result {
        Ok(()) => {
            debug!(first = range.first, last = range.last, "journal forced");
            shared
                .queue
                .forget_durable(|sequence| sequence <= range.last && !shared.sync.is_failed(sequence));
            shared.sync.mark_forced(range.last);
            Ok(())
        }
        Err(err) => {
            shared.sync.mark_failed(range.first, range.last);
            Err(err)
        }
    }
}

/// Fails everything still queued after an interrupt. Written records get
/// one last chance to be forced.
fn abandon(shared: &WriterShared, unforced: Option<Unforced>) {
    if let Some(range) = unforced {
        if let Err(err) = force_range(shared, range) {
            error!(error = %err, "failed to force journal while stopping");
        }
    }
    let remaining = shared.queue.drain_all();
    if let (Some(first), Some(last)) = (remaining.first(), remaining.last()) {
        warn!(
            records = remaining.len(),
            first = first.sequence,
            last = last.sequence,
            "journal writer interrupted with records still queued"
        );
        shared.sync.mark_failed(first.sequence, last.sequence);
    }
    shared.recycle(remaining);
}

fn write_batch(shared: &WriterShared, batch: &[PendingRecord]) -> JournalResult<()> {
    let mut file = shared.file.lock();
    let required: u64 = batch.iter().map(|r| r.framed_len() as u64).sum();
    if shared.carry_pending.load(Ordering::Acquire) || required > file.remaining_capacity() {
        roll_over(shared, &mut file, required)?;
    }
    file.write(batch)
}

/// Starts a new generation, re-appends every unfinished transaction and
/// grows the file until `required` more bytes fit comfortably.
///
/// While the re-append of the previous rollover is outstanding, no new
/// generation is started; the re-append is retried instead.
pub(crate) fn roll_over(
    shared: &WriterShared,
    file: &mut JournalFile,
    required: u64,
) -> JournalResult<()> {
    if shared.carry_pending.load(Ordering::Acquire) {
        warn!(position = file.position(), "retrying re-append of unfinished transactions");
    } else {
        file.rollover()?;
        shared.carry_pending.store(true, Ordering::Release);
    }
    carry_forward(shared, file, required)?;
    shared.carry_pending.store(false, Ordering::Release);
    Ok(())
}

fn carry_forward(shared: &WriterShared, file: &mut JournalFile, required: u64) -> JournalResult<()> {
    shared
        .tracked
        .purge_expired(now_millis(), shared.config.max_transaction_lifetime);

    let carried = shared
        .tracked
        .unfinished()
        .iter()
        .map(|record| PendingRecord::encode(&shared.pool, &record.rolled_over()))
        .collect::<JournalResult<Vec<_>>>()?;
    let carried_len: u64 = carried.iter().map(|r| r.framed_len() as u64).sum();

    let used = file.position() + carried_len;
    let mut target = file.size();
    while target.saturating_sub(used) < grow_threshold(target, shared.config.grow_offset, required) {
        target = (target as f64 * shared.config.grow_ratio).ceil() as u64;
    }
    if target > file.size() {
        if let Err(err) = file.grow(target) {
            warn!(
                size = file.size(),
                target,
                error = %err,
                "failed to grow journal, continuing at current size"
            );
        }
    }

    let result = file.write(&carried).and_then(|()| file.force());
    let count = carried.len();
    shared.recycle(carried);
    result?;
    info!(
        carried = count,
        size = file.size(),
        position = file.position(),
        "re-appended unfinished transactions after rollover"
    );
    Ok(())
}

fn grow_threshold(size: u64, grow_offset: f64, required: u64) -> u64 {
    ((size as f64 * grow_offset) as u64).max(required)
}

