//! Sequenced append queue between logging threads and the writer thread.

use crate::error::JournalResult;
use crate::pool::BufferPool;
use crate::record::{compute_crc32, JournalRecord, RECORD_OVERHEAD};
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::thread::{self, ThreadId};
use std::time::Duration;

/// An encoded record waiting to be written.
#[derive(Debug)]
pub struct PendingRecord {
    pub(crate) payload: Vec<u8>,
    pub(crate) crc: u32,
    pub(crate) sequence: u64,
}

impl PendingRecord {
    /// Encodes `record` into a buffer borrowed from `pool`.
    pub(crate) fn encode(pool: &BufferPool, record: &JournalRecord) -> JournalResult<Self> {
        let mut payload = pool.poll(record.encoded_len());
        if let Err(err) = record.encode_payload_into(&mut payload) {
            pool.recycle(payload);
            return Err(err);
        }
        let crc = compute_crc32(&payload);
        Ok(Self {
            payload,
            crc,
            sequence: record.sequence(),
        })
    }

    /// Sequence number of the record.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Bytes the record takes in the journal file, framing included.
    #[must_use]
    pub fn framed_len(&self) -> usize {
        self.payload.len() + RECORD_OVERHEAD
    }
}

#[derive(Debug)]
struct QueueState {
    records: VecDeque<PendingRecord>,
    next_sequence: u64,
}

/// FIFO of pending records with monotonically increasing sequence numbers.
///
/// The sequence is assigned and the record encoded while the queue lock is
/// held, so queue order, sequence order and write order are the same. The
/// queue also remembers the last sequence each thread enqueued, which is what
/// that thread waits for when it forces.
#[derive(Debug)]
pub struct AppendQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    latest_by_thread: DashMap<ThreadId, u64>,
}

impl AppendQueue {
    /// Creates an empty queue whose first record gets `first_sequence`.
    #[must_use]
    pub fn new(first_sequence: u64) -> Self {
        Self {
            state: Mutex::new(QueueState {
                records: VecDeque::new(),
                next_sequence: first_sequence,
            }),
            available: Condvar::new(),
            latest_by_thread: DashMap::new(),
        }
    }

    /// Assigns the next sequence number and enqueues what `build` encodes
    /// for it.
    ///
    /// `build` runs under the queue lock and returns the payload and its CRC.
    /// If it fails, the sequence number is not consumed.
    ///
    /// # Errors
    ///
    /// Returns whatever `build` returns.
    pub fn enqueue<F>(&self, build: F) -> JournalResult<u64>
    where
        F: FnOnce(u64) -> JournalResult<(Vec<u8>, u32)>,
    {
        let sequence = {
            let mut state = self.state.lock();
            let sequence = state.next_sequence;
            let (payload, crc) = build(sequence)?;
            state.next_sequence += 1;
            state.records.push_back(PendingRecord {
                payload,
                crc,
                sequence,
            });
            self.available.notify_one();
            sequence
        };
        self.latest_by_thread.insert(thread::current().id(), sequence);
        Ok(sequence)
    }

    /// Removes up to `max` records from the head of the queue.
    ///
    /// When the queue is empty and `wait` (evaluated under the queue lock)
    /// returns a duration, blocks up to that long for a record or a
    /// [`wake`](Self::wake).
    pub fn drain<W>(&self, max: usize, wait: W) -> Vec<PendingRecord>
    where
        W: FnOnce() -> Option<Duration>,
    {
        let mut state = self.state.lock();
        if state.records.is_empty() {
            if let Some(timeout) = wait() {
                self.available.wait_for(&mut state, timeout);
            }
        }
        let count = state.records.len().min(max);
        state.records.drain(..count).collect()
    }

    /// Removes every queued record.
    pub fn drain_all(&self) -> Vec<PendingRecord> {
        self.state.lock().records.drain(..).collect()
    }

    /// Wakes a writer blocked in [`drain`](Self::drain).
    pub fn wake(&self) {
        let _state = self.state.lock();
        self.available.notify_all();
    }

    /// Takes the latest sequence enqueued by the calling thread, if any.
    pub fn take_thread_latest(&self) -> Option<u64> {
        self.latest_by_thread
            .remove(&thread::current().id())
            .map(|(_, sequence)| sequence)
    }

    /// Forgets the latest sequence of every thread for which `durable`
    /// holds. A later force by such a thread has nothing left to wait for.
    pub fn forget_durable<F>(&self, durable: F)
    where
        F: Fn(u64) -> bool,
    {
        self.latest_by_thread.retain(|_, sequence| !durable(*sequence));
    }

    /// Number of threads with a sequence to force.
    #[must_use]
    pub fn waiting_threads(&self) -> usize {
        self.latest_by_thread.len()
    }

    /// Number of queued records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// Returns true if nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }

    /// Sequence number the next record will get.
    #[must_use]
    pub fn next_sequence(&self) -> u64 {
        self.state.lock().next_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JournalError;
    use std::sync::Arc;
    use std::time::Instant;

    fn payload(sequence: u64) -> JournalResult<(Vec<u8>, u32)> {
        let bytes = sequence.to_le_bytes().to_vec();
        let crc = compute_crc32(&bytes);
        Ok((bytes, crc))
    }

    #[test]
    fn sequences_follow_queue_order() {
        let queue = AppendQueue::new(5);
        assert_eq!(queue.enqueue(payload).unwrap(), 5);
        assert_eq!(queue.enqueue(payload).unwrap(), 6);
        assert_eq!(queue.next_sequence(), 7);

        let drained = queue.drain(10, || None);
        let sequences: Vec<u64> = drained.iter().map(PendingRecord::sequence).collect();
        assert_eq!(sequences, vec![5, 6]);
        assert!(queue.is_empty());
    }

    #[test]
    fn failed_build_does_not_consume_sequence() {
        let queue = AppendQueue::new(1);
        let result = queue.enqueue(|_| Err(JournalError::invalid_argument("too big")));
        assert!(result.is_err());
        assert_eq!(queue.enqueue(payload).unwrap(), 1);
    }

    #[test]
    fn drain_respects_batch_limit() {
        let queue = AppendQueue::new(1);
        for _ in 0..5 {
            queue.enqueue(payload).unwrap();
        }
        assert_eq!(queue.drain(3, || None).len(), 3);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.drain_all().len(), 2);
    }

    #[test]
    fn thread_latest_is_per_thread_and_taken_once() {
        let queue = Arc::new(AppendQueue::new(1));
        queue.enqueue(payload).unwrap();

        let other = Arc::clone(&queue);
        std::thread::spawn(move || {
            other.enqueue(payload).unwrap();
            assert_eq!(other.take_thread_latest(), Some(2));
        })
        .join()
        .unwrap();

        queue.enqueue(payload).unwrap();
        assert_eq!(queue.take_thread_latest(), Some(3));
        assert_eq!(queue.take_thread_latest(), None);
    }

    #[test]
    fn durable_thread_sequences_are_forgotten() {
        let queue = Arc::new(AppendQueue::new(1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let queue = Arc::clone(&queue);
                std::thread::spawn(move || {
                    queue.enqueue(payload).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        queue.enqueue(payload).unwrap();
        assert_eq!(queue.waiting_threads(), 9);

        queue.forget_durable(|sequence| sequence <= 8);
        assert_eq!(queue.waiting_threads(), 1);
        assert_eq!(queue.take_thread_latest(), Some(9));
        assert_eq!(queue.waiting_threads(), 0);
    }

    #[test]
    fn drain_waits_for_enqueue() {
        let queue = Arc::new(AppendQueue::new(1));
        let producer = Arc::clone(&queue);
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.enqueue(payload).unwrap();
        });

        let start = Instant::now();
        let mut drained = queue.drain(10, || Some(Duration::from_secs(5)));
        if drained.is_empty() {
            // Spurious wake-up; the record is on its way.
            drained = queue.drain(10, || Some(Duration::from_secs(5)));
        }
        handle.join().unwrap();
        assert_eq!(drained.len(), 1);
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
