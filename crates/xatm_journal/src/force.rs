//! Force synchronizer: releases threads waiting for their records to be
//! durable.

use parking_lot::{Condvar, Mutex};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Result of waiting for a sequence number to be forced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForceOutcome {
    /// The record is durable.
    Forced,
    /// The batch holding the record failed to be written or synced.
    Failed,
    /// The journal closed before the record was forced.
    Interrupted,
}

/// Inclusive range of sequence numbers whose force failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedRange {
    /// First failed sequence.
    pub first: u64,
    /// Last failed sequence.
    pub last: u64,
}

impl FailedRange {
    /// Returns true if `sequence` lies in the range.
    #[must_use]
    pub fn contains(&self, sequence: u64) -> bool {
        self.first <= sequence && sequence <= self.last
    }
}

#[derive(Debug, Default)]
struct SyncState {
    /// Coalesced failed ranges keyed by their first sequence.
    failed: BTreeMap<u64, u64>,
    interrupted: bool,
}

/// Tracks the forced watermark and failed ranges, and wakes waiters when
/// either changes.
///
/// A sequence inside a failed range is reported as failed even if the
/// watermark has moved past it.
#[derive(Debug)]
pub struct ForceSynchronizer {
    forced: AtomicU64,
    state: Mutex<SyncState>,
    changed: Condvar,
}

impl ForceSynchronizer {
    /// Creates a synchronizer whose watermark starts at `forced`.
    #[must_use]
    pub fn new(forced: u64) -> Self {
        Self {
            forced: AtomicU64::new(forced),
            state: Mutex::new(SyncState::default()),
            changed: Condvar::new(),
        }
    }

    /// Highest sequence known to be durable.
    #[must_use]
    pub fn forced(&self) -> u64 {
        self.forced.load(Ordering::Acquire)
    }

    /// Blocks until `sequence` is forced, falls in a failed range, or the
    /// synchronizer is interrupted.
    pub fn wait_for(&self, sequence: u64) -> ForceOutcome {
        let mut state = self.state.lock();
        loop {
            if Self::failed_contains(&state.failed, sequence) {
                return ForceOutcome::Failed;
            }
            if self.forced() >= sequence {
                return ForceOutcome::Forced;
            }
            if state.interrupted {
                return ForceOutcome::Interrupted;
            }
            self.changed.wait(&mut state);
        }
    }

    /// Advances the watermark to `sequence`. Never moves it backwards.
    pub fn mark_forced(&self, sequence: u64) {
        self.forced.fetch_max(sequence, Ordering::AcqRel);
        let _state = self.state.lock();
        self.changed.notify_all();
    }

    /// Records `[first, last]` as failed, merging with overlapping or
    /// adjacent ranges.
    pub fn mark_failed(&self, first: u64, last: u64) {
        let (mut first, mut last) = (first.min(last), first.max(last));
        let mut state = self.state.lock();
        let failed = &mut state.failed;

        if let Some((&prev_first, &prev_last)) = failed.range(..=first).next_back() {
            if prev_last.saturating_add(1) >= first {
                first = prev_first;
                last = last.max(prev_last);
                failed.remove(&prev_first);
            }
        }
        while let Some((&next_first, &next_last)) = failed.range(first..).next() {
            if next_first > last.saturating_add(1) {
                break;
            }
            last = last.max(next_last);
            failed.remove(&next_first);
        }
        failed.insert(first, last);

        self.changed.notify_all();
    }

    /// Releases every waiter with [`ForceOutcome::Interrupted`] unless its
    /// record is already forced or failed.
    pub fn interrupt(&self) {
        let mut state = self.state.lock();
        state.interrupted = true;
        self.changed.notify_all();
    }

    /// Returns true if `sequence` lies in a failed range.
    #[must_use]
    pub fn is_failed(&self, sequence: u64) -> bool {
        Self::failed_contains(&self.state.lock().failed, sequence)
    }

    /// Snapshot of the failed ranges in ascending order.
    #[must_use]
    pub fn failed_ranges(&self) -> Vec<FailedRange> {
        self.state
            .lock()
            .failed
            .iter()
            .map(|(&first, &last)| FailedRange { first, last })
            .collect()
    }

    fn failed_contains(failed: &BTreeMap<u64, u64>, sequence: u64) -> bool {
        failed
            .range(..=sequence)
            .next_back()
            .is_some_and(|(_, &last)| sequence <= last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn watermark_releases_lower_sequences() {
        let sync = ForceSynchronizer::new(0);
        sync.mark_forced(10);
        assert_eq!(sync.wait_for(3), ForceOutcome::Forced);
        assert_eq!(sync.wait_for(10), ForceOutcome::Forced);

        sync.mark_forced(4);
        assert_eq!(sync.forced(), 10);
    }

    #[test]
    fn failed_range_wins_over_watermark() {
        let sync = ForceSynchronizer::new(0);
        sync.mark_failed(5, 7);
        sync.mark_forced(20);
        assert_eq!(sync.wait_for(4), ForceOutcome::Forced);
        assert_eq!(sync.wait_for(6), ForceOutcome::Failed);
        assert_eq!(sync.wait_for(8), ForceOutcome::Forced);
        assert!(sync.is_failed(7));
        assert!(!sync.is_failed(8));
    }

    #[test]
    fn failed_ranges_coalesce() {
        let sync = ForceSynchronizer::new(0);
        sync.mark_failed(10, 12);
        sync.mark_failed(20, 25);
        sync.mark_failed(13, 14);
        assert_eq!(
            sync.failed_ranges(),
            vec![
                FailedRange { first: 10, last: 14 },
                FailedRange { first: 20, last: 25 }
            ]
        );

        sync.mark_failed(15, 19);
        assert_eq!(sync.failed_ranges(), vec![FailedRange { first: 10, last: 25 }]);

        sync.mark_failed(1, 30);
        assert_eq!(sync.failed_ranges(), vec![FailedRange { first: 1, last: 30 }]);
        assert!(FailedRange { first: 1, last: 30 }.contains(30));
    }

    #[test]
    fn waiter_is_released_by_force() {
        let sync = Arc::new(ForceSynchronizer::new(0));
        let waiter = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || sync.wait_for(3))
        };
        thread::sleep(Duration::from_millis(20));
        sync.mark_forced(3);
        assert_eq!(waiter.join().unwrap(), ForceOutcome::Forced);
    }

    #[test]
    fn waiter_is_released_by_failure_and_interrupt() {
        let sync = Arc::new(ForceSynchronizer::new(0));
        let failed = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || sync.wait_for(2))
        };
        let interrupted = {
            let sync = Arc::clone(&sync);
            thread::spawn(move || sync.wait_for(9))
        };
        thread::sleep(Duration::from_millis(20));
        sync.mark_failed(1, 2);
        assert_eq!(failed.join().unwrap(), ForceOutcome::Failed);

        sync.interrupt();
        assert_eq!(interrupted.join().unwrap(), ForceOutcome::Interrupted);
    }
}
