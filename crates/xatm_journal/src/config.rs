//! Journal configuration.

use crate::error::{JournalError, JournalResult};
use std::time::Duration;

/// Configuration for a [`DiskJournal`](crate::DiskJournal).
#[derive(Debug, Clone)]
pub struct JournalConfig {
    /// Size the journal file is preallocated to when created.
    pub initial_size: u64,

    /// Longest the writer thread waits for more records before writing what
    /// it has, when no force is pending.
    pub write_delay: Duration,

    /// Writer loop iterations between forces when nobody asked for one.
    pub write_iterations_before_force: u32,

    /// Maximum records per batch; also the number of pooled buffers.
    pub concurrency: usize,

    /// Capacity of each pooled serialization buffer.
    pub standard_buffer_size: usize,

    /// Largest accepted record, framing included.
    pub max_record_size: usize,

    /// Tracked transactions older than this are purged with a warning.
    pub max_transaction_lifetime: Duration,

    /// Minimum fraction of the file that must be free after a rollover;
    /// below it the file is grown.
    pub grow_offset: f64,

    /// Factor the file size is multiplied by on each growth step.
    pub grow_ratio: f64,

    /// Only write COMMITTING, COMMITTED and UNKNOWN records.
    pub filter_log_status: bool,

    /// Make every `log` wait until its record is forced.
    pub conservative_journaling: bool,

    /// Skip records failing their CRC check instead of refusing to open.
    pub skip_corrupted_logs: bool,

    /// Number of wait cycles granted to the writer thread on close.
    pub shutdown_wait_cycles: u32,

    /// Length of one shutdown wait cycle.
    pub shutdown_wait_interval: Duration,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            initial_size: 2 * 1024 * 1024, // 2 MB
            write_delay: Duration::from_secs(2),
            write_iterations_before_force: 10,
            concurrency: 1024,
            standard_buffer_size: 386,
            max_record_size: 64 * 1024,
            max_transaction_lifetime: Duration::from_secs(14 * 24 * 60 * 60),
            grow_offset: 0.75,
            grow_ratio: 1.5,
            filter_log_status: false,
            conservative_journaling: false,
            skip_corrupted_logs: true,
            shutdown_wait_cycles: 40,
            shutdown_wait_interval: Duration::from_millis(50),
        }
    }
}

impl JournalConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the preallocated file size.
    #[must_use]
    pub const fn initial_size(mut self, size: u64) -> Self {
        self.initial_size = size;
        self
    }

    /// Sets the writer thread's batching delay.
    #[must_use]
    pub const fn write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    /// Sets the number of writer iterations between unsolicited forces.
    #[must_use]
    pub const fn write_iterations_before_force(mut self, iterations: u32) -> Self {
        self.write_iterations_before_force = iterations;
        self
    }

    /// Sets the batch size and buffer pool capacity.
    #[must_use]
    pub const fn concurrency(mut self, slots: usize) -> Self {
        self.concurrency = slots;
        self
    }

    /// Sets the pooled buffer capacity.
    #[must_use]
    pub const fn standard_buffer_size(mut self, size: usize) -> Self {
        self.standard_buffer_size = size;
        self
    }

    /// Sets the maximum record size.
    #[must_use]
    pub const fn max_record_size(mut self, size: usize) -> Self {
        self.max_record_size = size;
        self
    }

    /// Sets the maximum tracked transaction lifetime.
    #[must_use]
    pub const fn max_transaction_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_transaction_lifetime = lifetime;
        self
    }

    /// Sets the growth threshold and ratio.
    #[must_use]
    pub const fn growth(mut self, offset: f64, ratio: f64) -> Self {
        self.grow_offset = offset;
        self.grow_ratio = ratio;
        self
    }

    /// Sets whether non-mandatory statuses are filtered out.
    #[must_use]
    pub const fn filter_log_status(mut self, value: bool) -> Self {
        self.filter_log_status = value;
        self
    }

    /// Sets whether every log waits for its own force.
    #[must_use]
    pub const fn conservative_journaling(mut self, value: bool) -> Self {
        self.conservative_journaling = value;
        self
    }

    /// Sets whether corrupted records are skipped on open.
    #[must_use]
    pub const fn skip_corrupted_logs(mut self, value: bool) -> Self {
        self.skip_corrupted_logs = value;
        self
    }

    /// Sets how long close waits for the writer thread before interrupting
    /// it: `cycles` waits of `interval` each.
    #[must_use]
    pub const fn shutdown_wait(mut self, cycles: u32, interval: Duration) -> Self {
        self.shutdown_wait_cycles = cycles;
        self.shutdown_wait_interval = interval;
        self
    }

    /// Checks the configuration for values the journal cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::InvalidArgument`] describing the first bad value.
    pub fn validate(&self) -> JournalResult<()> {
        if self.concurrency == 0 {
            return Err(JournalError::invalid_argument("concurrency must be at least 1"));
        }
        if self.standard_buffer_size == 0 {
            return Err(JournalError::invalid_argument(
                "standard buffer size must be at least 1",
            ));
        }
        if self.grow_ratio <= 1.0 {
            return Err(JournalError::invalid_argument(format!(
                "grow ratio must be greater than 1, got {}",
                self.grow_ratio
            )));
        }
        if !(0.0..1.0).contains(&self.grow_offset) {
            return Err(JournalError::invalid_argument(format!(
                "grow offset must be in [0, 1), got {}",
                self.grow_offset
            )));
        }
        let minimum = crate::file::HEADER_SIZE + self.max_record_size as u64;
        if self.initial_size < minimum {
            return Err(JournalError::invalid_argument(format!(
                "initial size {} cannot hold the header and one maximum-size record ({minimum} bytes)",
                self.initial_size
            )));
        }
        Ok(())
    }
}
