//! Fixed-capacity pool of serialization buffers.

use parking_lot::Mutex;

/// A bounded pool of byte buffers sized to a standard capacity.
///
/// Most journal records fit in the standard size, so the common case reuses
/// a buffer instead of allocating. Oversized requests get a fresh allocation
/// that is dropped on recycle, which keeps pooled memory bounded by
/// `capacity * standard_size`.
#[derive(Debug)]
pub struct BufferPool {
    standard_size: usize,
    capacity: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Creates a pool holding `capacity` preallocated buffers of
    /// `standard_size` bytes each.
    #[must_use]
    pub fn new(capacity: usize, standard_size: usize) -> Self {
        let buffers = (0..capacity)
            .map(|_| Vec::with_capacity(standard_size))
            .collect();
        Self {
            standard_size,
            capacity,
            buffers: Mutex::new(buffers),
        }
    }

    /// Returns an empty buffer able to hold at least `required` bytes.
    ///
    /// A pooled buffer is handed out when one is available and large enough;
    /// otherwise a fresh buffer of `max(standard_size, required)` is allocated.
    #[must_use]
    pub fn poll(&self, required: usize) -> Vec<u8> {
        if required <= self.standard_size {
            if let Some(mut buffer) = self.buffers.lock().pop() {
                buffer.clear();
                return buffer;
            }
        }
        Vec::with_capacity(self.standard_size.max(required))
    }

    /// Returns a buffer to the pool.
    ///
    /// Only buffers whose capacity is exactly the standard size are kept, and
    /// only while the pool is below its capacity. Anything else is dropped.
    pub fn recycle(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() != self.standard_size {
            return;
        }
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.capacity {
            buffer.clear();
            buffers.push(buffer);
        }
    }

    /// Number of buffers currently waiting in the pool.
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Capacity of pooled buffers.
    #[must_use]
    pub fn standard_size(&self) -> usize {
        self.standard_size
    }

    /// Maximum number of pooled buffers.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
