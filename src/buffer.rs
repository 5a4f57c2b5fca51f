//! Transfer buffer pool and the shared work buffer.
//!
//! The pool holds a fixed small set of equally sized transfer buffers cycled
//! round-robin: while the device fills one, a previously filled one is being
//! analyzed. The work buffer is the single region handed to analysis; copying
//! the just-filled transfer buffer into it decouples the analysis task's
//! input lifetime from reuse of the physical buffer.

use crate::device::TransferBuffer;
use std::sync::Arc;

/// Default number of transfer buffers in the pool.
///
/// Must stay strictly greater than the worker-pool depth so a physical
/// buffer is never re-targeted while a consumer could still be reading data
/// derived from it (validated in `SessionOptions::validate`).
pub const DEFAULT_BUFFER_COUNT: usize = 4;

// =============================================================================
// Buffer Pool
// =============================================================================

/// Fixed, ordered set of driver-allocated transfer buffers.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Vec<TransferBuffer>,
}

impl BufferPool {
    /// Build a pool from already-allocated transfer buffers.
    pub fn new(buffers: Vec<TransferBuffer>) -> Self {
        debug_assert!(!buffers.is_empty());
        Self { buffers }
    }

    /// Number of buffers in the pool.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Returns true if the pool holds no buffers.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Round-robin pool index for a given loop count.
    pub fn index_for(&self, loop_count: u64) -> usize {
        (loop_count % self.buffers.len() as u64) as usize
    }

    /// The buffer targeted at the given loop count.
    pub fn buffer_mut(&mut self, loop_count: u64) -> &mut TransferBuffer {
        let index = self.index_for(loop_count);
        &mut self.buffers[index]
    }

    /// Read access to the buffer targeted at the given loop count.
    pub fn buffer(&self, loop_count: u64) -> &TransferBuffer {
        &self.buffers[self.index_for(loop_count)]
    }

    /// Tear the pool down, yielding buffers in reverse allocation order so
    /// the caller can return them to the driver.
    pub fn into_reverse_order(self) -> impl Iterator<Item = TransferBuffer> {
        self.buffers.into_iter().rev()
    }
}

// =============================================================================
// Work Buffer
// =============================================================================

/// The single buffer handed to analysis.
///
/// Internally an `Arc<Vec<i16>>`: each analysis task holds a snapshot of the
/// contents at submission time, and [`fill_from`](WorkBuffer::fill_from)
/// reuses the allocation whenever no task still holds it (copy-on-write
/// otherwise), so steady-state operation performs exactly one copy per
/// iteration.
#[derive(Debug, Clone)]
pub struct WorkBuffer {
    shared: Arc<Vec<i16>>,
}

impl WorkBuffer {
    /// Create a zeroed work buffer of `len_samples`.
    pub fn zeroed(len_samples: usize) -> Self {
        Self {
            shared: Arc::new(vec![0; len_samples]),
        }
    }

    /// Copy a just-filled transfer buffer into the work region.
    ///
    /// # Panics
    ///
    /// Panics if `src` has a different length than the work buffer; pool and
    /// work buffer are always sized identically by the session.
    pub fn fill_from(&mut self, src: &[i16]) {
        Arc::make_mut(&mut self.shared).copy_from_slice(src);
    }

    /// Snapshot of the current contents for an analysis task.
    pub fn snapshot(&self) -> Arc<Vec<i16>> {
        Arc::clone(&self.shared)
    }

    /// Current contents.
    pub fn samples(&self) -> &[i16] {
        &self.shared
    }

    /// Length in samples.
    pub fn len(&self) -> usize {
        self.shared.len()
    }

    /// Returns true if the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.shared.is_empty()
    }
}
