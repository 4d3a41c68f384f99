//! Reusable pinned host buffers that stage GPU tensors for reduction.
//!
//! One buffer per device slot, grown to fit the largest tensor seen in
//! that slot and reused across aggregation calls for the communicator's
//! lifetime.

use crate::device::PinnedAllocator;
use crate::error::Result;
use std::sync::Arc;

/// One pinned host buffer backing a single staging slot.
pub struct StagingBuffer {
    ptr: u64,
    capacity: usize,
    device_id: u32,
    allocator: Arc<dyn PinnedAllocator>,
}

impl StagingBuffer {
    fn alloc(allocator: &Arc<dyn PinnedAllocator>, device_id: u32, bytes: usize) -> Result<Self> {
        let ptr = allocator.alloc_pinned(device_id, bytes)?;
        Ok(Self {
            ptr,
            capacity: bytes,
            device_id,
            allocator: Arc::clone(allocator),
        })
    }

    /// Raw pointer to the pinned memory.
    pub fn ptr(&self) -> u64 {
        self.ptr
    }

    /// Usable size in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Device the buffer was pinned for.
    pub fn device_id(&self) -> u32 {
        self.device_id
    }
}

impl std::fmt::Debug for StagingBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StagingBuffer")
            .field("ptr", &self.ptr)
            .field("capacity", &self.capacity)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        unsafe {
            self.allocator
                .free_pinned(self.device_id, self.ptr, self.capacity)
        };
    }
}

/// Growth-only pool of per-slot staging buffers.
///
/// Capacity in a slot only ever increases; a buffer that fits is reused
/// as-is, one that is too small (or pinned for a different device) is
/// replaced by an exact-size allocation. Buffers live until the pool is
/// dropped.
pub struct StagingPool {
    allocator: Arc<dyn PinnedAllocator>,
    slots: Vec<Option<StagingBuffer>>,
}

impl StagingPool {
    pub fn new(allocator: Arc<dyn PinnedAllocator>) -> Self {
        Self {
            allocator,
            slots: Vec::new(),
        }
    }

    /// Number of slots that currently hold a buffer.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The buffer for `slot`, sized to at least `required` bytes.
    ///
    /// Allocation failures are fatal to the call; there is no retry.
    pub fn get_or_grow(
        &mut self,
        device_id: u32,
        slot: usize,
        required: usize,
    ) -> Result<&StagingBuffer> {
        if self.slots.len() <= slot {
            self.slots.resize_with(slot + 1, || None);
        }

        let replace = match &self.slots[slot] {
            None => true,
            Some(buffer) => buffer.capacity() < required || buffer.device_id() != device_id,
        };
        if replace {
            tracing::debug!(slot, bytes = required, device_id, "growing staging buffer");
            self.slots[slot] = Some(StagingBuffer::alloc(&self.allocator, device_id, required)?);
        }

        Ok(self.slots[slot]
            .as_ref()
            .expect("slot populated just above"))
    }
}
