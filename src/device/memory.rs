use crate::error::Result;

/// Bridges device memory with allgrad's staging and transfer machinery.
///
/// Allgrad operates on raw `u64` pointers + byte counts. A `DeviceMemory`
/// backend owns the actual allocation and copy primitives for one device
/// family:
///
/// - `HostMemory` (built-in): plain aligned host memory, memcpy copies.
/// - GPU backends: cudaMalloc/cudaMemcpy-style primitives (implemented
///   externally).
///
/// The copy methods are synchronous; asynchrony is provided above this
/// seam by the transfer engine's copy lanes.
pub trait DeviceMemory: Send + Sync {
    /// Allocate `bytes` of zero-initialized device memory on `device_id`.
    fn alloc_device(&self, device_id: u32, bytes: usize) -> Result<u64>;

    /// Release memory previously returned by [`alloc_device`](Self::alloc_device).
    ///
    /// # Safety
    /// `ptr` must come from `alloc_device` on the same backend with the
    /// same `device_id` and `bytes`, and must not be used afterwards.
    unsafe fn free_device(&self, device_id: u32, ptr: u64, bytes: usize);

    /// Copy `bytes` from device memory to a host buffer.
    ///
    /// # Safety
    /// `src` must be valid device memory and `dst` valid host memory for
    /// at least `bytes` bytes; the regions must not overlap.
    unsafe fn copy_device_to_host(
        &self,
        device_id: u32,
        src: u64,
        dst: u64,
        bytes: usize,
    ) -> Result<()>;

    /// Copy `bytes` from a host buffer into device memory.
    ///
    /// # Safety
    /// `src` must be valid host memory and `dst` valid device memory for
    /// at least `bytes` bytes; the regions must not overlap.
    unsafe fn copy_host_to_device(
        &self,
        device_id: u32,
        src: u64,
        dst: u64,
        bytes: usize,
    ) -> Result<()>;

    /// Copy `bytes` between two buffers on the same device.
    ///
    /// # Safety
    /// Both pointers must be valid device memory on `device_id` for at
    /// least `bytes` bytes; the regions must not overlap.
    unsafe fn copy_device_to_device(
        &self,
        device_id: u32,
        src: u64,
        dst: u64,
        bytes: usize,
    ) -> Result<()>;

    /// Record a single-use event on the device's compute stream.
    ///
    /// Synchronizing on the returned event guarantees that all compute
    /// work issued before the record has finished, so staging copies on
    /// a different stream cannot read half-written tensors.
    fn record_compute_event(&self, device_id: u32) -> Result<Box<dyn ComputeEvent>>;
}

/// A single-use synchronization point against a device compute stream.
pub trait ComputeEvent: Send {
    /// Block until all compute work issued before the event was recorded
    /// has completed. Consumes the event.
    fn synchronize(self: Box<Self>) -> Result<()>;
}

/// Page-locked host memory allocator, keyed by device id.
///
/// Staging buffers are allocated through this trait so asynchronous copy
/// engines can DMA directly from them.
pub trait PinnedAllocator: Send + Sync {
    /// Allocate `bytes` of pinned host memory usable with `device_id`.
    fn alloc_pinned(&self, device_id: u32, bytes: usize) -> Result<u64>;

    /// Release memory previously returned by [`alloc_pinned`](Self::alloc_pinned).
    ///
    /// # Safety
    /// `ptr` must come from `alloc_pinned` on the same backend with the
    /// same `device_id` and `bytes`, and must not be used afterwards.
    unsafe fn free_pinned(&self, device_id: u32, ptr: u64, bytes: usize);
}
