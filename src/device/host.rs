use crate::device::memory::{ComputeEvent, DeviceMemory, PinnedAllocator};
use crate::error::{AllgradError, Result};
use std::alloc::{Layout, alloc_zeroed, dealloc};

/// All host allocations are 64-byte aligned, enough for any element type
/// and for SIMD-friendly copies.
const HOST_ALIGN: usize = 64;

/// Backend where "device" memory is plain host memory and every copy is a
/// memcpy. Serves CPU-only deployments and doubles as the deterministic
/// device double in tests. GPU backends implement the same traits
/// externally.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostMemory;

impl HostMemory {
    pub fn new() -> Self {
        Self
    }

    fn alloc_aligned(device_id: u32, bytes: usize) -> Result<u64> {
        let layout = Layout::from_size_align(bytes.max(1), HOST_ALIGN).map_err(|e| {
            AllgradError::AllocationFailed {
                device_id,
                bytes,
                reason: e.to_string(),
            }
        })?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return Err(AllgradError::AllocationFailed {
                device_id,
                bytes,
                reason: "allocator returned null".into(),
            });
        }
        Ok(ptr as u64)
    }

    unsafe fn free_aligned(ptr: u64, bytes: usize) {
        if ptr == 0 {
            return;
        }
        // Matches the layout used in alloc_aligned.
        let layout = unsafe { Layout::from_size_align_unchecked(bytes.max(1), HOST_ALIGN) };
        unsafe { dealloc(ptr as *mut u8, layout) };
    }
}

unsafe fn memcpy(src: u64, dst: u64, bytes: usize) {
    unsafe { std::ptr::copy_nonoverlapping(src as *const u8, dst as *mut u8, bytes) };
}

impl DeviceMemory for HostMemory {
    fn alloc_device(&self, device_id: u32, bytes: usize) -> Result<u64> {
        Self::alloc_aligned(device_id, bytes)
    }

    unsafe fn free_device(&self, _device_id: u32, ptr: u64, bytes: usize) {
        unsafe { Self::free_aligned(ptr, bytes) };
    }

    unsafe fn copy_device_to_host(
        &self,
        _device_id: u32,
        src: u64,
        dst: u64,
        bytes: usize,
    ) -> Result<()> {
        unsafe { memcpy(src, dst, bytes) };
        Ok(())
    }

    unsafe fn copy_host_to_device(
        &self,
        _device_id: u32,
        src: u64,
        dst: u64,
        bytes: usize,
    ) -> Result<()> {
        unsafe { memcpy(src, dst, bytes) };
        Ok(())
    }

    unsafe fn copy_device_to_device(
        &self,
        _device_id: u32,
        src: u64,
        dst: u64,
        bytes: usize,
    ) -> Result<()> {
        unsafe { memcpy(src, dst, bytes) };
        Ok(())
    }

    fn record_compute_event(&self, _device_id: u32) -> Result<Box<dyn ComputeEvent>> {
        // Host compute is synchronous; there is nothing to wait for.
        Ok(Box::new(HostComputeEvent))
    }
}

impl PinnedAllocator for HostMemory {
    fn alloc_pinned(&self, device_id: u32, bytes: usize) -> Result<u64> {
        Self::alloc_aligned(device_id, bytes)
    }

    unsafe fn free_pinned(&self, _device_id: u32, ptr: u64, bytes: usize) {
        unsafe { Self::free_aligned(ptr, bytes) };
    }
}

struct HostComputeEvent;

impl ComputeEvent for HostComputeEvent {
    fn synchronize(self: Box<Self>) -> Result<()> {
        Ok(())
    }
}
