use crate::device::DeviceMemory;
use crate::error::{AllgradError, Result};
use crate::types::{DataType, Device, StorageFormat};
use std::sync::Arc;

/// Borrowed, untyped view over a caller-owned tensor.
///
/// The view carries everything aggregation needs to know about a tensor
/// — raw data pointer, element count, data type, placement, storage
/// format — without taking ownership. Views are `Copy` and freely sent
/// across threads; validity is the caller's responsibility.
#[derive(Debug, Clone, Copy)]
pub struct TensorView {
    ptr: u64,
    count: usize,
    dtype: DataType,
    device: Device,
    storage: StorageFormat,
}

impl TensorView {
    /// Wrap a raw tensor buffer.
    ///
    /// # Safety
    /// `ptr` must point to at least `count * dtype.size_in_bytes()` bytes
    /// of memory on `device`, valid for reads — and for writes when the
    /// view is used as an aggregation output or aggregated in place —
    /// for the full duration of every call the view participates in. For
    /// [`Communicator::aggregate_async`](crate::comm::Communicator::aggregate_async)
    /// that duration extends until the returned handle completes.
    pub unsafe fn new(
        ptr: u64,
        count: usize,
        dtype: DataType,
        device: Device,
        storage: StorageFormat,
    ) -> Self {
        Self {
            ptr,
            count,
            dtype,
            device,
            storage,
        }
    }

    /// Raw pointer to the first element.
    pub fn data_ptr(&self) -> u64 {
        self.ptr
    }

    /// Number of elements in the tensor.
    pub fn element_count(&self) -> usize {
        self.count
    }

    /// Total size of the tensor's data in bytes.
    pub fn byte_size(&self) -> usize {
        self.count * self.dtype.size_in_bytes()
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    pub fn storage(&self) -> StorageFormat {
        self.storage
    }
}

enum Storage {
    /// Backed by `u64` words so f64 elements are always aligned. The
    /// buffer is never resized, so the derived pointer stays stable.
    Host(#[allow(dead_code)] Vec<u64>),
    Device {
        device_id: u32,
        bytes: usize,
        memory: Arc<dyn DeviceMemory>,
    },
}

/// An owned dense tensor on the host or on a device.
///
/// [`Communicator::aggregate`](crate::comm::Communicator::aggregate)
/// returns its results as `Tensor`s; callers and tests can also use it
/// to hold inputs. Device storage is released through the backend that
/// allocated it when the tensor drops.
pub struct Tensor {
    storage: Storage,
    ptr: u64,
    count: usize,
    dtype: DataType,
    device: Device,
}

impl Tensor {
    fn host_words(bytes: usize) -> Vec<u64> {
        vec![0u64; bytes.div_ceil(8)]
    }

    /// Zero-filled host tensor.
    pub fn zeros(count: usize, dtype: DataType) -> Self {
        let words = Self::host_words(count * dtype.size_in_bytes());
        let ptr = words.as_ptr() as u64;
        Self {
            storage: Storage::Host(words),
            ptr,
            count,
            dtype,
            device: Device::Cpu,
        }
    }

    /// Zero-filled tensor on the given device.
    pub fn zeros_on(
        device: Device,
        count: usize,
        dtype: DataType,
        memory: &Arc<dyn DeviceMemory>,
    ) -> Result<Self> {
        match device {
            Device::Cpu => Ok(Self::zeros(count, dtype)),
            Device::Gpu(device_id) => {
                let bytes = count * dtype.size_in_bytes();
                let ptr = memory.alloc_device(device_id, bytes)?;
                Ok(Self {
                    storage: Storage::Device {
                        device_id,
                        bytes,
                        memory: Arc::clone(memory),
                    },
                    ptr,
                    count,
                    dtype,
                    device,
                })
            }
        }
    }

    /// Zero-filled tensor shaped, typed, and placed like `view`.
    pub fn zeros_like(view: &TensorView, memory: &Arc<dyn DeviceMemory>) -> Result<Self> {
        Self::zeros_on(view.device(), view.element_count(), view.dtype(), memory)
    }

    /// Host tensor holding a copy of `values`.
    pub fn from_f32(values: &[f32]) -> Self {
        let tensor = Self::zeros(values.len(), DataType::F32);
        unsafe {
            std::ptr::copy_nonoverlapping(
                values.as_ptr() as *const u8,
                tensor.ptr as *mut u8,
                std::mem::size_of_val(values),
            );
        }
        tensor
    }

    /// Host tensor holding a copy of `values`.
    pub fn from_f64(values: &[f64]) -> Self {
        let tensor = Self::zeros(values.len(), DataType::F64);
        unsafe {
            std::ptr::copy_nonoverlapping(
                values.as_ptr() as *const u8,
                tensor.ptr as *mut u8,
                std::mem::size_of_val(values),
            );
        }
        tensor
    }

    /// Tensor on `device` holding a copy of `values`.
    pub fn from_f32_on(
        device: Device,
        values: &[f32],
        memory: &Arc<dyn DeviceMemory>,
    ) -> Result<Self> {
        match device {
            Device::Cpu => Ok(Self::from_f32(values)),
            Device::Gpu(device_id) => {
                let tensor = Self::zeros_on(device, values.len(), DataType::F32, memory)?;
                unsafe {
                    memory.copy_host_to_device(
                        device_id,
                        values.as_ptr() as u64,
                        tensor.ptr,
                        std::mem::size_of_val(values),
                    )?;
                }
                Ok(tensor)
            }
        }
    }

    /// A dense view over this tensor's storage.
    pub fn view(&self) -> TensorView {
        unsafe {
            TensorView::new(
                self.ptr,
                self.count,
                self.dtype,
                self.device,
                StorageFormat::Dense,
            )
        }
    }

    pub fn element_count(&self) -> usize {
        self.count
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Copy the tensor's contents back to the host as `f32` values.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        if self.dtype != DataType::F32 {
            return Err(AllgradError::UnsupportedDType {
                dtype: self.dtype,
                op: "to_f32_vec",
            });
        }
        let mut out = vec![0f32; self.count];
        self.read_back(out.as_mut_ptr() as u64)?;
        Ok(out)
    }

    /// Copy the tensor's contents back to the host as `f64` values.
    pub fn to_f64_vec(&self) -> Result<Vec<f64>> {
        if self.dtype != DataType::F64 {
            return Err(AllgradError::UnsupportedDType {
                dtype: self.dtype,
                op: "to_f64_vec",
            });
        }
        let mut out = vec![0f64; self.count];
        self.read_back(out.as_mut_ptr() as u64)?;
        Ok(out)
    }

    fn read_back(&self, dst: u64) -> Result<()> {
        let total = self.count * self.dtype.size_in_bytes();
        match &self.storage {
            Storage::Host(_) => {
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        self.ptr as *const u8,
                        dst as *mut u8,
                        total,
                    );
                }
                Ok(())
            }
            Storage::Device {
                device_id, memory, ..
            } => unsafe { memory.copy_device_to_host(*device_id, self.ptr, dst, total) },
        }
    }
}

impl Drop for Tensor {
    fn drop(&mut self) {
        if let Storage::Device {
            device_id,
            bytes,
            memory,
        } = &self.storage
        {
            unsafe { memory.free_device(*device_id, self.ptr, *bytes) };
        }
    }
}

impl std::fmt::Debug for Tensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tensor")
            .field("count", &self.count)
            .field("dtype", &self.dtype)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}
