//! The aggregation orchestrator.
//!
//! A [`Communicator`] sums tensors element-wise across every worker in
//! the group, overlapping three stages: device-to-host staging copies,
//! non-blocking collective reductions, and host-to-device copy-backs.
//! The copy lanes and the transport are the only places where work
//! overlaps in time; the orchestration itself is a single-threaded
//! sequence per call.

use crate::config::AllgradConfig;
use crate::device::{DeviceMemory, HostMemory, PinnedAllocator};
use crate::error::{AllgradError, Result};
use crate::handle::AggregateHandle;
use crate::staging::StagingPool;
use crate::tensor::{Tensor, TensorView};
use crate::topology::{WorkerDescriptor, WorkerTopology};
use crate::transfer::TransferEngine;
use crate::transport::{CollectiveTransport, LocalTransport, ReductionRequest};
use crate::types::{Device, Rank, StorageFormat};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Per-slot device resources, created lazily and reused across calls.
/// Both tables only ever grow.
struct DeviceResources {
    engines: Vec<TransferEngine>,
    staging: StagingPool,
}

/// Aggregates gradients across all workers of a collective group.
///
/// Calls against one communicator are serialized internally: the staging
/// buffers and transfer engines are shared per-call state, so only one
/// aggregation can be in flight at a time. Every `wait` underneath
/// blocks indefinitely — a hung transport hangs the caller.
///
/// The `recipients` argument on the aggregation operations is accepted
/// for API completeness but currently ignored: reduction is always
/// global, and every worker receives the full result. This is a known
/// limitation, not a silent partial implementation — see
/// [`sub_group`](Self::sub_group) for the missing capability.
pub struct Communicator {
    transport: Arc<dyn CollectiveTransport>,
    memory: Arc<dyn DeviceMemory>,
    topology: WorkerTopology,
    config: AllgradConfig,
    resources: Mutex<DeviceResources>,
}

impl std::fmt::Debug for Communicator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Communicator")
            .field("topology", &self.topology)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Communicator {
    pub fn new(
        transport: Arc<dyn CollectiveTransport>,
        memory: Arc<dyn DeviceMemory>,
        pinned: Arc<dyn PinnedAllocator>,
    ) -> Self {
        Self::with_config(transport, memory, pinned, AllgradConfig::default())
    }

    pub fn with_config(
        transport: Arc<dyn CollectiveTransport>,
        memory: Arc<dyn DeviceMemory>,
        pinned: Arc<dyn PinnedAllocator>,
        config: AllgradConfig,
    ) -> Self {
        let topology = WorkerTopology::discover(transport.as_ref(), config.host_name.as_deref());
        tracing::debug!(
            rank = topology.current_worker().rank,
            world_size = topology.world_size(),
            "communicator initialized"
        );
        Self {
            transport,
            memory,
            topology,
            config,
            resources: Mutex::new(DeviceResources {
                engines: Vec::new(),
                staging: StagingPool::new(pinned),
            }),
        }
    }

    /// Bootstrap a full in-process group: one communicator per rank over
    /// a loopback transport and host-backed device memory.
    pub fn local(world_size: u32) -> Result<Vec<Communicator>> {
        let transports = LocalTransport::bootstrap_local(world_size)?;
        Ok(transports
            .into_iter()
            .map(|transport| {
                let backend = Arc::new(HostMemory::new());
                Communicator::new(Arc::new(transport), backend.clone(), backend)
            })
            .collect())
    }

    /// This worker's rank within the group.
    pub fn rank(&self) -> Rank {
        self.topology.current_worker().rank
    }

    /// Total number of workers in the group.
    pub fn world_size(&self) -> u32 {
        self.topology.world_size()
    }

    /// Snapshot of the group membership.
    pub fn workers(&self) -> HashSet<WorkerDescriptor> {
        self.topology.workers()
    }

    /// The local worker's descriptor.
    pub fn current_worker(&self) -> &WorkerDescriptor {
        self.topology.current_worker()
    }

    /// Sum `inputs` element-wise across all workers into freshly
    /// allocated outputs, leaving the inputs untouched.
    ///
    /// Outputs are shaped, typed, and placed identically to their
    /// inputs, in input order. With a single worker the outputs are a
    /// plain copy of the inputs and no collective is issued.
    pub fn aggregate(
        &self,
        inputs: &[TensorView],
        recipients: &HashSet<WorkerDescriptor>,
    ) -> Result<Vec<Tensor>> {
        self.note_ignored_recipients(recipients);

        let outputs = inputs
            .iter()
            .map(|view| Tensor::zeros_like(view, &self.memory))
            .collect::<Result<Vec<_>>>()?;

        // The gradients may still be in flight on the compute stream;
        // staging copies run on separate streams and must not observe
        // half-written tensors.
        if let Some(device_id) = first_gpu_device(inputs) {
            self.memory.record_compute_event(device_id)?.synchronize()?;
        }

        let out_views: Vec<TensorView> = outputs.iter().map(Tensor::view).collect();
        self.aggregate_impl(inputs, &out_views)?;
        Ok(outputs)
    }

    /// Sum `values` element-wise across all workers, in place.
    pub fn aggregate_in_place(
        &self,
        values: &[TensorView],
        recipients: &HashSet<WorkerDescriptor>,
    ) -> Result<()> {
        self.note_ignored_recipients(recipients);

        if let Some(device_id) = first_gpu_device(values) {
            self.memory.record_compute_event(device_id)?.synchronize()?;
        }
        self.aggregate_impl(values, values)
    }

    /// Schedule [`aggregate`](Self::aggregate) on a background task and
    /// return a handle to its outputs.
    ///
    /// The compute-stream synchronization point is recorded here, on the
    /// caller's thread, before the task is scheduled; the task then
    /// waits on it before touching any input. Must be called from within
    /// a tokio runtime. There is no cancellation: dropping the handle
    /// discards the result but the aggregation runs to completion.
    ///
    /// # Safety
    /// Every view in `inputs` must stay valid until the returned handle
    /// completes (see [`TensorView::new`]).
    pub unsafe fn aggregate_async(
        self: &Arc<Self>,
        inputs: Vec<TensorView>,
        recipients: HashSet<WorkerDescriptor>,
    ) -> AggregateHandle {
        let pre_sync = first_gpu_device(&inputs).map(|id| self.memory.record_compute_event(id));
        let comm = Arc::clone(self);
        AggregateHandle::spawn(move || {
            if let Some(event) = pre_sync {
                event?.synchronize()?;
            }
            comm.aggregate(&inputs, &recipients)
        })
    }

    /// Derive a communicator restricted to a subset of workers.
    ///
    /// Not implemented; always fails.
    pub fn sub_group(&self, _workers: &HashSet<WorkerDescriptor>) -> Result<Communicator> {
        Err(AllgradError::NotImplemented {
            operation: "sub_group",
        })
    }

    /// Gather and concatenate tensors from all workers.
    ///
    /// Not implemented; always fails.
    pub fn concatenate(
        &self,
        _values: &[TensorView],
        _recipients: &HashSet<WorkerDescriptor>,
    ) -> Result<Vec<Tensor>> {
        Err(AllgradError::NotImplemented {
            operation: "concatenate",
        })
    }

    /// Aggregate with quantization, carrying per-tensor residues.
    ///
    /// Not implemented; always fails.
    pub fn quantized_aggregate(
        &self,
        _values: &[TensorView],
        _residues: &[TensorView],
        _recipients: &HashSet<WorkerDescriptor>,
    ) -> Result<()> {
        Err(AllgradError::NotImplemented {
            operation: "quantized_aggregate",
        })
    }

    fn note_ignored_recipients(&self, recipients: &HashSet<WorkerDescriptor>) {
        if !recipients.is_empty() && recipients.len() != self.topology.world_size() as usize {
            tracing::debug!(
                requested = recipients.len(),
                world_size = self.topology.world_size(),
                "recipient subset is ignored; reducing across all workers"
            );
        }
    }

    /// The shared aggregation sequence. `outputs` may alias `inputs`.
    fn aggregate_impl(&self, inputs: &[TensorView], outputs: &[TensorView]) -> Result<()> {
        debug_assert_eq!(inputs.len(), outputs.len());

        if self.transport.world_size() == 1 || inputs.is_empty() {
            return self.identity_copy(inputs, outputs);
        }

        let mut resources = self
            .resources
            .lock()
            .map_err(|_| AllgradError::LockPoisoned("communicator resources"))?;
        let (slots, staging_ptrs) = self.assign_slots(&mut resources, inputs, outputs)?;

        // Stage-in: every GPU tensor starts its device-to-host copy.
        // Nothing blocks here.
        for (view, slot) in inputs.iter().zip(&slots) {
            if let Some(slot) = *slot {
                unsafe {
                    resources.engines[slot].copy_device_to_host_async(
                        view.data_ptr(),
                        view.byte_size(),
                        staging_ptrs[slot],
                    );
                }
            }
        }

        // Issue one non-blocking reduction per tensor, in input order. A
        // GPU tensor's staged bytes must be resident before its
        // reduction starts; GPU tensors reduce in place inside their
        // staging buffer.
        let mut requests: Vec<ReductionRequest> = Vec::with_capacity(inputs.len());
        for ((view, out), slot) in inputs.iter().zip(outputs).zip(&slots) {
            let (src, dst) = match *slot {
                Some(slot) => {
                    resources.engines[slot].wait_device_to_host()?;
                    (staging_ptrs[slot], staging_ptrs[slot])
                }
                None => (view.data_ptr(), out.data_ptr()),
            };
            let request = unsafe {
                self.transport
                    .all_reduce_async(src, dst, view.element_count(), view.dtype())?
            };
            requests.push(request);
        }

        // Drain completions in arbitrary order. The instant a GPU
        // tensor's reduction finishes, its copy-back starts, overlapping
        // with the reductions still in flight.
        let mut remaining = requests.len();
        while remaining > 0 {
            let Some(index) = self.transport.wait_any(&mut requests)? else {
                break;
            };
            remaining -= 1;
            if let Some(slot) = slots[index] {
                let out = &outputs[index];
                unsafe {
                    resources.engines[slot].copy_host_to_device_async(
                        staging_ptrs[slot],
                        out.byte_size(),
                        out.data_ptr(),
                    );
                }
            }
        }

        // Every output must be resident on its device before we return.
        for slot in slots.iter().flatten() {
            resources.engines[*slot].wait_host_to_device()?;
        }
        Ok(())
    }

    /// Validate the request and assign a staging slot to each GPU
    /// tensor, growing the engine and buffer tables as needed. Returns
    /// the per-tensor slot mapping and the per-slot staging pointers.
    fn assign_slots(
        &self,
        resources: &mut DeviceResources,
        inputs: &[TensorView],
        outputs: &[TensorView],
    ) -> Result<(Vec<Option<usize>>, Vec<u64>)> {
        let mut slots: Vec<Option<usize>> = vec![None; inputs.len()];
        let mut staging_ptrs: Vec<u64> = Vec::new();
        let mut gpu_device: Option<u32> = None;

        for (index, (view, out)) in inputs.iter().zip(outputs).enumerate() {
            if view.storage() != StorageFormat::Dense {
                return Err(AllgradError::SparseNotSupported { index });
            }
            if !view.dtype().is_reducible() {
                return Err(AllgradError::UnsupportedDType {
                    dtype: view.dtype(),
                    op: "aggregate",
                });
            }
            if view.element_count() != out.element_count() {
                return Err(AllgradError::ElementCountMismatch {
                    index,
                    input: view.element_count(),
                    output: out.element_count(),
                });
            }
            if view.dtype() != out.dtype() {
                return Err(AllgradError::DTypeMismatch {
                    index,
                    input: view.dtype(),
                    output: out.dtype(),
                });
            }
            if view.device() != out.device() {
                return Err(AllgradError::DeviceMismatch {
                    index,
                    input: view.device(),
                    output: out.device(),
                });
            }

            let Device::Gpu(device_id) = view.device() else {
                continue;
            };
            match gpu_device {
                None => gpu_device = Some(device_id),
                Some(first) if first != device_id => {
                    return Err(AllgradError::MixedGpuDevices {
                        first,
                        second: device_id,
                    });
                }
                Some(_) => {}
            }

            let slot = staging_ptrs.len();
            if resources.engines.len() <= slot {
                resources.engines.push(TransferEngine::new(
                    device_id,
                    slot,
                    Arc::clone(&self.memory),
                    self.config.copy_queue_depth,
                )?);
            } else if resources.engines[slot].device_id() != device_id {
                // The slot's engine was built for a different device in
                // an earlier call.
                resources.engines[slot] = TransferEngine::new(
                    device_id,
                    slot,
                    Arc::clone(&self.memory),
                    self.config.copy_queue_depth,
                )?;
            }
            let buffer = resources.staging.get_or_grow(device_id, slot, view.byte_size())?;
            staging_ptrs.push(buffer.ptr());
            slots[index] = Some(slot);
        }

        Ok((slots, staging_ptrs))
    }

    /// Fast exit: a group of one sums to itself. Out-of-place outputs
    /// get a local copy of their input; aliased pairs are left alone.
    fn identity_copy(&self, inputs: &[TensorView], outputs: &[TensorView]) -> Result<()> {
        for (view, out) in inputs.iter().zip(outputs) {
            if view.data_ptr() == out.data_ptr() {
                continue;
            }
            let bytes = view.byte_size();
            match view.device() {
                Device::Cpu => unsafe {
                    std::ptr::copy_nonoverlapping(
                        view.data_ptr() as *const u8,
                        out.data_ptr() as *mut u8,
                        bytes,
                    );
                },
                Device::Gpu(device_id) => unsafe {
                    self.memory
                        .copy_device_to_device(device_id, view.data_ptr(), out.data_ptr(), bytes)?;
                },
            }
        }
        Ok(())
    }
}

fn first_gpu_device(views: &[TensorView]) -> Option<u32> {
    views.iter().find_map(|view| view.device().gpu_id())
}
