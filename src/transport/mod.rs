mod local;

pub use local::LocalTransport;

use crate::error::Result;
use crate::types::{DataType, Rank};

/// Handle to one outstanding non-blocking reduction.
///
/// Created by [`CollectiveTransport::all_reduce_async`], mutated only by
/// the transport, consumed by [`CollectiveTransport::wait_any`].
#[derive(Debug)]
pub struct ReductionRequest {
    op_id: u64,
    src: u64,
    dst: u64,
    count: usize,
    dtype: DataType,
    completed: bool,
}

impl ReductionRequest {
    /// Build a request handle. For transport implementors.
    pub fn new(op_id: u64, src: u64, dst: u64, count: usize, dtype: DataType) -> Self {
        Self {
            op_id,
            src,
            dst,
            count,
            dtype,
            completed: false,
        }
    }

    /// Transport-assigned identifier of the underlying operation.
    pub fn op_id(&self) -> u64 {
        self.op_id
    }

    pub fn src(&self) -> u64 {
        self.src
    }

    pub fn dst(&self) -> u64 {
        self.dst
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// Whether this request has been observed complete by `wait_any`.
    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Mark the request complete. For transport implementors.
    pub fn mark_completed(&mut self) {
        self.completed = true;
    }
}

/// MPI-like collective transport collaborator.
///
/// Provides rank addressing and the sum all-reduce primitives the
/// aggregation algorithm is built on. Implementations must deliver
/// identical reduced values to every rank. Collectives are matched by
/// issue order: all ranks must issue the same sequence of operations.
pub trait CollectiveTransport: Send + Sync {
    /// This worker's rank within the group (0-indexed).
    fn rank(&self) -> Rank;

    /// Total number of workers in the group.
    fn world_size(&self) -> u32;

    /// Host identity of this worker, never empty.
    fn host_name(&self) -> String;

    /// Issue a non-blocking element-wise sum across all ranks.
    ///
    /// `src == dst` reduces in place. Only `F32` and `F64` are accepted;
    /// any other type is a fatal `UnsupportedDType`.
    ///
    /// # Safety
    /// `src` must be valid for reads and `dst` for writes of
    /// `count * dtype.size_in_bytes()` bytes of host memory until the
    /// returned request has been observed complete via `wait_any`.
    unsafe fn all_reduce_async(
        &self,
        src: u64,
        dst: u64,
        count: usize,
        dtype: DataType,
    ) -> Result<ReductionRequest>;

    /// Block until at least one incomplete request finishes and return
    /// its index, delivering its result into the request's destination.
    ///
    /// Returns `Ok(None)` when every request has already completed (or
    /// the slice is empty) — no further progress is possible.
    fn wait_any(&self, requests: &mut [ReductionRequest]) -> Result<Option<usize>>;

    /// Blocking element-wise sum across all ranks.
    ///
    /// # Safety
    /// Same contract as [`all_reduce_async`](Self::all_reduce_async);
    /// the pointers only need to stay valid until this call returns.
    unsafe fn all_reduce(&self, src: u64, dst: u64, count: usize, dtype: DataType) -> Result<()> {
        let request = unsafe { self.all_reduce_async(src, dst, count, dtype)? };
        let mut requests = [request];
        while self.wait_any(&mut requests)?.is_some() {}
        Ok(())
    }
}
