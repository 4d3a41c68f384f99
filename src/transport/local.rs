//! In-process loopback transport.
//!
//! Bootstraps N ranks inside one process sharing a coordination core:
//! each rank's nth collective matches every other rank's nth (the usual
//! issue-order discipline), contributions are summed into a shared
//! accumulator, and completed results are delivered into each rank's
//! destination buffer from its own `wait_any`. Useful for single-host
//! deployments and as the deterministic transport in tests.

use crate::error::{AllgradError, Result};
use crate::transport::{CollectiveTransport, ReductionRequest};
use crate::types::{DataType, Rank};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};

struct PendingOp {
    acc: Vec<u8>,
    count: usize,
    dtype: DataType,
    arrived: u32,
    delivered: u32,
    done: bool,
}

#[derive(Default)]
struct SharedOps {
    ops: Mutex<HashMap<u64, PendingOp>>,
    done_cv: Condvar,
}

struct SharedGroup {
    world_size: u32,
    shared: SharedOps,
}

/// One rank's endpoint of an in-process collective group.
pub struct LocalTransport {
    rank: Rank,
    group: Arc<SharedGroup>,
    next_op: AtomicU64,
    issued: AtomicU64,
    host: String,
}

impl LocalTransport {
    /// Create transports for every rank of an in-process group.
    pub fn bootstrap_local(world_size: u32) -> Result<Vec<LocalTransport>> {
        if world_size == 0 {
            return Err(AllgradError::transport("world size must be at least 1"));
        }
        let group = Arc::new(SharedGroup {
            world_size,
            shared: SharedOps::default(),
        });
        let mut host = gethostname::gethostname().to_string_lossy().into_owned();
        if host.is_empty() {
            host = "localhost".to_owned();
        }

        Ok((0..world_size)
            .map(|rank| LocalTransport {
                rank,
                group: Arc::clone(&group),
                next_op: AtomicU64::new(0),
                issued: AtomicU64::new(0),
                host: host.clone(),
            })
            .collect())
    }

    /// Number of collectives this rank has issued. Observability hook,
    /// also used by tests to assert fast paths stay off the network.
    pub fn issued_ops(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}

/// `acc[i] += src[i]`, element-wise, interpreting both byte slices as
/// `count` little-endian elements of `dtype`.
fn sum_into(acc: &mut [u8], src: &[u8], count: usize, dtype: DataType) {
    match dtype {
        DataType::F32 => sum_into_typed::<f32>(acc, src, count),
        DataType::F64 => sum_into_typed::<f64>(acc, src, count),
        // Rejected before an op is ever created.
        DataType::F16 | DataType::BF16 => unreachable!("non-reducible dtype in pending op"),
    }
}

trait SumElem: Copy {
    const SIZE: usize;
    fn read_le(bytes: &[u8]) -> Self;
    fn write_le(self, bytes: &mut [u8]);
    fn add(self, other: Self) -> Self;
}

macro_rules! impl_sum_elem {
    ($($ty:ty),*) => {
        $(
            impl SumElem for $ty {
                const SIZE: usize = std::mem::size_of::<$ty>();

                #[inline]
                fn read_le(bytes: &[u8]) -> Self {
                    Self::from_le_bytes(bytes.try_into().expect("slice length matches type size"))
                }

                #[inline]
                fn write_le(self, bytes: &mut [u8]) {
                    bytes.copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn add(self, other: Self) -> Self {
                    self + other
                }
            }
        )*
    };
}

impl_sum_elem!(f32, f64);

fn sum_into_typed<T: SumElem>(acc: &mut [u8], src: &[u8], count: usize) {
    for i in 0..count {
        let off = i * T::SIZE;
        let a = T::read_le(&acc[off..off + T::SIZE]);
        let b = T::read_le(&src[off..off + T::SIZE]);
        a.add(b).write_le(&mut acc[off..off + T::SIZE]);
    }
}

impl CollectiveTransport for LocalTransport {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn world_size(&self) -> u32 {
        self.group.world_size
    }

    fn host_name(&self) -> String {
        self.host.clone()
    }

    unsafe fn all_reduce_async(
        &self,
        src: u64,
        dst: u64,
        count: usize,
        dtype: DataType,
    ) -> Result<ReductionRequest> {
        if !dtype.is_reducible() {
            return Err(AllgradError::UnsupportedDType {
                dtype,
                op: "all_reduce",
            });
        }

        let op_id = self.next_op.fetch_add(1, Ordering::Relaxed);
        self.issued.fetch_add(1, Ordering::Relaxed);

        let bytes = count * dtype.size_in_bytes();
        let contribution = unsafe { std::slice::from_raw_parts(src as *const u8, bytes) };

        let mut ops = self
            .group
            .shared
            .ops
            .lock()
            .map_err(|_| AllgradError::LockPoisoned("local transport ops"))?;
        let op = ops.entry(op_id).or_insert_with(|| PendingOp {
            acc: vec![0u8; bytes],
            count,
            dtype,
            arrived: 0,
            delivered: 0,
            done: false,
        });
        if op.count != count || op.dtype != dtype {
            return Err(AllgradError::transport(format!(
                "collective {op_id} issued with mismatched shape across ranks"
            )));
        }

        sum_into(&mut op.acc, contribution, count, dtype);
        op.arrived += 1;
        if op.arrived == self.group.world_size {
            op.done = true;
            self.group.shared.done_cv.notify_all();
        }

        Ok(ReductionRequest::new(op_id, src, dst, count, dtype))
    }

    fn wait_any(&self, requests: &mut [ReductionRequest]) -> Result<Option<usize>> {
        if requests.iter().all(ReductionRequest::is_completed) {
            return Ok(None);
        }

        let mut ops = self
            .group
            .shared
            .ops
            .lock()
            .map_err(|_| AllgradError::LockPoisoned("local transport ops"))?;
        loop {
            for index in 0..requests.len() {
                if requests[index].is_completed() {
                    continue;
                }
                let op_id = requests[index].op_id();
                let Some(op) = ops.get_mut(&op_id) else {
                    continue;
                };
                if !op.done {
                    continue;
                }

                unsafe {
                    std::ptr::copy_nonoverlapping(
                        op.acc.as_ptr(),
                        requests[index].dst() as *mut u8,
                        op.acc.len(),
                    );
                }
                op.delivered += 1;
                if op.delivered == self.group.world_size {
                    ops.remove(&op_id);
                }
                requests[index].mark_completed();
                return Ok(Some(index));
            }

            ops = self
                .group
                .shared
                .done_cv
                .wait(ops)
                .map_err(|_| AllgradError::LockPoisoned("local transport ops"))?;
        }
    }
}
