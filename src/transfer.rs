//! Per-slot asynchronous device↔host copy engine.
//!
//! Each engine owns two independent FIFO lanes — device-to-host and
//! host-to-device — each backed by a dedicated worker thread draining a
//! bounded queue. Submissions return immediately; `wait_*` blocks until
//! every copy issued to that lane has completed. Copy failures are
//! recorded and surfaced at the next wait.

use crate::device::DeviceMemory;
use crate::error::{AllgradError, Result};
use crossbeam_channel::{Sender, bounded};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

#[derive(Debug, Clone, Copy)]
enum CopyDirection {
    DeviceToHost,
    HostToDevice,
}

impl CopyDirection {
    fn label(self) -> &'static str {
        match self {
            CopyDirection::DeviceToHost => "d2h",
            CopyDirection::HostToDevice => "h2d",
        }
    }
}

struct CopyJob {
    src: u64,
    dst: u64,
    bytes: usize,
}

#[derive(Default)]
struct LaneProgress {
    issued: u64,
    completed: u64,
    failed: Option<String>,
}

#[derive(Default)]
struct LaneShared {
    progress: Mutex<LaneProgress>,
    completed_cv: Condvar,
}

/// One FIFO copy lane: jobs run strictly in submission order.
struct CopyLane {
    shared: Arc<LaneShared>,
    tx: Option<Sender<CopyJob>>,
    worker: Option<std::thread::JoinHandle<()>>,
    device_id: u32,
}

impl CopyLane {
    fn spawn(
        device_id: u32,
        slot: usize,
        direction: CopyDirection,
        memory: Arc<dyn DeviceMemory>,
        queue_depth: usize,
    ) -> Result<Self> {
        let (tx, rx) = bounded::<CopyJob>(queue_depth.max(1));
        let shared = Arc::new(LaneShared::default());
        let worker_shared = Arc::clone(&shared);

        let name = format!("allgrad-{}-{}.{}", direction.label(), device_id, slot);
        let worker = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                for job in rx {
                    let result = unsafe {
                        match direction {
                            CopyDirection::DeviceToHost => {
                                memory.copy_device_to_host(device_id, job.src, job.dst, job.bytes)
                            }
                            CopyDirection::HostToDevice => {
                                memory.copy_host_to_device(device_id, job.src, job.dst, job.bytes)
                            }
                        }
                    };
                    let mut progress = worker_shared
                        .progress
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    progress.completed += 1;
                    if let Err(e) = result {
                        if progress.failed.is_none() {
                            progress.failed = Some(e.to_string());
                        }
                    }
                    worker_shared.completed_cv.notify_all();
                }
            })
            .map_err(|e| AllgradError::Transfer {
                device_id,
                message: format!("failed to spawn {} lane: {e}", direction.label()),
            })?;

        Ok(Self {
            shared,
            tx: Some(tx),
            worker: Some(worker),
            device_id,
        })
    }

    /// Enqueue a copy. Returns immediately; failures surface at `wait`.
    ///
    /// # Safety
    /// `src` and `dst` must stay valid until `wait` returns.
    unsafe fn submit(&self, src: u64, dst: u64, bytes: usize) {
        {
            let mut progress = self
                .shared
                .progress
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            progress.issued += 1;
        }

        let sent = match &self.tx {
            Some(tx) => tx.send(CopyJob { src, dst, bytes }).is_ok(),
            None => false,
        };
        if !sent {
            let mut progress = self
                .shared
                .progress
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            progress.completed += 1;
            if progress.failed.is_none() {
                progress.failed = Some("copy lane is shut down".into());
            }
            self.shared.completed_cv.notify_all();
        }
    }

    /// Block until every issued copy has completed.
    fn wait(&self) -> Result<()> {
        let mut progress = self
            .shared
            .progress
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while progress.failed.is_none() && progress.completed < progress.issued {
            progress = self
                .shared
                .completed_cv
                .wait(progress)
                .unwrap_or_else(PoisonError::into_inner);
        }
        match &progress.failed {
            Some(message) => Err(AllgradError::Transfer {
                device_id: self.device_id,
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

impl Drop for CopyLane {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Asynchronous copy engine for one GPU staging slot.
///
/// The two directions are independent queues; copies within one
/// direction are never reordered.
pub struct TransferEngine {
    device_id: u32,
    d2h: CopyLane,
    h2d: CopyLane,
}

impl TransferEngine {
    pub fn new(
        device_id: u32,
        slot: usize,
        memory: Arc<dyn DeviceMemory>,
        queue_depth: usize,
    ) -> Result<Self> {
        Ok(Self {
            device_id,
            d2h: CopyLane::spawn(
                device_id,
                slot,
                CopyDirection::DeviceToHost,
                Arc::clone(&memory),
                queue_depth,
            )?,
            h2d: CopyLane::spawn(
                device_id,
                slot,
                CopyDirection::HostToDevice,
                memory,
                queue_depth,
            )?,
        })
    }

    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Schedule an asynchronous device-to-host copy.
    ///
    /// # Safety
    /// `src` must be valid device memory and `dst` valid host memory for
    /// `bytes` bytes, both staying valid until
    /// [`wait_device_to_host`](Self::wait_device_to_host) returns.
    pub unsafe fn copy_device_to_host_async(&self, src: u64, bytes: usize, dst: u64) {
        unsafe { self.d2h.submit(src, dst, bytes) };
    }

    /// Schedule an asynchronous host-to-device copy.
    ///
    /// # Safety
    /// `src` must be valid host memory and `dst` valid device memory for
    /// `bytes` bytes, both staying valid until
    /// [`wait_host_to_device`](Self::wait_host_to_device) returns.
    pub unsafe fn copy_host_to_device_async(&self, src: u64, bytes: usize, dst: u64) {
        unsafe { self.h2d.submit(src, dst, bytes) };
    }

    /// Block until every issued device-to-host copy has completed.
    pub fn wait_device_to_host(&self) -> Result<()> {
        self.d2h.wait()
    }

    /// Block until every issued host-to-device copy has completed.
    pub fn wait_host_to_device(&self) -> Result<()> {
        self.h2d.wait()
    }
}
