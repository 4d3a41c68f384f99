mod host;
mod memory;

pub use host::HostMemory;
pub use memory::{ComputeEvent, DeviceMemory, PinnedAllocator};
