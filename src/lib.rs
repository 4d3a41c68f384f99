pub mod comm;
pub mod config;
pub mod device;
pub mod error;
mod handle;
pub mod staging;
pub mod tensor;
pub mod topology;
pub mod transfer;
pub mod transport;
pub mod types;

pub use comm::Communicator;
pub use config::AllgradConfig;
pub use device::{ComputeEvent, DeviceMemory, HostMemory, PinnedAllocator};
pub use error::{AllgradError, Result};
pub use handle::AggregateHandle;
pub use staging::{StagingBuffer, StagingPool};
pub use tensor::{Tensor, TensorView};
pub use topology::{WorkerDescriptor, WorkerTopology};
pub use transfer::TransferEngine;
pub use transport::{CollectiveTransport, LocalTransport, ReductionRequest};
pub use types::{DataType, Device, Rank, StorageFormat};
