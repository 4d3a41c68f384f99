use crate::types::{DataType, Device};

pub type Result<T> = std::result::Result<T, AllgradError>;

#[derive(Debug, thiserror::Error)]
pub enum AllgradError {
    #[error("tensor {index}: aggregation of sparse tensors is not supported")]
    SparseNotSupported { index: usize },

    #[error("tensor {index}: element count mismatch: input has {input}, output has {output}")]
    ElementCountMismatch {
        index: usize,
        input: usize,
        output: usize,
    },

    #[error("tensor {index}: data type mismatch: input is {input}, output is {output}")]
    DTypeMismatch {
        index: usize,
        input: DataType,
        output: DataType,
    },

    #[error("tensor {index}: device mismatch: input on {input}, output on {output}")]
    DeviceMismatch {
        index: usize,
        input: Device,
        output: Device,
    },

    #[error("values span multiple GPU devices: gpu:{first} and gpu:{second}")]
    MixedGpuDevices { first: u32, second: u32 },

    #[error("unsupported data type {dtype} for {op}")]
    UnsupportedDType { dtype: DataType, op: &'static str },

    #[error("{operation} is not implemented")]
    NotImplemented { operation: &'static str },

    #[error("pinned allocation of {bytes} bytes failed for device {device_id}: {reason}")]
    AllocationFailed {
        device_id: u32,
        bytes: usize,
        reason: String,
    },

    #[error("transfer engine for device {device_id} failed: {message}")]
    Transfer { device_id: u32, message: String },

    #[error("collective transport error: {message}")]
    Transport {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("internal lock poisoned: {0}")]
    LockPoisoned(&'static str),
}

impl AllgradError {
    /// Create a `Transport` error with just a message.
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport {
            message: msg.into(),
            source: None,
        }
    }

    /// Create a `Transport` error with a message and a source error.
    pub fn transport_with_source(
        msg: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: msg.into(),
            source: Some(Box::new(source)),
        }
    }
}
