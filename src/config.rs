//! Runtime-configurable tuning parameters for allgrad.
//!
//! All values have sensible defaults. Override via environment variables
//! (prefixed `ALLGRAD_`) or by constructing a custom `AllgradConfig`.

/// Tuning parameters for aggregation and device transfers.
#[derive(Debug, Clone)]
pub struct AllgradConfig {
    /// Bounded depth of each transfer-engine copy queue. Submitting more
    /// than this many copies to one direction without waiting blocks the
    /// submitter until the lane drains.
    pub copy_queue_depth: usize,

    /// Override for the host identity reported in the worker topology.
    /// When unset, the transport's own host name is used.
    pub host_name: Option<String>,
}

impl Default for AllgradConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl AllgradConfig {
    pub fn new() -> Self {
        Self {
            copy_queue_depth: 64,
            host_name: None,
        }
    }

    /// Load config from environment variables, falling back to defaults.
    ///
    /// Recognized variables:
    /// - `ALLGRAD_COPY_QUEUE_DEPTH`
    /// - `ALLGRAD_HOST_NAME`
    pub fn from_env() -> Self {
        let mut cfg = Self::new();

        if let Ok(v) = std::env::var("ALLGRAD_COPY_QUEUE_DEPTH") {
            if let Ok(n) = v.parse::<usize>() {
                if n > 0 {
                    cfg.copy_queue_depth = n;
                }
            }
        }
        if let Ok(v) = std::env::var("ALLGRAD_HOST_NAME") {
            if !v.is_empty() {
                cfg.host_name = Some(v);
            }
        }

        cfg
    }
}
