use crate::error::{AllgradError, Result};
use crate::tensor::Tensor;
use tokio::task::JoinHandle;

/// A handle to an aggregation running on a background task.
///
/// Call [`wait`](Self::wait) to obtain the aggregated outputs, or poll
/// [`is_finished`](Self::is_finished).
///
/// Dropping the handle does NOT cancel the aggregation: the collective
/// group has no cancellation protocol, so the task always runs to
/// completion and peers never observe a missing participant. The result
/// is simply discarded.
pub struct AggregateHandle {
    inner: Option<JoinHandle<Result<Vec<Tensor>>>>,
}

impl AggregateHandle {
    /// Run `f` on the blocking task pool and return a handle to it.
    ///
    /// Must be called from within a tokio runtime.
    pub(crate) fn spawn(f: impl FnOnce() -> Result<Vec<Tensor>> + Send + 'static) -> Self {
        Self {
            inner: Some(tokio::task::spawn_blocking(f)),
        }
    }

    /// Wait for the aggregation to complete and return its outputs.
    pub async fn wait(mut self) -> Result<Vec<Tensor>> {
        let handle = self
            .inner
            .take()
            .expect("AggregateHandle already consumed");
        handle.await.map_err(|e| {
            AllgradError::transport(format!("aggregation task panicked: {e}"))
        })?
    }

    /// Check if the aggregation has finished (non-blocking).
    pub fn is_finished(&self) -> bool {
        self.inner.as_ref().is_none_or(|h| h.is_finished())
    }
}
