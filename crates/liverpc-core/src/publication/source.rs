//! The live-query substrate seam.
//!
//! A publication resolver returns one or more [`LiveSource`]s. Observing a
//! source reports its current rows as `added` before `observe` returns, then
//! keeps reporting row changes until the returned [`StopHandle`] is stopped.

use crate::error::RpcError;
use crate::locks;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::{Arc, Mutex};

/// Field map of one row.
pub type Fields = Map<String, Value>;

/// The cursors returned by a publication resolver.
pub type Cursors = Vec<Arc<dyn LiveSource>>;

/// Receiver of row-level change callbacks.
///
/// Implementations must not block; they are called from the mutating code.
pub trait ChangeSink: Send + Sync + 'static {
    fn added(&self, id: &str, fields: Fields);

    /// `fields` holds changed values, `cleared` names removed fields.
    fn changed(&self, id: &str, fields: Fields, cleared: Vec<String>);

    fn removed(&self, id: &str);

    /// The source can no longer deliver changes.
    fn failed(&self, error: RpcError);
}

/// A server-side live result set.
#[async_trait]
pub trait LiveSource: Send + Sync + 'static {
    /// Start observing. Initial rows are reported through `sink` as `added`
    /// before this returns.
    async fn observe(&self, sink: Arc<dyn ChangeSink>) -> Result<StopHandle, RpcError>;
}

type StopFn = Box<dyn FnOnce() + Send>;

/// Releases an observation. Stopping is idempotent and also happens on drop.
pub struct StopHandle {
    stop: Mutex<Option<StopFn>>,
}

impl StopHandle {
    pub fn new<F>(stop: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            stop: Mutex::new(Some(Box::new(stop))),
        }
    }

    /// A handle with nothing to release.
    pub fn noop() -> Self {
        Self {
            stop: Mutex::new(None),
        }
    }

    pub fn stop(&self) {
        let stop = locks::lock(&self.stop).take();
        if let Some(stop) = stop {
            stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        locks::lock(&self.stop).is_none()
    }
}

impl Drop for StopHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for StopHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StopHandle")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_stop_runs_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handle = StopHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert!(!handle.is_stopped());
        handle.stop();
        handle.stop();
        assert!(handle.is_stopped());
        drop(handle);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_stops() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        drop(StopHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_noop_is_stopped() {
        assert!(StopHandle::noop().is_stopped());
    }
}
