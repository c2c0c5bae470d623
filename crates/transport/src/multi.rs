//! Scope guard around the multi-request pipeline

use crate::error::Result;
use crate::interface::Transport;
use tracing::{debug, warn};

/// Prepares a pipeline on construction and frees it when dropped
///
/// The guard only frees a pool it created itself. Wrapping a transport whose
/// pipeline is already active leaves that pipeline alone on both ends.
///
/// ```
/// use std::time::Duration;
/// use transport::mock::MockDevice;
/// use transport::{BulkTransport, CancelToken, MultiRequestScope, Transport, spawn_dispatcher};
///
/// let device = MockDevice::bulk(512);
/// let _dispatcher =
///     spawn_dispatcher(device.clone(), CancelToken::new(), Duration::from_millis(10)).unwrap();
/// let bulk = BulkTransport::default();
/// bulk.open(device).unwrap();
/// {
///     let _scope = MultiRequestScope::new(&bulk, 4096, 4).unwrap();
///     assert_eq!(bulk.queued(), 4);
/// }
/// assert_eq!(bulk.queued(), 0);
/// ```
pub struct MultiRequestScope<'a, T: Transport + ?Sized = dyn Transport> {
    transport: &'a T,
    owned: bool,
}

impl<'a, T: Transport + ?Sized> MultiRequestScope<'a, T> {
    pub fn new(transport: &'a T, size: usize, count: usize) -> Result<Self> {
        if transport.multi_active() {
            debug!("Pipeline already active, scope leaves it untouched");
            return Ok(Self {
                transport,
                owned: false,
            });
        }

        if let Err(e) = transport.prepare_multi(size, count) {
            if let Err(free_err) = transport.free_multi() {
                warn!("Failed to free partial pipeline: {}", free_err);
            }
            return Err(e);
        }
        Ok(Self {
            transport,
            owned: true,
        })
    }

    pub fn transport(&self) -> &'a T {
        self.transport
    }

    /// Whether dropping this scope frees the pipeline
    pub fn owns_pool(&self) -> bool {
        self.owned
    }

    /// Free the pipeline now and report the result
    pub fn finish(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if !std::mem::take(&mut self.owned) {
            return Ok(());
        }
        self.transport.free_multi()
    }
}

impl<T: Transport + ?Sized> Drop for MultiRequestScope<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!("Failed to free multi-request pipeline: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bulk::BulkTransport;
    use crate::dispatcher::{CancelToken, Dispatcher, spawn_dispatcher};
    use crate::error::TransportError;
    use crate::mock::MockDevice;
    use std::sync::Arc;
    use std::time::Duration;

    /// Field order matters: the transport closes while the dispatcher still runs
    struct Fixture {
        bulk: BulkTransport,
        device: Arc<MockDevice>,
        _dispatcher: Dispatcher,
    }

    fn open_bulk() -> Fixture {
        let device = MockDevice::bulk(512);
        let dispatcher =
            spawn_dispatcher(device.clone(), CancelToken::new(), Duration::from_millis(5))
                .unwrap();
        let bulk = BulkTransport::default();
        bulk.open(device.clone()).unwrap();
        Fixture {
            bulk,
            device,
            _dispatcher: dispatcher,
        }
    }

    #[test]
    fn test_finish_frees_once() {
        let f = open_bulk();
        let bulk = &f.bulk;
        let scope = MultiRequestScope::new(bulk, 64, 2).unwrap();
        assert!(scope.owns_pool());
        assert_eq!(bulk.queued(), 2);
        scope.finish().unwrap();
        assert_eq!(bulk.queued(), 0);
        assert!(!bulk.multi_active());
    }

    #[test]
    fn test_nested_scope_keeps_outer_pool() {
        let f = open_bulk();
        let bulk = &f.bulk;
        let outer = MultiRequestScope::new(bulk, 64, 3).unwrap();
        {
            let inner = MultiRequestScope::new(bulk, 128, 5).unwrap();
            assert!(!inner.owns_pool());
        }
        assert_eq!(bulk.queued(), 3);
        drop(outer);
        assert_eq!(bulk.queued(), 0);
    }

    #[test]
    fn test_failed_prepare_leaves_nothing() {
        let f = open_bulk();
        let bulk = &f.bulk;
        f.device.limit_submissions(0);
        let result = MultiRequestScope::new(bulk, 64, 2);
        assert!(matches!(result, Err(TransportError::Device(_))));
        assert_eq!(bulk.queued(), 0);
        assert!(!bulk.multi_active());
    }

    #[test]
    fn test_dyn_transport_scope() {
        let f = open_bulk();
        let bulk = &f.bulk;
        let transport: &dyn Transport = bulk;
        let scope: MultiRequestScope<'_> = MultiRequestScope::new(transport, 32, 1).unwrap();
        assert_eq!(scope.transport().queued(), 1);
    }
}
