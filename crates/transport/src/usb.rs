//! Generic USB transport
//!
//! [`UsbTransport`] holds the session state every concrete transport shares:
//! the claimed device, its endpoints, the transfer timeout and the queue of
//! asynchronous requests behind the multi-request pipeline.
//!
//! The pipeline keeps `count` transfers in flight. `read_multi` always drains
//! the oldest one, copies its data out and resubmits the recycled buffer at
//! the back of the queue, so the consumer works on completed data while the
//! remaining transfers are still running.
//!
//! Lock order is session, then queue. Nobody holds the queue lock while
//! blocked on a completion.

use crate::backend::{DeviceBackend, EndpointDescriptor, TransferSetup};
use crate::error::{DeviceFault, Result, TransportError};
use crate::request::{Completion, CompletionState, TransferRequest, WaitOutcome};
use common::UsbSettings;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Shape of an active multi-request pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSpec {
    pub size: usize,
    pub count: usize,
    pub setup: TransferSetup,
}

struct Session {
    device: Option<Arc<dyn DeviceBackend>>,
    endpoints: Vec<EndpointDescriptor>,
    timeout: Duration,
}

#[derive(Default)]
struct RequestQueue {
    requests: VecDeque<TransferRequest>,
    pool: Option<PoolSpec>,
}

pub struct UsbTransport {
    session: Mutex<Session>,
    queue: Mutex<RequestQueue>,
    default_timeout: Duration,
    cancel_timeout: Duration,
}

impl Default for UsbTransport {
    fn default() -> Self {
        Self::new(&UsbSettings::default())
    }
}

impl UsbTransport {
    pub fn new(settings: &UsbSettings) -> Self {
        Self::with_timeouts(settings.timeout(), settings.cancel_timeout())
    }

    pub fn with_timeouts(timeout: Duration, cancel_timeout: Duration) -> Self {
        Self {
            session: Mutex::new(Session {
                device: None,
                endpoints: Vec::new(),
                timeout,
            }),
            queue: Mutex::new(RequestQueue::default()),
            default_timeout: timeout,
            cancel_timeout,
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn queue(&self) -> MutexGuard<'_, RequestQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim `device`, discover its endpoints and reset the timeout
    ///
    /// An already open session is closed first.
    pub fn open(&self, device: Arc<dyn DeviceBackend>) -> Result<()> {
        self.close()?;

        device.claim()?;
        let endpoints = match device.endpoints() {
            Ok(endpoints) => endpoints,
            Err(e) => {
                device.release();
                return Err(e);
            }
        };
        debug!("Discovered {} endpoints", endpoints.len());

        let mut session = self.session();
        session.device = Some(device);
        session.endpoints = endpoints;
        session.timeout = self.default_timeout;
        info!("Transport opened");
        Ok(())
    }

    /// Cancel outstanding requests, release the device and reset the session
    ///
    /// Closing a closed transport is a no-op. A caller blocked in
    /// [`read_multi`](Self::read_multi) is released with `NotOpen`.
    pub fn close(&self) -> Result<()> {
        // The queue is emptied before the session lock drops, so a concurrent
        // prepare_multi either sees the device gone or has its requests taken here.
        let (device, requests) = {
            let mut session = self.session();
            session.endpoints.clear();
            let Some(device) = session.device.take() else {
                return Ok(());
            };
            (device, self.take_requests())
        };

        if !requests.is_empty() {
            debug!("Cancelling {} outstanding requests", requests.len());
            self.cancel_and_wait(device.as_ref(), requests);
        }

        device.release();
        info!("Transport closed");
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.session().device.is_some()
    }

    pub fn device(&self) -> Result<Arc<dyn DeviceBackend>> {
        self.session().device.clone().ok_or(TransportError::NotOpen)
    }

    pub fn endpoints(&self) -> Result<Vec<EndpointDescriptor>> {
        let session = self.session();
        if session.device.is_none() {
            return Err(TransportError::NotOpen);
        }
        Ok(session.endpoints.clone())
    }

    pub fn timeout(&self) -> Duration {
        self.session().timeout
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.session().timeout = timeout;
    }

    pub fn write_sync(&self, setup: &TransferSetup, data: &[u8]) -> Result<usize> {
        let (device, timeout) = self.device_and_timeout()?;
        device.write_sync(setup, data, timeout)
    }

    pub fn read_sync(&self, setup: &TransferSetup, buf: &mut [u8]) -> Result<usize> {
        let (device, timeout) = self.device_and_timeout()?;
        device.read_sync(setup, buf, timeout)
    }

    /// Synchronous IN transfer bounded by `timeout` instead of the session timeout
    pub fn read_sync_timeout(
        &self,
        setup: &TransferSetup,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        self.device()?.read_sync(setup, buf, timeout)
    }

    fn device_and_timeout(&self) -> Result<(Arc<dyn DeviceBackend>, Duration)> {
        let session = self.session();
        let device = session.device.clone().ok_or(TransportError::NotOpen)?;
        Ok((device, session.timeout))
    }

    /// Submit `count` asynchronous transfers of `size` bytes described by `setup`
    ///
    /// Does nothing while a pool is already active. On failure every request
    /// submitted so far is cancelled again. The session lock is held while
    /// submitting so `close` cannot release the device underneath.
    pub fn prepare_multi(&self, size: usize, count: usize, setup: TransferSetup) -> Result<()> {
        if size == 0 || count == 0 {
            return Err(TransportError::ResourceExhausted(format!(
                "cannot build a pool of {} requests of {} bytes",
                count, size
            )));
        }
        let session = self.session();
        let device = session.device.clone().ok_or(TransportError::NotOpen)?;
        let timeout = session.timeout;

        let mut queue = self.queue();
        if let Some(pool) = queue.pool {
            debug!("Multi-request pool already active: {:?}", pool);
            return Ok(());
        }

        for _ in 0..count {
            let submitted = allocate(size)
                .and_then(|buffer| submit(device.as_ref(), setup, buffer, timeout));
            match submitted {
                Ok(request) => queue.requests.push_back(request),
                Err(e) => {
                    let requests: Vec<_> = queue.requests.drain(..).collect();
                    drop(queue);
                    drop(session);
                    warn!(
                        "Multi-request setup failed after {} submissions: {}",
                        requests.len(),
                        e
                    );
                    self.cancel_and_wait(device.as_ref(), requests);
                    return Err(e);
                }
            }
        }

        queue.pool = Some(PoolSpec { size, count, setup });
        debug!(
            "Prepared {} requests of {} bytes on endpoint {:#04x}",
            count,
            size,
            setup.endpoint()
        );
        Ok(())
    }

    /// Cancel every outstanding request, then drop their buffers
    ///
    /// Idempotent; also fine when no pool was ever prepared.
    pub fn free_multi(&self) -> Result<()> {
        let requests = self.take_requests();
        if requests.is_empty() {
            return Ok(());
        }
        match self.session().device.clone() {
            Some(device) => self.cancel_and_wait(device.as_ref(), requests),
            // close() already cancelled everything it saw
            None => requests.iter().for_each(|r| r.completion.abandon()),
        }
        debug!("Multi-request pool freed");
        Ok(())
    }

    pub fn multi_active(&self) -> bool {
        self.queue().pool.is_some()
    }

    pub fn pool(&self) -> Option<PoolSpec> {
        self.queue().pool
    }

    /// Requests currently queued
    pub fn queued(&self) -> usize {
        self.queue().requests.len()
    }

    /// Drain the oldest queued request into `buf`
    ///
    /// Returns `Ok(None)` when the queue is empty so the caller can fall back
    /// to a synchronous read. While the pool is active the drained slot is
    /// resubmitted; a failed slot is not.
    pub fn read_multi(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        let (device, timeout) = self.device_and_timeout()?;

        let completion = match self.queue().requests.front() {
            Some(request) => request.completion.clone(),
            None => return Ok(None),
        };

        let outcome = completion.wait_for_drain();

        let mut queue = self.queue();
        let is_front = queue
            .requests
            .front()
            .is_some_and(|r| Arc::ptr_eq(&r.completion, &completion));
        if !is_front {
            drop(queue);
            return Err(if self.is_open() {
                DeviceFault::Cancelled.into()
            } else {
                TransportError::NotOpen
            });
        }
        let Some(request) = queue.requests.pop_front() else {
            return Ok(None);
        };

        let (state, mut buffer) = match outcome {
            WaitOutcome::Resolved { state, buffer } => (state, buffer),
            WaitOutcome::Abandoned | WaitOutcome::TimedOut => {
                return Err(DeviceFault::Cancelled.into());
            }
        };

        let completed = match state {
            CompletionState::Done(n) => n.min(buffer.len()),
            CompletionState::Failed(status) => {
                warn!(
                    "Pipelined transfer on endpoint {:#04x} failed: {:?}",
                    request.setup.endpoint(),
                    status
                );
                return Err(status.into());
            }
            CompletionState::Pending => {
                return Err(DeviceFault::Other("drained an unresolved transfer".into()).into());
            }
        };

        let n = completed.min(buf.len());
        buf[..n].copy_from_slice(&buffer[..n]);
        if n < completed {
            debug!("Caller buffer truncated pipelined data: {} of {}", n, completed);
        }

        if let Some(pool) = queue.pool {
            buffer.resize(pool.size, 0);
            match submit(device.as_ref(), request.setup, buffer, timeout) {
                Ok(next) => queue.requests.push_back(next),
                Err(e) => warn!(
                    "Resubmission failed, pipeline depth now {}: {}",
                    queue.requests.len(),
                    e
                ),
            }
        }

        Ok(Some(n))
    }

    fn take_requests(&self) -> Vec<TransferRequest> {
        let mut queue = self.queue();
        queue.pool = None;
        queue.requests.drain(..).collect()
    }

    /// Cancel first, then wait for each request to hand its buffer back
    ///
    /// The whole batch shares one `cancel_timeout`.
    fn cancel_and_wait(&self, device: &dyn DeviceBackend, requests: Vec<TransferRequest>) {
        for request in &requests {
            request.completion.abandon();
            if request.completion.is_pending()
                && let Err(e) = device.cancel(request.handle)
            {
                warn!("Failed to cancel transfer {:?}: {}", request.handle, e);
            }
        }

        let deadline = Instant::now() + self.cancel_timeout;
        for request in requests {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if let WaitOutcome::TimedOut = request.completion.wait_resolved(remaining) {
                // The backend keeps the buffer until the transfer resolves.
                warn!(
                    "Transfer {:?} not resolved within {:?} of cancellation",
                    request.handle, self.cancel_timeout
                );
            }
        }
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("Failed to close transport on drop: {}", e);
        }
    }
}

fn allocate(size: usize) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    buffer.try_reserve_exact(size).map_err(|e| {
        TransportError::ResourceExhausted(format!("allocating {} bytes: {}", size, e))
    })?;
    buffer.resize(size, 0);
    Ok(buffer)
}

fn submit(
    device: &dyn DeviceBackend,
    setup: TransferSetup,
    buffer: Vec<u8>,
    timeout: Duration,
) -> Result<TransferRequest> {
    let completion = Completion::new();
    let handle = device.submit(setup, buffer, timeout, completion.clone())?;
    Ok(TransferRequest {
        setup,
        handle,
        completion,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::EventSource;
    use crate::mock::MockDevice;

    const BULK_IN: TransferSetup = TransferSetup::Bulk { endpoint: 0x81 };

    /// Nothing polls the mock here, so cancellation is never confirmed
    fn unpolled() -> UsbTransport {
        UsbTransport::with_timeouts(Duration::from_secs(2), Duration::from_millis(10))
    }

    #[test]
    fn test_open_claims_and_close_releases() {
        let device = MockDevice::bulk(512);
        let usb = UsbTransport::default();
        usb.open(device.clone()).unwrap();
        assert!(usb.is_open());
        assert!(device.is_claimed());
        assert_eq!(usb.endpoints().unwrap().len(), 2);

        usb.close().unwrap();
        usb.close().unwrap();
        assert!(!usb.is_open());
        assert_eq!(device.release_count(), 1);
    }

    #[test]
    fn test_open_resets_timeout() {
        let usb = UsbTransport::with_timeouts(Duration::from_millis(300), Duration::from_millis(10));
        usb.open(MockDevice::bulk(512)).unwrap();
        usb.set_timeout(Duration::from_millis(5));
        usb.open(MockDevice::bulk(512)).unwrap();
        assert_eq!(usb.timeout(), Duration::from_millis(300));
    }

    #[test]
    fn test_prepare_rejects_empty_pool() {
        let usb = UsbTransport::default();
        usb.open(MockDevice::bulk(512)).unwrap();
        assert!(matches!(
            usb.prepare_multi(0, 4, BULK_IN),
            Err(TransportError::ResourceExhausted(_))
        ));
        assert!(matches!(
            usb.prepare_multi(64, 0, BULK_IN),
            Err(TransportError::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_prepare_requires_open() {
        let usb = UsbTransport::default();
        assert_eq!(
            usb.prepare_multi(64, 2, BULK_IN),
            Err(TransportError::NotOpen)
        );
    }

    #[test]
    fn test_prepare_twice_keeps_pool() {
        let device = MockDevice::bulk(512);
        let usb = unpolled();
        usb.open(device.clone()).unwrap();
        usb.prepare_multi(64, 3, BULK_IN).unwrap();
        usb.prepare_multi(128, 5, BULK_IN).unwrap();
        assert_eq!(usb.queued(), 3);
        assert_eq!(device.submitted(), 3);
        assert_eq!(usb.pool().map(|p| p.size), Some(64));
    }

    #[test]
    fn test_drain_resubmits_while_pool_active() {
        let device = MockDevice::bulk(512);
        let usb = unpolled();
        usb.open(device.clone()).unwrap();
        usb.prepare_multi(8, 2, BULK_IN).unwrap();

        device.push_incoming(vec![5; 8]);
        device.poll_events(Duration::from_millis(10)).unwrap();

        let mut buf = [0u8; 8];
        assert_eq!(usb.read_multi(&mut buf).unwrap(), Some(8));
        assert_eq!(buf, [5; 8]);
        assert_eq!(usb.queued(), 2);
        assert_eq!(device.submitted(), 3);
    }

    #[test]
    fn test_close_shares_one_cancel_deadline() {
        let device = MockDevice::bulk(512);
        let usb = UsbTransport::with_timeouts(Duration::from_secs(2), Duration::from_millis(200));
        usb.open(device.clone()).unwrap();
        usb.prepare_multi(64, 4, BULK_IN).unwrap();

        let start = Instant::now();
        usb.close().unwrap();
        assert!(start.elapsed() < Duration::from_millis(600));
        assert_eq!(device.cancelled(), 4);
        assert_eq!(usb.queued(), 0);
        assert!(!device.is_claimed());
    }

    #[test]
    fn test_read_multi_on_empty_queue() {
        let usb = UsbTransport::default();
        usb.open(MockDevice::bulk(512)).unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(usb.read_multi(&mut buf).unwrap(), None);
    }
}
