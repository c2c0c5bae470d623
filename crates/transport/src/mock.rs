//! Scripted in-memory backend for tests
//!
//! [`MockDevice`] implements both [`DeviceBackend`] and [`EventSource`]:
//! OUT transfers are recorded, IN transfers consume queued payloads, and
//! asynchronous submissions stay pending until `poll_events` finds data for
//! them, sees them cancelled, or their deadline passes.
//!
//! # Example
//!
//! ```
//! use transport::mock::MockDevice;
//! use transport::{BulkTransport, Transport};
//!
//! let device = MockDevice::bulk(512);
//! let bulk = BulkTransport::default();
//! bulk.open(device.clone()).unwrap();
//! bulk.write(&[0xaa; 16]).unwrap();
//! assert_eq!(device.writes().len(), 1);
//! ```

use crate::backend::{
    AsyncHandle, DeviceBackend, Direction, EndpointDescriptor, EndpointKind, EventSource,
    TransferSetup,
};
use crate::error::{DeviceFault, Result, TransportError};
use crate::request::{Completion, CompletionState, TransferStatus};
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

struct PendingTransfer {
    handle: AsyncHandle,
    setup: TransferSetup,
    buffer: Vec<u8>,
    completion: Arc<Completion>,
    deadline: Option<Instant>,
    cancelled: bool,
}

#[derive(Default)]
struct MockState {
    endpoints: Vec<EndpointDescriptor>,
    claim_error: Option<TransportError>,
    claimed: bool,
    claim_count: usize,
    release_count: usize,
    writes: Vec<(TransferSetup, Vec<u8>)>,
    reads: Vec<TransferSetup>,
    write_limit: Option<usize>,
    echo: bool,
    incoming: VecDeque<Vec<u8>>,
    pending: VecDeque<PendingTransfer>,
    next_handle: u64,
    submitted: usize,
    cancelled: usize,
    submit_budget: Option<usize>,
    completion_failures: VecDeque<TransferStatus>,
}

/// Scripted USB device
#[derive(Default)]
pub struct MockDevice {
    state: Mutex<MockState>,
    wake: Condvar,
}

impl MockDevice {
    pub fn new(endpoints: Vec<EndpointDescriptor>) -> Arc<Self> {
        let device = Self::default();
        device.lock().endpoints = endpoints;
        Arc::new(device)
    }

    /// HID device with one 64-byte interrupt IN endpoint
    pub fn hid() -> Arc<Self> {
        Self::new(vec![EndpointDescriptor::new(
            0x81,
            EndpointKind::Interrupt,
            64,
        )])
    }

    /// Bulk device with IN 0x81 and OUT 0x01 of the given packet size
    pub fn bulk(max_packet_size: u16) -> Arc<Self> {
        Self::new(vec![
            EndpointDescriptor::new(0x81, EndpointKind::Bulk, max_packet_size),
            EndpointDescriptor::new(0x01, EndpointKind::Bulk, max_packet_size),
        ])
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue data returned by the next IN transfer
    pub fn push_incoming(&self, data: impl Into<Vec<u8>>) {
        self.lock().incoming.push_back(data.into());
        self.wake.notify_all();
    }

    /// Feed every OUT payload back as IN data
    pub fn set_echo(&self, echo: bool) {
        self.lock().echo = echo;
    }

    pub fn fail_claim(&self, error: TransportError) {
        self.lock().claim_error = Some(error);
    }

    /// Accept at most `limit` bytes per OUT transfer
    pub fn limit_writes(&self, limit: usize) {
        self.lock().write_limit = Some(limit);
    }

    /// Allow `count` more submissions, then fail the rest
    pub fn limit_submissions(&self, count: usize) {
        self.lock().submit_budget = Some(count);
    }

    /// Resolve the next ready asynchronous transfer with `status`
    pub fn fail_next_completion(&self, status: TransferStatus) {
        self.lock().completion_failures.push_back(status);
        self.wake.notify_all();
    }

    pub fn writes(&self) -> Vec<(TransferSetup, Vec<u8>)> {
        self.lock().writes.clone()
    }

    /// Setups of every IN transfer, synchronous or submitted
    pub fn reads(&self) -> Vec<TransferSetup> {
        self.lock().reads.clone()
    }

    pub fn is_claimed(&self) -> bool {
        self.lock().claimed
    }

    pub fn claim_count(&self) -> usize {
        self.lock().claim_count
    }

    pub fn release_count(&self) -> usize {
        self.lock().release_count
    }

    /// Asynchronous transfers not resolved yet
    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn submitted(&self) -> usize {
        self.lock().submitted
    }

    pub fn cancelled(&self) -> usize {
        self.lock().cancelled
    }

    fn record_write(state: &mut MockState, setup: TransferSetup, data: &[u8]) -> usize {
        let accepted = state.write_limit.map_or(data.len(), |l| l.min(data.len()));
        state.writes.push((setup, data[..accepted].to_vec()));
        if state.echo && accepted > 0 {
            state.incoming.push_back(data[..accepted].to_vec());
        }
        accepted
    }

    /// Pick every pending transfer that can resolve now, oldest first
    fn take_ready(
        state: &mut MockState,
        now: Instant,
    ) -> Vec<(Arc<Completion>, Vec<u8>, CompletionState)> {
        let mut ready = Vec::new();
        let mut remaining = VecDeque::with_capacity(state.pending.len());

        while let Some(mut pending) = state.pending.pop_front() {
            let outcome = if pending.cancelled {
                Some(CompletionState::Failed(TransferStatus::Cancelled))
            } else if pending.setup.direction() == Direction::Out {
                let data = std::mem::take(&mut pending.buffer);
                let accepted = Self::record_write(state, pending.setup, &data);
                pending.buffer = data;
                Some(
                    state
                        .completion_failures
                        .pop_front()
                        .map_or(CompletionState::Done(accepted), CompletionState::Failed),
                )
            } else if let Some(status) = state.completion_failures.pop_front() {
                Some(CompletionState::Failed(status))
            } else if let Some(data) = state.incoming.pop_front() {
                let n = data.len().min(pending.buffer.len());
                pending.buffer[..n].copy_from_slice(&data[..n]);
                Some(CompletionState::Done(n))
            } else if pending.deadline.is_some_and(|d| now >= d) {
                Some(CompletionState::Failed(TransferStatus::TimedOut))
            } else {
                None
            };

            match outcome {
                Some(resolved) => ready.push((pending.completion, pending.buffer, resolved)),
                None => remaining.push_back(pending),
            }
        }

        state.pending = remaining;
        ready
    }
}

impl DeviceBackend for MockDevice {
    fn claim(&self) -> Result<()> {
        let mut state = self.lock();
        if let Some(err) = state.claim_error.clone() {
            return Err(err);
        }
        state.claimed = true;
        state.claim_count += 1;
        Ok(())
    }

    fn release(&self) {
        let mut state = self.lock();
        if state.claimed {
            state.claimed = false;
            state.release_count += 1;
        }
    }

    fn endpoints(&self) -> Result<Vec<EndpointDescriptor>> {
        Ok(self.lock().endpoints.clone())
    }

    fn write_sync(&self, setup: &TransferSetup, data: &[u8], _timeout: Duration) -> Result<usize> {
        let mut state = self.lock();
        let accepted = Self::record_write(&mut state, *setup, data);
        self.wake.notify_all();
        Ok(accepted)
    }

    fn read_sync(
        &self,
        setup: &TransferSetup,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        state.reads.push(*setup);
        loop {
            if let Some(data) = state.incoming.pop_front() {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                return Ok(n);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(TransportError::Timeout);
            }
            state = self
                .wake
                .wait_timeout(state, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    fn submit(
        &self,
        setup: TransferSetup,
        buffer: Vec<u8>,
        timeout: Duration,
        completion: Arc<Completion>,
    ) -> Result<AsyncHandle> {
        let mut state = self.lock();
        if let Some(budget) = state.submit_budget.as_mut() {
            *budget = budget.checked_sub(1).ok_or(DeviceFault::Io)?;
        }
        if setup.direction() == Direction::In {
            state.reads.push(setup);
        }

        state.next_handle += 1;
        let handle = AsyncHandle(state.next_handle);
        state.submitted += 1;
        state.pending.push_back(PendingTransfer {
            handle,
            setup,
            buffer,
            completion,
            deadline: (!timeout.is_zero()).then(|| Instant::now() + timeout),
            cancelled: false,
        });
        self.wake.notify_all();
        Ok(handle)
    }

    fn cancel(&self, handle: AsyncHandle) -> Result<()> {
        let mut state = self.lock();
        let mut found = false;
        for pending in state.pending.iter_mut().filter(|p| p.handle == handle) {
            pending.cancelled = true;
            found = true;
        }
        if found {
            state.cancelled += 1;
            self.wake.notify_all();
        }
        Ok(())
    }
}

impl EventSource for MockDevice {
    fn poll_events(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            let now = Instant::now();
            let ready = Self::take_ready(&mut state, now);
            if !ready.is_empty() {
                drop(state);
                for (completion, buffer, outcome) in ready {
                    completion.resolve(buffer, outcome);
                }
                return Ok(());
            }
            if now >= deadline {
                return Ok(());
            }
            // Re-check periodically so transfer deadlines are noticed.
            let wait = (deadline - now).min(Duration::from_millis(5));
            state = self
                .wake
                .wait_timeout(state, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}
