//! In-flight transfer records
//!
//! A [`TransferRequest`] tracks one asynchronous transfer from submission until
//! a draining caller consumes it. The data buffer travels with the transfer:
//! the backend owns it while the device may still write into it and hands it
//! back through [`Completion::resolve`], which is only ever called from the
//! dispatcher's event-processing path.

use crate::backend::{AsyncHandle, TransferSetup};
use crate::error::{DeviceFault, TransportError};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::warn;

/// Terminal status of a transfer that did not complete
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Error,
    TimedOut,
    Cancelled,
    Stall,
    NoDevice,
    Overflow,
}

impl From<TransferStatus> for TransportError {
    fn from(status: TransferStatus) -> Self {
        match status {
            TransferStatus::TimedOut => TransportError::Timeout,
            TransferStatus::Cancelled => DeviceFault::Cancelled.into(),
            TransferStatus::Stall => DeviceFault::Stall.into(),
            TransferStatus::NoDevice => DeviceFault::NoDevice.into(),
            TransferStatus::Overflow => DeviceFault::Overflow.into(),
            TransferStatus::Error => DeviceFault::Io.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionState {
    Pending,
    /// Completed with this many bytes transferred
    Done(usize),
    Failed(TransferStatus),
}

struct Slot {
    state: CompletionState,
    buffer: Option<Vec<u8>>,
    abandoned: bool,
}

/// Result of waiting on a [`Completion`]
#[derive(Debug)]
pub enum WaitOutcome {
    Resolved {
        state: CompletionState,
        buffer: Vec<u8>,
    },
    /// The owning session went away before the transfer resolved
    Abandoned,
    TimedOut,
}

/// Completion state of one asynchronous transfer, written exactly once
pub struct Completion {
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl Completion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(Slot {
                state: CompletionState::Pending,
                buffer: None,
                abandoned: false,
            }),
            ready: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record the final state and return the buffer to the transport
    ///
    /// Backends call this from inside `EventSource::poll_events`. A second
    /// resolution is ignored.
    pub fn resolve(&self, buffer: Vec<u8>, state: CompletionState) {
        let mut slot = self.lock();
        if slot.state != CompletionState::Pending {
            warn!(
                "Ignoring second resolution ({:?}) of completed transfer ({:?})",
                state, slot.state
            );
            return;
        }
        if state == CompletionState::Pending {
            warn!("Transfer resolved without a terminal state, treating as error");
            slot.state = CompletionState::Failed(TransferStatus::Error);
        } else {
            slot.state = state;
        }
        slot.buffer = Some(buffer);
        self.ready.notify_all();
    }

    pub fn state(&self) -> CompletionState {
        self.lock().state
    }

    pub fn is_pending(&self) -> bool {
        self.state() == CompletionState::Pending
    }

    /// Wake a blocked drain without touching the completion state
    pub(crate) fn abandon(&self) {
        let mut slot = self.lock();
        slot.abandoned = true;
        self.ready.notify_all();
    }

    /// Block until the transfer resolves or the session abandons it
    pub(crate) fn wait_for_drain(&self) -> WaitOutcome {
        let mut slot = self.lock();
        loop {
            if slot.state != CompletionState::Pending {
                return take_resolved(&mut slot);
            }
            if slot.abandoned {
                return WaitOutcome::Abandoned;
            }
            slot = self.ready.wait(slot).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block until the transfer resolves, ignoring abandonment
    pub(crate) fn wait_resolved(&self, timeout: Duration) -> WaitOutcome {
        let deadline = Instant::now() + timeout;
        let mut slot = self.lock();
        loop {
            if slot.state != CompletionState::Pending {
                return take_resolved(&mut slot);
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            slot = self
                .ready
                .wait_timeout(slot, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

fn take_resolved(slot: &mut Slot) -> WaitOutcome {
    WaitOutcome::Resolved {
        state: slot.state,
        buffer: slot.buffer.take().unwrap_or_default(),
    }
}

/// One outstanding asynchronous transfer in a session queue
pub struct TransferRequest {
    pub(crate) setup: TransferSetup,
    pub(crate) handle: AsyncHandle,
    pub(crate) completion: Arc<Completion>,
}

impl TransferRequest {
    pub fn setup(&self) -> &TransferSetup {
        &self.setup
    }

    pub fn handle(&self) -> AsyncHandle {
        self.handle
    }

    pub fn state(&self) -> CompletionState {
        self.completion.state()
    }
}

impl std::fmt::Debug for TransferRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferRequest")
            .field("setup", &self.setup)
            .field("handle", &self.handle)
            .field("state", &self.state())
            .finish()
    }
}
