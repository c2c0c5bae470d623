//! Device backend boundary
//!
//! Transports never talk to libusb directly. They drive a [`DeviceBackend`]
//! (claim, endpoint discovery, synchronous transfers, asynchronous
//! submission and cancellation) and rely on an [`EventSource`] polled by the
//! dispatcher to resolve asynchronous completions.

pub mod libusb;

use crate::error::Result;
use crate::request::Completion;
use std::sync::Arc;
use std::time::Duration;

pub use libusb::{DeviceSummary, RusbDevice, RusbEvents, UsbHost};

/// HID class request: SET_REPORT
pub const HID_SET_REPORT: u8 = 0x09;
/// HID class request: GET_REPORT
pub const HID_GET_REPORT: u8 = 0x01;

/// Class request addressed to the interface, host to device
pub const REQUEST_TYPE_CLASS_INTERFACE_OUT: u8 = 0x21;
/// Class request addressed to the interface, device to host
pub const REQUEST_TYPE_CLASS_INTERFACE_IN: u8 = 0xa1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    /// Direction encoded in bit 7 of an endpoint address
    pub fn of_address(address: u8) -> Self {
        if address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

/// Endpoint of the claimed interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub address: u8,
    pub direction: Direction,
    pub kind: EndpointKind,
    pub max_packet_size: u16,
}

impl EndpointDescriptor {
    pub fn new(address: u8, kind: EndpointKind, max_packet_size: u16) -> Self {
        Self {
            address,
            direction: Direction::of_address(address),
            kind,
            max_packet_size,
        }
    }
}

/// Setup packet fields of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    pub fn direction(&self) -> Direction {
        Direction::of_address(self.request_type)
    }
}

/// Endpoint and transfer type of one transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSetup {
    /// Default pipe (endpoint 0)
    Control(ControlSetup),
    Bulk { endpoint: u8 },
    Interrupt { endpoint: u8 },
}

impl TransferSetup {
    pub fn endpoint(&self) -> u8 {
        match self {
            TransferSetup::Control(_) => 0,
            TransferSetup::Bulk { endpoint } | TransferSetup::Interrupt { endpoint } => *endpoint,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            TransferSetup::Control(setup) => setup.direction(),
            TransferSetup::Bulk { endpoint } | TransferSetup::Interrupt { endpoint } => {
                Direction::of_address(*endpoint)
            }
        }
    }
}

/// Backend identifier of a submitted asynchronous transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AsyncHandle(pub u64);

/// An opened USB device as seen by a transport
pub trait DeviceBackend: Send + Sync {
    /// Claim the interface for exclusive use
    fn claim(&self) -> Result<()>;

    /// Release the interface; safe to call when nothing is claimed
    fn release(&self);

    /// Endpoints of the claimed interface
    fn endpoints(&self) -> Result<Vec<EndpointDescriptor>>;

    /// Blocking OUT transfer, returns the number of bytes accepted
    fn write_sync(&self, setup: &TransferSetup, data: &[u8], timeout: Duration) -> Result<usize>;

    /// Blocking IN transfer, returns the number of bytes received
    fn read_sync(&self, setup: &TransferSetup, buf: &mut [u8], timeout: Duration)
    -> Result<usize>;

    /// Submit an asynchronous transfer over `buffer`
    ///
    /// The backend owns `buffer` until it hands it back through
    /// [`Completion::resolve`], which must only happen while the event
    /// source is being polled.
    fn submit(
        &self,
        setup: TransferSetup,
        buffer: Vec<u8>,
        timeout: Duration,
        completion: Arc<Completion>,
    ) -> Result<AsyncHandle>;

    /// Request cancellation; the transfer still resolves (as cancelled)
    /// through the event source
    fn cancel(&self, handle: AsyncHandle) -> Result<()>;
}

/// Completion processing driven by the dispatcher
pub trait EventSource: Send + Sync {
    /// Process ready completions, waiting at most `timeout` for one
    fn poll_events(&self, timeout: Duration) -> Result<()>;
}
