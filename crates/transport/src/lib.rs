//! USB device transports for firmware download
//!
//! Blocking read/write over HID-class and bulk-class endpoints on top of an
//! asynchronous USB host backend, with an optional pipelined multi-request
//! mode that keeps several IN transfers in flight.
//!
//! - [`Transport`]: the blocking contract shared by every transport
//! - [`UsbTransport`]: session state and the multi-request queue
//! - [`HidTransport`] and [`BulkTransport`]: the two concrete transports
//! - [`MultiRequestScope`]: prepares a pipeline and frees it on drop
//! - [`spawn_dispatcher`]: the single thread resolving asynchronous transfers

pub mod backend;
pub mod bulk;
pub mod dispatcher;
pub mod error;
pub mod hid;
pub mod interface;
pub mod mock;
pub mod multi;
pub mod request;
pub mod usb;

pub use backend::{
    AsyncHandle, ControlSetup, DeviceBackend, DeviceSummary, Direction, EndpointDescriptor,
    EndpointKind, EventSource, RusbDevice, RusbEvents, TransferSetup, UsbHost,
};
pub use bulk::{BulkEndpoints, BulkTransport};
pub use dispatcher::{CancelToken, Dispatcher, spawn_dispatcher};
pub use error::{DeviceFault, Result, TransportError};
pub use hid::{HidLayout, HidTransport};
pub use interface::Transport;
pub use multi::MultiRequestScope;
pub use request::{Completion, CompletionState, TransferRequest, TransferStatus};
pub use usb::{PoolSpec, UsbTransport};
