//! HID transport
//!
//! Reports go out as SET_REPORT control transfers on the default pipe, or as
//! interrupt OUT transfers when the device exposes an alternate OUT endpoint.
//! Reads use the interrupt IN endpoint, falling back to GET_REPORT.

use crate::backend::{
    ControlSetup, DeviceBackend, Direction, EndpointKind, HID_GET_REPORT, HID_SET_REPORT,
    REQUEST_TYPE_CLASS_INTERFACE_IN, REQUEST_TYPE_CLASS_INTERFACE_OUT, TransferSetup,
};
use crate::error::{Result, TransportError};
use crate::interface::Transport;
use crate::usb::UsbTransport;
use common::{HidSettings, TransportConfig, UsbSettings};
use std::borrow::Cow;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::debug;

/// Report size used when neither configuration nor device provide one
pub const DEFAULT_REPORT_SIZE: usize = 64;

const REPORT_TYPE_INPUT: u16 = 0x01;
const REPORT_TYPE_OUTPUT: u16 = 0x02;

/// Framing learned when the device is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HidLayout {
    pub report_size: usize,
    pub in_endpoint: Option<u8>,
}

pub struct HidTransport {
    usb: UsbTransport,
    settings: HidSettings,
    /// Claimed interface, the wIndex of every class request
    interface: u8,
    layout: RwLock<Option<HidLayout>>,
}

impl Default for HidTransport {
    fn default() -> Self {
        Self::new(&TransportConfig::default())
    }
}

impl HidTransport {
    pub fn new(config: &TransportConfig) -> Self {
        Self::with_settings(&config.usb, config.hid.clone())
    }

    pub fn with_settings(usb: &UsbSettings, hid: HidSettings) -> Self {
        Self {
            usb: UsbTransport::new(usb),
            settings: hid,
            interface: usb.interface,
            layout: RwLock::new(None),
        }
    }

    /// Send reports as interrupt OUT transfers on `endpoint`
    pub fn set_out_endpoint(&mut self, endpoint: u8) {
        self.settings.out_endpoint = Some(endpoint);
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.settings.read_timeout_ms = timeout.as_millis() as u64;
    }

    pub fn layout(&self) -> Option<HidLayout> {
        *self.layout.read().unwrap_or_else(|e| e.into_inner())
    }

    pub fn report_size(&self) -> Result<usize> {
        self.layout()
            .map(|l| l.report_size)
            .ok_or(TransportError::NotOpen)
    }

    fn set_layout(&self, layout: Option<HidLayout>) {
        *self.layout.write().unwrap_or_else(|e| e.into_inner()) = layout;
    }

    /// Pad `buf` up to one report
    fn frame<'a>(&self, buf: &'a [u8], report_size: usize) -> Cow<'a, [u8]> {
        if self.settings.pad_reports && buf.len() < report_size {
            let mut report = vec![0u8; report_size];
            report[..buf.len()].copy_from_slice(buf);
            Cow::Owned(report)
        } else {
            Cow::Borrowed(buf)
        }
    }

    fn get_report_setup(&self) -> TransferSetup {
        TransferSetup::Control(ControlSetup {
            request_type: REQUEST_TYPE_CLASS_INTERFACE_IN,
            request: HID_GET_REPORT,
            value: REPORT_TYPE_INPUT << 8,
            index: self.interface as u16,
        })
    }
}

impl Transport for HidTransport {
    fn open(&self, device: Arc<dyn DeviceBackend>) -> Result<()> {
        self.usb.open(device)?;
        let endpoints = self.usb.endpoints()?;

        let in_endpoint = endpoints
            .iter()
            .find(|ep| ep.kind == EndpointKind::Interrupt && ep.direction == Direction::In);
        let report_size = self
            .settings
            .report_size
            .or_else(|| in_endpoint.map(|ep| ep.max_packet_size as usize))
            .filter(|size| *size > 0)
            .unwrap_or(DEFAULT_REPORT_SIZE);

        let layout = HidLayout {
            report_size,
            in_endpoint: in_endpoint.map(|ep| ep.address),
        };
        debug!("HID layout: {:?}", layout);
        self.set_layout(Some(layout));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.set_layout(None);
        self.usb.close()
    }

    fn is_open(&self) -> bool {
        self.usb.is_open()
    }

    /// Send one report; returns the payload length once the whole frame went out
    fn write(&self, buf: &[u8]) -> Result<usize> {
        let layout = self.layout().ok_or(TransportError::NotOpen)?;
        let frame = self.frame(buf, layout.report_size);

        let setup = match self.settings.out_endpoint {
            Some(endpoint) => TransferSetup::Interrupt { endpoint },
            None => TransferSetup::Control(ControlSetup {
                request_type: REQUEST_TYPE_CLASS_INTERFACE_OUT,
                request: HID_SET_REPORT,
                // Report id travels in the first byte of the report
                value: (REPORT_TYPE_OUTPUT << 8) | frame.first().copied().unwrap_or(0) as u16,
                index: self.interface as u16,
            }),
        };

        let written = self.usb.write_sync(&setup, &frame)?;
        if written < frame.len() {
            return Err(TransportError::ShortTransfer {
                expected: frame.len(),
                actual: written,
            });
        }
        debug!("HID report sent: {} bytes ({} payload)", frame.len(), buf.len());
        Ok(buf.len())
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let layout = self.layout().ok_or(TransportError::NotOpen)?;
        let setup = match layout.in_endpoint {
            Some(endpoint) => TransferSetup::Interrupt { endpoint },
            None => self.get_report_setup(),
        };
        self.usb.read_sync_timeout(&setup, buf, self.settings.read_timeout())
    }

    /// Pipeline GET_REPORT transfers on the default pipe
    fn prepare_multi(&self, size: usize, count: usize) -> Result<()> {
        self.usb.prepare_multi(size, count, self.get_report_setup())
    }

    fn free_multi(&self) -> Result<()> {
        self.usb.free_multi()
    }

    fn read_multi(&self, buf: &mut [u8]) -> Result<usize> {
        match self.usb.read_multi(buf)? {
            Some(n) => Ok(n),
            None => self.read(buf),
        }
    }

    fn multi_active(&self) -> bool {
        self.usb.multi_active()
    }

    fn queued(&self) -> usize {
        self.usb.queued()
    }
}
