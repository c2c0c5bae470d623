//! Bulk transport
//!
//! Streams data over the first bulk IN/OUT endpoint pair of the interface.
//! Writes are split into chunks of at most `max_transfer_size` bytes and can
//! be terminated by a zero-length packet.

use crate::backend::{DeviceBackend, Direction, EndpointDescriptor, EndpointKind, TransferSetup};
use crate::error::{DeviceFault, Result, TransportError};
use crate::interface::Transport;
use crate::usb::UsbTransport;
use common::{BulkSettings, TransportConfig, UsbSettings};
use std::sync::{Arc, RwLock};
use tracing::{debug, trace, warn};

/// Endpoint pair found at open
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkEndpoints {
    pub ep_in: EndpointDescriptor,
    pub ep_out: EndpointDescriptor,
}

impl BulkEndpoints {
    /// First bulk IN and first bulk OUT endpoint in descriptor order
    pub fn find(endpoints: &[EndpointDescriptor]) -> Result<Self> {
        let first = |direction| {
            endpoints
                .iter()
                .find(|ep| ep.kind == EndpointKind::Bulk && ep.direction == direction)
                .copied()
        };
        let ep_in = first(Direction::In).ok_or(DeviceFault::MissingEndpoint("bulk IN"))?;
        let ep_out = first(Direction::Out).ok_or(DeviceFault::MissingEndpoint("bulk OUT"))?;
        Ok(Self { ep_in, ep_out })
    }
}

pub struct BulkTransport {
    usb: UsbTransport,
    max_transfer_size: usize,
    send_zero_packet: bool,
    endpoints: RwLock<Option<BulkEndpoints>>,
}

impl Default for BulkTransport {
    fn default() -> Self {
        Self::new(&TransportConfig::default())
    }
}

impl BulkTransport {
    pub fn new(config: &TransportConfig) -> Self {
        Self::with_settings(&config.usb, &config.bulk)
    }

    pub fn with_settings(usb: &UsbSettings, bulk: &BulkSettings) -> Self {
        Self {
            usb: UsbTransport::with_timeouts(bulk.timeout(), usb.cancel_timeout()),
            max_transfer_size: bulk.max_transfer_size.max(1),
            send_zero_packet: bulk.send_zero_packet,
            endpoints: RwLock::new(None),
        }
    }

    pub fn set_send_zero_packet(&mut self, enabled: bool) {
        self.send_zero_packet = enabled;
    }

    pub fn set_max_transfer_size(&mut self, size: usize) {
        self.max_transfer_size = size.max(1);
    }

    pub fn max_transfer_size(&self) -> usize {
        self.max_transfer_size
    }

    pub fn bulk_endpoints(&self) -> Option<BulkEndpoints> {
        *self.endpoints.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Underlying USB session
    pub fn usb(&self) -> &UsbTransport {
        &self.usb
    }

    fn set_bulk_endpoints(&self, endpoints: Option<BulkEndpoints>) {
        *self.endpoints.write().unwrap_or_else(|e| e.into_inner()) = endpoints;
    }

    fn require_endpoints(&self) -> Result<BulkEndpoints> {
        self.bulk_endpoints().ok_or(TransportError::NotOpen)
    }
}

impl Transport for BulkTransport {
    fn open(&self, device: Arc<dyn DeviceBackend>) -> Result<()> {
        self.usb.open(device)?;
        let endpoints = match BulkEndpoints::find(&self.usb.endpoints()?) {
            Ok(endpoints) => endpoints,
            Err(e) => {
                if let Err(close_err) = self.usb.close() {
                    warn!("Failed to close after endpoint lookup: {}", close_err);
                }
                return Err(e);
            }
        };
        debug!(
            "Bulk endpoints: IN {:#04x} ({} bytes), OUT {:#04x} ({} bytes)",
            endpoints.ep_in.address,
            endpoints.ep_in.max_packet_size,
            endpoints.ep_out.address,
            endpoints.ep_out.max_packet_size
        );
        self.set_bulk_endpoints(Some(endpoints));
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.set_bulk_endpoints(None);
        self.usb.close()
    }

    fn is_open(&self) -> bool {
        self.usb.is_open()
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        let endpoints = self.require_endpoints()?;
        let setup = TransferSetup::Bulk {
            endpoint: endpoints.ep_out.address,
        };

        let packet_size = endpoints.ep_out.max_packet_size;
        let mut offset = 0;
        for chunk in buf.chunks(chunk_size(self.max_transfer_size, packet_size)) {
            let written = self.usb.write_sync(&setup, chunk)?;
            trace!("Bulk chunk at {}: {} of {} bytes", offset, written, chunk.len());
            if written < chunk.len() {
                return Err(TransportError::ShortTransfer {
                    expected: buf.len(),
                    actual: offset + written,
                });
            }
            offset += written;
        }

        if needs_zero_packet(self.send_zero_packet, buf.len(), packet_size) {
            debug!("Sending zero-length packet after {} bytes", buf.len());
            self.usb.write_sync(&setup, &[])?;
        }
        Ok(offset)
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let endpoints = self.require_endpoints()?;
        self.usb.read_sync(
            &TransferSetup::Bulk {
                endpoint: endpoints.ep_in.address,
            },
            buf,
        )
    }

    /// Pipeline bulk IN transfers
    fn prepare_multi(&self, size: usize, count: usize) -> Result<()> {
        let endpoints = self.require_endpoints()?;
        self.usb.prepare_multi(
            size,
            count,
            TransferSetup::Bulk {
                endpoint: endpoints.ep_in.address,
            },
        )
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

/// A non-empty transfer that fills whole packets needs an explicit terminator
pub fn needs_zero_packet(enabled: bool, len: usize, packet_size: u16) -> bool {
    enabled && packet_size > 0 && len > 0 && len % packet_size as usize == 0
}

/// Largest chunk not above `max_transfer_size` that ends on a packet boundary
///
/// A limit below one packet is used as is.
pub fn chunk_size(max_transfer_size: usize, packet_size: u16) -> usize {
    let packet = packet_size as usize;
    if packet == 0 || max_transfer_size < packet {
        return max_transfer_size.max(1);
    }
    max_transfer_size / packet * packet
}
