//! libusb backend
//!
//! Synchronous transfers go through `rusb::DeviceHandle`. Asynchronous
//! transfers use the raw libusb API re-exported as `rusb::ffi`: each
//! submission leaks a boxed [`InFlight`] record into the transfer's user data,
//! and `transfer_finished` reclaims it when libusb reports completion from
//! inside `handle_events`, i.e. on the dispatcher thread.

use super::{
    AsyncHandle, DeviceBackend, Direction, EndpointDescriptor, EndpointKind, EventSource,
    TransferSetup,
};
use crate::error::{DeviceFault, Result, TransportError};
use crate::request::{Completion, CompletionState, TransferStatus};
use libc::{c_int, c_uint, c_void};
use rusb::constants::*;
use rusb::ffi::{
    libusb_alloc_transfer, libusb_cancel_transfer, libusb_fill_bulk_transfer,
    libusb_fill_control_setup, libusb_fill_control_transfer, libusb_fill_interrupt_transfer,
    libusb_free_transfer, libusb_submit_transfer, libusb_transfer,
};
use rusb::{Context, DeviceHandle, UsbContext};
use std::collections::HashMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Summary of an attached device, for enumeration output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub bus_number: u8,
    pub address: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// libusb context shared by device lookups and the dispatcher
pub struct UsbHost {
    context: Context,
}

impl UsbHost {
    pub fn new() -> Result<Self> {
        Ok(Self {
            context: Context::new()?,
        })
    }

    /// Enumerate attached devices, optionally restricted to one VID/PID
    pub fn devices(&self, filter: Option<(u16, Option<u16>)>) -> Result<Vec<DeviceSummary>> {
        let mut found = Vec::new();
        for device in self.context.devices()?.iter() {
            let descriptor = match device.device_descriptor() {
                Ok(d) => d,
                Err(e) => {
                    debug!(
                        "Skipping device {}:{}: {}",
                        device.bus_number(),
                        device.address(),
                        e
                    );
                    continue;
                }
            };

            if let Some((vid, pid)) = filter {
                if descriptor.vendor_id() != vid {
                    continue;
                }
                if pid.is_some_and(|pid| descriptor.product_id() != pid) {
                    continue;
                }
            }

            found.push(DeviceSummary {
                bus_number: device.bus_number(),
                address: device.address(),
                vendor_id: descriptor.vendor_id(),
                product_id: descriptor.product_id(),
            });
        }
        debug!("Enumerated {} devices", found.len());
        Ok(found)
    }

    /// Open the first device matching `vendor_id:product_id`
    ///
    /// The interface is not claimed until a transport opens the device.
    pub fn open(&self, vendor_id: u16, product_id: u16, interface: u8) -> Result<Arc<RusbDevice>> {
        let handle = self
            .context
            .open_device_with_vid_pid(vendor_id, product_id)
            .ok_or(DeviceFault::NotFound)?;
        info!(
            "Opened device {:04x}:{:04x} (interface {})",
            vendor_id, product_id, interface
        );
        Ok(Arc::new(RusbDevice::new(handle, interface)))
    }

    /// Event source for the dispatcher
    pub fn events(&self) -> Arc<RusbEvents> {
        Arc::new(RusbEvents {
            context: self.context.clone(),
        })
    }
}

/// Drives libusb completion callbacks
pub struct RusbEvents {
    context: Context,
}

impl EventSource for RusbEvents {
    fn poll_events(&self, timeout: Duration) -> Result<()> {
        self.context.handle_events(Some(timeout))?;
        Ok(())
    }
}

struct TransferPtr(NonNull<libusb_transfer>);

// SAFETY: the pointer is only dereferenced while the in-flight map lock is held
// or from the completion callback after the entry was removed under that lock.
unsafe impl Send for TransferPtr {}

struct Inner {
    handle: DeviceHandle<Context>,
    interface: u8,
    claimed: AtomicBool,
    detached_kernel_driver: AtomicBool,
    next_id: AtomicU64,
    in_flight: Mutex<HashMap<u64, TransferPtr>>,
}

impl Inner {
    fn release(&self) {
        if !self.claimed.swap(false, Ordering::SeqCst) {
            return;
        }
        if let Err(e) = self.handle.release_interface(self.interface) {
            warn!("Failed to release interface {}: {}", self.interface, e);
        }
        if self.detached_kernel_driver.swap(false, Ordering::SeqCst)
            && let Err(e) = self.handle.attach_kernel_driver(self.interface)
        {
            debug!(
                "Could not reattach kernel driver to interface {}: {}",
                self.interface, e
            );
        }
        debug!("Released interface {}", self.interface);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Record owned by libusb while a transfer is in flight
struct InFlight {
    id: u64,
    buffer: Vec<u8>,
    control: bool,
    completion: Arc<Completion>,
    owner: Arc<Inner>,
}

/// A device opened through libusb
pub struct RusbDevice {
    inner: Arc<Inner>,
}

impl RusbDevice {
    fn new(handle: DeviceHandle<Context>, interface: u8) -> Self {
        Self {
            inner: Arc::new(Inner {
                handle,
                interface,
                claimed: AtomicBool::new(false),
                detached_kernel_driver: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of submitted transfers libusb has not completed yet
    pub fn in_flight(&self) -> usize {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl DeviceBackend for RusbDevice {
    fn claim(&self) -> Result<()> {
        if self.inner.claimed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let handle = &self.inner.handle;
        let interface = self.inner.interface;

        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                match handle.detach_kernel_driver(interface) {
                    Ok(()) => self
                        .inner
                        .detached_kernel_driver
                        .store(true, Ordering::SeqCst),
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {}
            Err(e) => debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            ),
        }

        handle.claim_interface(interface).map_err(|e| {
            warn!("Failed to claim interface {}: {}", interface, e);
            TransportError::from(e)
        })?;
        self.inner.claimed.store(true, Ordering::SeqCst);
        debug!("Claimed interface {}", interface);
        Ok(())
    }

    fn release(&self) {
        self.inner.release();
    }

    fn endpoints(&self) -> Result<Vec<EndpointDescriptor>> {
        let config = self.inner.handle.device().active_config_descriptor()?;
        let interface = config
            .interfaces()
            .find(|i| i.number() == self.inner.interface)
            .ok_or(DeviceFault::NotFound)?;
        let Some(alt) = interface.descriptors().next() else {
            return Ok(Vec::new());
        };

        Ok(alt
            .endpoint_descriptors()
            .map(|ep| {
                let kind = match ep.transfer_type() {
                    rusb::TransferType::Control => EndpointKind::Control,
                    rusb::TransferType::Isochronous => EndpointKind::Isochronous,
                    rusb::TransferType::Bulk => EndpointKind::Bulk,
                    rusb::TransferType::Interrupt => EndpointKind::Interrupt,
                };
                EndpointDescriptor::new(ep.address(), kind, ep.max_packet_size())
            })
            .collect())
    }

    fn write_sync(&self, setup: &TransferSetup, data: &[u8], timeout: Duration) -> Result<usize> {
        let handle = &self.inner.handle;
        let written = match *setup {
            TransferSetup::Control(c) => {
                handle.write_control(c.request_type, c.request, c.value, c.index, data, timeout)?
            }
            TransferSetup::Bulk { endpoint } => handle.write_bulk(endpoint, data, timeout)?,
            TransferSetup::Interrupt { endpoint } => {
                handle.write_interrupt(endpoint, data, timeout)?
            }
        };
        Ok(written)
    }

    fn read_sync(
        &self,
        setup: &TransferSetup,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize> {
        let handle = &self.inner.handle;
        let read = match *setup {
            TransferSetup::Control(c) => {
                handle.read_control(c.request_type, c.request, c.value, c.index, buf, timeout)?
            }
            TransferSetup::Bulk { endpoint } => handle.read_bulk(endpoint, buf, timeout)?,
            TransferSetup::Interrupt { endpoint } => handle.read_interrupt(endpoint, buf, timeout)?,
        };
        Ok(read)
    }

    fn submit(
        &self,
        setup: TransferSetup,
        buffer: Vec<u8>,
        timeout: Duration,
        completion: Arc<Completion>,
    ) -> Result<AsyncHandle> {
        let control = matches!(setup, TransferSetup::Control(_));
        let mut buffer = buffer;
        if let TransferSetup::Control(c) = setup {
            let length = u16::try_from(buffer.len()).map_err(|_| DeviceFault::InvalidParam)?;
            let mut framed = vec![0u8; LIBUSB_CONTROL_SETUP_SIZE + buffer.len()];
            if c.direction() == Direction::Out {
                framed[LIBUSB_CONTROL_SETUP_SIZE..].copy_from_slice(&buffer);
            }
            // SAFETY: framed holds at least LIBUSB_CONTROL_SETUP_SIZE bytes.
            unsafe {
                libusb_fill_control_setup(
                    framed.as_mut_ptr(),
                    c.request_type,
                    c.request,
                    c.value,
                    c.index,
                    length,
                );
            }
            buffer = framed;
        }
        let length = c_int::try_from(buffer.len()).map_err(|_| DeviceFault::InvalidParam)?;

        // SAFETY: plain allocation, checked for NULL below.
        let transfer = NonNull::new(unsafe { libusb_alloc_transfer(0) }).ok_or_else(|| {
            TransportError::ResourceExhausted("libusb_alloc_transfer failed".to_string())
        })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut record = Box::new(InFlight {
            id,
            buffer,
            control,
            completion,
            owner: self.inner.clone(),
        });
        let data = record.buffer.as_mut_ptr();
        let user_data = Box::into_raw(record) as *mut c_void;
        let device = self.inner.handle.as_raw();
        let timeout = timeout.as_millis().min(c_uint::MAX as u128) as c_uint;

        // SAFETY: transfer, device and data are valid; data stays allocated
        // until transfer_finished reclaims the record that owns it.
        unsafe {
            match setup {
                TransferSetup::Control(_) => libusb_fill_control_transfer(
                    transfer.as_ptr(),
                    device,
                    data,
                    transfer_finished as _,
                    user_data,
                    timeout,
                ),
                TransferSetup::Bulk { endpoint } => libusb_fill_bulk_transfer(
                    transfer.as_ptr(),
                    device,
                    endpoint,
                    data,
                    length,
                    transfer_finished as _,
                    user_data,
                    timeout,
                ),
                TransferSetup::Interrupt { endpoint } => libusb_fill_interrupt_transfer(
                    transfer.as_ptr(),
                    device,
                    endpoint,
                    data,
                    length,
                    transfer_finished as _,
                    user_data,
                    timeout,
                ),
            }
        }

        let mut in_flight = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        // SAFETY: the transfer was filled above.
        let rc = unsafe { libusb_submit_transfer(transfer.as_ptr()) };
        if rc != LIBUSB_SUCCESS {
            // SAFETY: libusb rejected the transfer, so the callback will never
            // run and the record is still ours.
            unsafe {
                drop(Box::from_raw(user_data as *mut InFlight));
                libusb_free_transfer(transfer.as_ptr());
            }
            return Err(libusb_error(rc));
        }
        in_flight.insert(id, TransferPtr(transfer));
        debug!(
            "Submitted transfer {} on endpoint {:#04x} ({} bytes)",
            id,
            setup.endpoint(),
            length
        );
        Ok(AsyncHandle(id))
    }

    fn cancel(&self, handle: AsyncHandle) -> Result<()> {
        let in_flight = self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        let Some(transfer) = in_flight.get(&handle.0) else {
            // Already completed
            return Ok(());
        };
        // SAFETY: the entry is removed under this lock before the transfer is
        // freed, so the pointer is live while we hold it.
        let rc = unsafe { libusb_cancel_transfer(transfer.0.as_ptr()) };
        match rc {
            LIBUSB_SUCCESS | LIBUSB_ERROR_NOT_FOUND => Ok(()),
            rc => Err(libusb_error(rc)),
        }
    }
}

extern "system" fn transfer_finished(transfer: *mut libusb_transfer) {
    if transfer.is_null() {
        return;
    }
    // SAFETY: libusb passes back the transfer we submitted.
    let (user_data, status, actual_length) =
        unsafe { ((*transfer).user_data, (*transfer).status, (*transfer).actual_length) };
    if user_data.is_null() {
        return;
    }
    // SAFETY: user_data is the record leaked in submit, reclaimed exactly once here.
    let record = unsafe { Box::from_raw(user_data as *mut InFlight) };
    record
        .owner
        .in_flight
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&record.id);
    // SAFETY: no other reference to the transfer remains.
    unsafe { libusb_free_transfer(transfer) };

    let InFlight {
        mut buffer,
        control,
        completion,
        ..
    } = *record;
    if control && buffer.len() >= LIBUSB_CONTROL_SETUP_SIZE {
        buffer.drain(..LIBUSB_CONTROL_SETUP_SIZE);
    }

    let state = match status {
        LIBUSB_TRANSFER_COMPLETED => CompletionState::Done(actual_length.max(0) as usize),
        LIBUSB_TRANSFER_TIMED_OUT => CompletionState::Failed(TransferStatus::TimedOut),
        LIBUSB_TRANSFER_CANCELLED => CompletionState::Failed(TransferStatus::Cancelled),
        LIBUSB_TRANSFER_STALL => CompletionState::Failed(TransferStatus::Stall),
        LIBUSB_TRANSFER_NO_DEVICE => CompletionState::Failed(TransferStatus::NoDevice),
        LIBUSB_TRANSFER_OVERFLOW => CompletionState::Failed(TransferStatus::Overflow),
        _ => CompletionState::Failed(TransferStatus::Error),
    };
    completion.resolve(buffer, state);
}

fn libusb_error(rc: c_int) -> TransportError {
    match rc {
        LIBUSB_ERROR_TIMEOUT => TransportError::Timeout,
        LIBUSB_ERROR_NO_MEM => {
            TransportError::ResourceExhausted("libusb out of memory".to_string())
        }
        LIBUSB_ERROR_NO_DEVICE => DeviceFault::NoDevice.into(),
        LIBUSB_ERROR_BUSY => DeviceFault::Busy.into(),
        LIBUSB_ERROR_PIPE => DeviceFault::Stall.into(),
        LIBUSB_ERROR_INVALID_PARAM => DeviceFault::InvalidParam.into(),
        LIBUSB_ERROR_NOT_FOUND => DeviceFault::NotFound.into(),
        LIBUSB_ERROR_ACCESS => DeviceFault::Access.into(),
        LIBUSB_ERROR_IO => DeviceFault::Io.into(),
        LIBUSB_ERROR_OVERFLOW => DeviceFault::Overflow.into(),
        rc => DeviceFault::Other(format!("libusb error {}", rc)).into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_libusb_error_mapping() {
        assert_eq!(libusb_error(LIBUSB_ERROR_TIMEOUT), TransportError::Timeout);
        assert_eq!(
            libusb_error(LIBUSB_ERROR_PIPE),
            TransportError::Device(DeviceFault::Stall)
        );
        assert!(matches!(
            libusb_error(LIBUSB_ERROR_NO_MEM),
            TransportError::ResourceExhausted(_)
        ));
        assert!(matches!(
            libusb_error(-42),
            TransportError::Device(DeviceFault::Other(_))
        ));
    }

    #[test]
    fn test_host_creation() {
        // Context creation may fail without USB access
        match UsbHost::new() {
            Ok(host) => {
                let _ = host.devices(None);
            }
            Err(e) => eprintln!("USB context unavailable (expected in sandboxes): {}", e),
        }
    }
}
