//! Transport Integration Tests
//!
//! HID framing, bulk chunking and session lifecycle against the scripted
//! `MockDevice` backend.
//!
//! # Test Scenarios
//! - HID report padding, report id and alternate OUT endpoint
//! - HID read timeout on a silent device
//! - Bulk chunk sizes, ordering and zero-length packets
//! - Open/close/drop bookkeeping and errors after close
//!
//! Run with: `cargo test -p transport --test transport_tests`

use common::TransportConfig;
use std::sync::Arc;
use std::time::{Duration, Instant};
use transport::mock::MockDevice;
use transport::{
    BulkTransport, DeviceFault, EndpointDescriptor, EndpointKind, HidTransport, Transport,
    TransferSetup, TransportError,
};

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

fn open_bulk(packet_size: u16, max_transfer: usize, zlp: bool) -> (Arc<MockDevice>, BulkTransport) {
    let device = MockDevice::bulk(packet_size);
    let mut bulk = BulkTransport::default();
    bulk.set_max_transfer_size(max_transfer);
    bulk.set_send_zero_packet(zlp);
    bulk.open(device.clone()).unwrap();
    (device, bulk)
}

// ============================================================================
// HID Tests
// ============================================================================

#[test]
fn test_hid_round_trip_pads_to_report_size() {
    for size in [1, 2, 17, 63, 64] {
        let device = MockDevice::hid();
        device.set_echo(true);
        let hid = HidTransport::default();
        hid.open(device.clone()).unwrap();

        let payload = pattern(size);
        assert_eq!(hid.write(&payload).unwrap(), size);

        let mut report = [0xffu8; 64];
        let n = hid.read(&mut report).unwrap();
        assert_eq!(n, 64, "payload of {} bytes", size);
        assert_eq!(&report[..size], payload.as_slice());
        assert!(report[size..].iter().all(|b| *b == 0));
    }
}

#[test]
fn test_hid_alternate_out_endpoint() {
    let device = MockDevice::new(vec![
        EndpointDescriptor::new(0x81, EndpointKind::Interrupt, 64),
        EndpointDescriptor::new(0x02, EndpointKind::Interrupt, 64),
    ]);
    let mut hid = HidTransport::default();
    hid.set_out_endpoint(0x02);
    hid.open(device.clone()).unwrap();
    hid.write(&[0x01, 0x02]).unwrap();

    let writes = device.writes();
    assert_eq!(writes.len(), 1);
    assert_eq!(writes[0].0, TransferSetup::Interrupt { endpoint: 0x02 });
    assert_eq!(writes[0].1.len(), 64);
}

#[test]
fn test_hid_out_endpoint_from_config() {
    let mut config = TransportConfig::default();
    config.hid.out_endpoint = Some(0x03);
    let device = MockDevice::hid();
    let hid = HidTransport::new(&config);
    hid.open(device.clone()).unwrap();
    hid.write(&[0xaa]).unwrap();
    assert_eq!(device.writes()[0].0, TransferSetup::Interrupt { endpoint: 0x03 });
}

#[test]
fn test_hid_read_times_out_on_silent_device() {
    let hid = HidTransport::default();
    hid.open(MockDevice::hid()).unwrap();

    let start = Instant::now();
    let mut buf = [0u8; 64];
    assert_eq!(hid.read(&mut buf), Err(TransportError::Timeout));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(1000));
    assert!(elapsed < Duration::from_millis(2500));
}

#[test]
fn test_hid_read_timeout_override() {
    let mut hid = HidTransport::default();
    hid.set_read_timeout(Duration::from_millis(50));
    hid.open(MockDevice::hid()).unwrap();

    let start = Instant::now();
    let mut buf = [0u8; 64];
    assert_eq!(hid.read(&mut buf), Err(TransportError::Timeout));
    assert!(start.elapsed() < Duration::from_millis(1000));
}

#[test]
fn test_hid_get_report_without_interrupt_in() {
    let device = MockDevice::new(Vec::new());
    let hid = HidTransport::default();
    hid.open(device.clone()).unwrap();
    device.push_incoming(vec![9; 64]);

    let mut buf = vec![0u8; 64];
    assert_eq!(hid.read_vec(&mut buf).unwrap(), 64);
    assert_eq!(buf, vec![9; 64]);
}

#[test]
fn test_hid_short_write() {
    let device = MockDevice::hid();
    device.limit_writes(10);
    let hid = HidTransport::default();
    hid.open(device).unwrap();
    assert_eq!(
        hid.write(&[1, 2, 3]),
        Err(TransportError::ShortTransfer {
            expected: 64,
            actual: 10,
        })
    );
}

// ============================================================================
// Bulk Tests
// ============================================================================

#[test]
fn test_bulk_chunks_in_offset_order() {
    for (len, max) in [(1, 512), (512, 512), (513, 512), (5000, 1024), (4096, 4096), (10, 3)] {
        let (device, bulk) = open_bulk(512, max, false);
        let data = pattern(len);
        assert_eq!(bulk.write(&data).unwrap(), len);

        let writes = device.writes();
        assert_eq!(writes.len(), len.div_ceil(max), "len {} max {}", len, max);
        assert!(writes.iter().all(|(_, chunk)| chunk.len() <= max));
        assert!(
            writes
                .iter()
                .all(|(setup, _)| *setup == TransferSetup::Bulk { endpoint: 0x01 })
        );
        let joined: Vec<u8> = writes.into_iter().flat_map(|(_, chunk)| chunk).collect();
        assert_eq!(joined, data);
    }
}

#[test]
fn test_bulk_zero_packet_after_full_packets() {
    for (len, expect_zlp) in [(512, true), (2048, true), (1000, false), (1, false)] {
        let (device, bulk) = open_bulk(512, 4096, true);
        bulk.write(&pattern(len)).unwrap();

        let writes = device.writes();
        let zero_packets = writes.iter().filter(|(_, chunk)| chunk.is_empty()).count();
        assert_eq!(zero_packets, usize::from(expect_zlp), "len {}", len);
        if expect_zlp {
            assert!(writes.last().unwrap().1.is_empty());
        }
    }
}

#[test]
fn test_bulk_zero_packet_follows_total_length() {
    // Chunk limits that are not a multiple of the packet size
    for (max, len, expect_zlp) in [(1000, 1024, true), (700, 1212, false), (700, 1536, true)] {
        let (device, bulk) = open_bulk(512, max, true);
        assert_eq!(bulk.write(&pattern(len)).unwrap(), len);

        let writes = device.writes();
        let zero_packets = writes.iter().filter(|(_, chunk)| chunk.is_empty()).count();
        assert_eq!(zero_packets, usize::from(expect_zlp), "max {} len {}", max, len);

        let data: Vec<_> = writes.iter().filter(|(_, chunk)| !chunk.is_empty()).collect();
        assert!(data.iter().all(|(_, chunk)| chunk.len() <= max));
        let (_, tail) = data.split_last().unwrap();
        assert!(tail.iter().all(|(_, chunk)| chunk.len() % 512 == 0));
    }
}

#[test]
fn test_bulk_no_zero_packet_when_disabled() {
    let (device, bulk) = open_bulk(512, 4096, false);
    bulk.write(&pattern(1024)).unwrap();
    assert_eq!(device.writes().len(), 1);
}

#[test]
fn test_bulk_read_returns_actual_length() {
    let (device, bulk) = open_bulk(512, 4096, false);
    device.push_incoming(vec![3; 100]);
    let mut buf = vec![0u8; 512];
    assert_eq!(bulk.read_vec(&mut buf).unwrap(), 100);
    assert_eq!(buf.len(), 100);
}

#[test]
fn test_bulk_short_chunk() {
    let (device, bulk) = open_bulk(512, 1024, false);
    device.limit_writes(700);
    assert_eq!(
        bulk.write(&pattern(3000)),
        Err(TransportError::ShortTransfer {
            expected: 3000,
            actual: 700,
        })
    );
    assert_eq!(device.writes().len(), 1);
}

#[test]
fn test_bulk_missing_endpoint_closes_again() {
    let device = MockDevice::new(vec![
        EndpointDescriptor::new(0x81, EndpointKind::Bulk, 512),
        EndpointDescriptor::new(0x02, EndpointKind::Interrupt, 64),
    ]);
    let bulk = BulkTransport::default();
    assert_eq!(
        bulk.open(device.clone()),
        Err(TransportError::Device(DeviceFault::MissingEndpoint("bulk OUT")))
    );
    assert!(!bulk.is_open());
    assert!(!device.is_claimed());
    assert_eq!(device.release_count(), 1);
}

// ============================================================================
// Lifecycle Tests
// ============================================================================

#[test]
fn test_close_twice_then_not_open() {
    let (_device, bulk) = open_bulk(512, 4096, false);
    bulk.close().unwrap();
    bulk.close().unwrap();

    let mut buf = [0u8; 16];
    assert_eq!(bulk.write(&[1, 2, 3]), Err(TransportError::NotOpen));
    assert_eq!(bulk.read(&mut buf), Err(TransportError::NotOpen));
    assert_eq!(bulk.read_multi(&mut buf), Err(TransportError::NotOpen));
    assert_eq!(bulk.prepare_multi(64, 2), Err(TransportError::NotOpen));
    bulk.free_multi().unwrap();
}

#[test]
fn test_never_opened_transport() {
    let hid = HidTransport::default();
    hid.close().unwrap();
    assert!(!hid.is_open());
    assert_eq!(hid.write(&[0]), Err(TransportError::NotOpen));
}

#[test]
fn test_claim_failure() {
    let device = MockDevice::hid();
    device.fail_claim(DeviceFault::Busy.into());
    let hid = HidTransport::default();
    assert_eq!(
        hid.open(device.clone()),
        Err(TransportError::Device(DeviceFault::Busy))
    );
    assert!(!hid.is_open());
    assert_eq!(device.claim_count(), 0);
}

#[test]
fn test_drop_releases_exactly_once() {
    let device = MockDevice::hid();
    {
        let hid = HidTransport::default();
        hid.open(device.clone()).unwrap();
        hid.close().unwrap();
        hid.open(device.clone()).unwrap();
    }
    assert_eq!(device.claim_count(), 2);
    assert_eq!(device.release_count(), 2);
    assert!(!device.is_claimed());
}

#[test]
fn test_reopen_releases_previous_device() {
    let first = MockDevice::bulk(512);
    let second = MockDevice::bulk(64);
    let bulk = BulkTransport::default();
    bulk.open(first.clone()).unwrap();
    bulk.open(second.clone()).unwrap();

    assert!(!first.is_claimed());
    assert!(second.is_claimed());
    assert_eq!(bulk.bulk_endpoints().unwrap().ep_out.max_packet_size, 64);
}

#[test]
fn test_transports_behind_trait_objects() {
    let transports: Vec<(Arc<MockDevice>, Box<dyn Transport>)> = vec![
        (MockDevice::hid(), Box::new(HidTransport::default())),
        (MockDevice::bulk(512), Box::new(BulkTransport::default())),
    ];
    for (device, transport) in transports {
        transport.open(device.clone()).unwrap();
        transport.write_vec(vec![0x55; 8]).unwrap();
        assert_eq!(device.writes().len(), 1);
        transport.close().unwrap();
        assert!(!device.is_claimed());
    }
}
