//! Block-device contract tests across the shipped implementations

use std::sync::Arc;

use mcufs::blockdevice::BlockDevice;
use mcufs::{FlashDevice, HeapDevice, RamFlash};
use mcufs_sd::mock::MockCard;
use mcufs_sd::{SdConfig, SdDevice};

/// erase + program + read yields the programmed bytes, for every aligned
/// window of the device
fn assert_round_trip(device: &dyn BlockDevice) {
    device.init().unwrap();
    let geometry = device.geometry();
    let chunk = geometry.erase_size.max(geometry.program_size);

    for index in 0..4u8 {
        let addr = (index as u64) * chunk as u64;
        let data: Vec<u8> = (0..chunk).map(|i| (i as u8) ^ (index * 37)).collect();

        device.erase(addr, chunk as u64).unwrap();
        device.program(&data, addr).unwrap();

        let mut out = vec![0u8; chunk];
        device.read(&mut out, addr).unwrap();
        assert_eq!(out, data);
    }
}

#[test]
fn test_heap_round_trip() {
    let device = HeapDevice::new(64 * 1024).unwrap();
    assert_round_trip(&device);
}

#[test]
fn test_flash_round_trip() {
    let device = FlashDevice::new(RamFlash::new(256 * 1024), 0, 0).unwrap();
    assert_round_trip(&device);
}

#[test]
fn test_flash_window_round_trip() {
    let device = FlashDevice::new(RamFlash::new(256 * 1024), 128 * 1024, 0).unwrap();
    assert_eq!(device.size(), 128 * 1024);
    assert_round_trip(&device);
}

#[test]
fn test_sd_round_trip() {
    let device = SdDevice::new(MockCard::new_default(), SdConfig::default());
    assert_round_trip(&device);
}

#[test]
fn test_geometry_invariants() {
    let devices: Vec<Arc<dyn BlockDevice>> = vec![
        Arc::new(HeapDevice::new(64 * 1024).unwrap()),
        Arc::new(FlashDevice::new(RamFlash::new(256 * 1024), 0, 0).unwrap()),
        Arc::new(SdDevice::new(MockCard::new_default(), SdConfig::default())),
    ];
    for device in devices {
        device.init().unwrap();
        let geometry = device.geometry();
        assert!(geometry.read_size > 0);
        assert!(geometry.program_size >= geometry.read_size);
        assert!(geometry.erase_size >= geometry.program_size);
        assert_eq!(geometry.program_size % geometry.read_size, 0);
        assert_eq!(geometry.erase_size % geometry.program_size, 0);
        assert_eq!(device.size() % geometry.erase_size as u64, 0);
        assert!(device.is_initialized());
        device.sync().unwrap();
        device.trim(0, device.size()).unwrap();
    }
}

#[test]
fn test_concurrent_access_to_one_device_serializes() {
    let device = Arc::new(HeapDevice::new(256 * 1024).unwrap());
    device.init().unwrap();

    let workers: Vec<_> = (0..4u8)
        .map(|worker| {
            let device = device.clone();
            std::thread::spawn(move || {
                let base = worker as u64 * 64 * 1024;
                let data = vec![worker; 512];
                for block in 0..32u64 {
                    let addr = base + block * 512;
                    device.erase(addr, 512).unwrap();
                    device.program(&data, addr).unwrap();
                    let mut out = vec![0u8; 512];
                    device.read(&mut out, addr).unwrap();
                    assert_eq!(out, data);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
}
