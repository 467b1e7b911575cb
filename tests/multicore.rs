//! Concurrent writers on separate threads, one filesystem

use std::sync::Arc;
use std::thread;

use mcufs::blockdevice::BlockDevice;
use mcufs::filesystem::{Filesystem, MountFlags, OpenFlags, Whence};
use mcufs::vfs::Vfs;
use mcufs::{FlashDevice, LittleFsFilesystem, RamFlash};

const PER_THREAD: usize = 128 * 1024;
const CHUNK: usize = 4096;

#[test]
fn test_two_writers_do_not_corrupt_each_other() {
    let vfs: &'static Vfs = Box::leak(Box::new(Vfs::new()));
    let device: Arc<dyn BlockDevice> =
        Arc::new(FlashDevice::new(RamFlash::new(2 * 1024 * 1024), 0, 0).unwrap());
    let fs: Arc<dyn Filesystem> = Arc::new(LittleFsFilesystem::with_defaults());
    vfs.format(&fs, &device).unwrap();
    vfs.mount("/flash", fs, device, MountFlags::empty()).unwrap();

    let workers: Vec<_> = (0..2u8)
        .map(|core| {
            thread::spawn(move || {
                let path = format!("/flash/core{}", core);
                let pattern = |i: usize| (i as u8) ^ (core * 0x5F);

                let fd = vfs
                    .open(&path, OpenFlags::WRONLY | OpenFlags::CREAT)
                    .unwrap();
                let mut chunk = vec![0u8; CHUNK];
                for block in 0..PER_THREAD / CHUNK {
                    for (i, byte) in chunk.iter_mut().enumerate() {
                        *byte = pattern(block * CHUNK + i);
                    }
                    assert_eq!(vfs.write(fd, &chunk).unwrap(), CHUNK);
                }
                vfs.close(fd).unwrap();

                let fd = vfs.open(&path, OpenFlags::RDONLY).unwrap();
                assert_eq!(vfs.lseek(fd, 0, Whence::Set).unwrap(), 0);
                let mut offset = 0;
                while offset < PER_THREAD {
                    let n = vfs.read(fd, &mut chunk).unwrap();
                    assert!(n > 0, "short file at {}", offset);
                    for (i, &byte) in chunk[..n].iter().enumerate() {
                        assert_eq!(byte, pattern(offset + i));
                    }
                    offset += n;
                }
                vfs.close(fd).unwrap();
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
}
