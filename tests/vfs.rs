//! VFS surface tests over littlefs on a flash window

use std::sync::Arc;

use mcufs::blockdevice::BlockDevice;
use mcufs::filesystem::{EntryKind, Filesystem, MountFlags, OpenFlags, Whence};
use mcufs::vfs::{strerror, Vfs};
use mcufs::{Error, FlashDevice, LittleFsFilesystem, RamFlash};

const FLASH_SIZE: usize = 2 * 1024 * 1024;

fn mounted_vfs() -> (Vfs, Arc<dyn Filesystem>, Arc<dyn BlockDevice>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let vfs = Vfs::new();
    let device: Arc<dyn BlockDevice> =
        Arc::new(FlashDevice::new(RamFlash::new(FLASH_SIZE), 0, 0).unwrap());
    let fs: Arc<dyn Filesystem> = Arc::new(LittleFsFilesystem::with_defaults());
    vfs.format(&fs, &device).unwrap();
    vfs.mount("/", fs.clone(), device.clone(), MountFlags::empty())
        .unwrap();
    (vfs, fs, device)
}

#[test]
fn test_fresh_filesystem_is_empty() {
    let (vfs, _, _) = mounted_vfs();
    assert_eq!(vfs.stat("/whatever").unwrap_err(), Error::NotFound);
}

#[test]
fn test_open_close() {
    let (vfs, _, _) = mounted_vfs();

    assert_eq!(
        vfs.open("/file", OpenFlags::RDONLY).unwrap_err(),
        Error::NotFound
    );

    let fd = vfs
        .open("/file", OpenFlags::WRONLY | OpenFlags::CREAT)
        .unwrap();
    assert_eq!(fd, 3);
    vfs.close(fd).unwrap();
}

#[test]
fn test_write_read() {
    let (vfs, _, _) = mounted_vfs();

    let fd = vfs
        .open("/file", OpenFlags::WRONLY | OpenFlags::CREAT)
        .unwrap();
    assert_eq!(vfs.write(fd, b"Hello World!").unwrap(), 12);
    vfs.close(fd).unwrap();

    let fd = vfs.open("/file", OpenFlags::RDONLY).unwrap();
    let mut buf = [0u8; 512];
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), 12);
    assert_eq!(&buf[..12], b"Hello World!");
    vfs.close(fd).unwrap();
}

#[test]
fn test_seek() {
    let (vfs, _, _) = mounted_vfs();

    let fd = vfs
        .open("/file", OpenFlags::RDWR | OpenFlags::CREAT)
        .unwrap();
    vfs.write(fd, b"123456789ABCDEF").unwrap();

    assert_eq!(vfs.lseek(fd, 0, Whence::Set).unwrap(), 0);
    let mut buf = [0u8; 512];
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), 15);
    assert_eq!(&buf[..15], b"123456789ABCDEF");

    assert_eq!(vfs.lseek(fd, 9, Whence::Set).unwrap(), 9);
    let mut buf = [0u8; 512];
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), 6);
    assert_eq!(&buf[..6], b"ABCDEF");

    assert_eq!(vfs.lseek(fd, -3, Whence::End).unwrap(), 12);
    assert_eq!(vfs.tell(fd).unwrap(), 12);
    vfs.close(fd).unwrap();
}

#[test]
fn test_truncate() {
    let (vfs, _, _) = mounted_vfs();

    let fd = vfs
        .open("/x", OpenFlags::RDWR | OpenFlags::CREAT)
        .unwrap();
    vfs.write(fd, b"123456789ABCDEF").unwrap();
    vfs.lseek(fd, 0, Whence::Set).unwrap();
    vfs.ftruncate(fd, 9).unwrap();

    let mut buf = [0u8; 512];
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), 9);
    assert_eq!(&buf[..9], b"123456789");
    vfs.close(fd).unwrap();

    assert_eq!(vfs.stat("/x").unwrap().size, 9);
}

#[test]
fn test_fstat() {
    let (vfs, _, _) = mounted_vfs();

    let fd = vfs
        .open("/sized", OpenFlags::RDWR | OpenFlags::CREAT)
        .unwrap();
    vfs.write(fd, &[7u8; 1000]).unwrap();
    vfs.lseek(fd, 100, Whence::Set).unwrap();

    let meta = vfs.fstat(fd).unwrap();
    assert_eq!(meta.size, 1000);
    assert_eq!(meta.kind, EntryKind::File);
    // The probing seek must not disturb the cursor
    assert_eq!(vfs.tell(fd).unwrap(), 100);
    vfs.close(fd).unwrap();
}

#[test]
fn test_descriptor_recycling() {
    let (vfs, _, _) = mounted_vfs();

    let fds: Vec<i32> = (1..=5)
        .map(|i| {
            vfs.open(
                &format!("/f{}", i),
                OpenFlags::WRONLY | OpenFlags::CREAT,
            )
            .unwrap()
        })
        .collect();
    assert_eq!(fds, [3, 4, 5, 6, 7]);

    for fd in &fds {
        vfs.close(*fd).unwrap();
    }
    let fd = vfs
        .open("/f6", OpenFlags::WRONLY | OpenFlags::CREAT)
        .unwrap();
    assert_eq!(fd, fds[0]);
    vfs.close(fd).unwrap();
}

#[test]
fn test_remove_rename() {
    let (vfs, _, _) = mounted_vfs();

    let fd = vfs
        .open("/old", OpenFlags::WRONLY | OpenFlags::CREAT)
        .unwrap();
    vfs.write(fd, b"payload").unwrap();
    vfs.close(fd).unwrap();

    vfs.rename("/old", "/new").unwrap();
    assert_eq!(vfs.stat("/old").unwrap_err(), Error::NotFound);

    let fd = vfs.open("/new", OpenFlags::RDONLY).unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(vfs.read(fd, &mut buf).unwrap(), 7);
    assert_eq!(&buf[..7], b"payload");
    vfs.close(fd).unwrap();

    vfs.unlink("/new").unwrap();
    assert_eq!(vfs.stat("/new").unwrap_err(), Error::NotFound);
}

#[test]
fn test_directories() {
    let (vfs, _, _) = mounted_vfs();

    assert!(vfs.opendir("/dir").is_err());
    vfs.mkdir("/dir", 0o777).unwrap();

    for name in ["/dir/a", "/dir/b", "/dir/c"] {
        let fd = vfs
            .open(name, OpenFlags::WRONLY | OpenFlags::CREAT)
            .unwrap();
        vfs.close(fd).unwrap();
    }

    let dd = vfs.opendir("/dir").unwrap();
    let mut names = Vec::new();
    while let Some(entry) = vfs.readdir(dd).unwrap() {
        names.push(entry.name);
    }
    vfs.closedir(dd).unwrap();

    let mut plain: Vec<String> = names
        .iter()
        .filter(|n| *n != "." && *n != "..")
        .cloned()
        .collect();
    plain.sort();
    assert_eq!(plain, ["a", "b", "c"]);

    assert_eq!(vfs.rmdir("/dir").unwrap_err(), Error::NotEmpty);
    for name in ["/dir/a", "/dir/b", "/dir/c"] {
        vfs.unlink(name).unwrap();
    }
    vfs.rmdir("/dir").unwrap();
}

#[test]
fn test_unmount_preserves_contents() {
    let (vfs, fs, device) = mounted_vfs();

    let fd = vfs
        .open("/persist", OpenFlags::WRONLY | OpenFlags::CREAT)
        .unwrap();
    vfs.write(fd, b"still here").unwrap();
    vfs.close(fd).unwrap();

    for _ in 0..3 {
        vfs.unmount("/").unwrap();
        vfs.mount("/", fs.clone(), device.clone(), MountFlags::empty())
            .unwrap();
        assert_eq!(vfs.stat("/persist").unwrap().size, 10);
    }
}

#[test]
fn test_reformat_keeps_bindings() {
    let (vfs, fs, device) = mounted_vfs();

    let fd = vfs
        .open("/doomed", OpenFlags::WRONLY | OpenFlags::CREAT)
        .unwrap();
    vfs.write(fd, b"bye").unwrap();
    vfs.close(fd).unwrap();

    vfs.reformat("/").unwrap();

    assert_eq!(vfs.stat("/doomed").unwrap_err(), Error::NotFound);
    let (bound_fs, bound_device) = vfs.info("/").unwrap();
    assert!(Arc::ptr_eq(&bound_fs, &fs));
    assert!(Arc::ptr_eq(&bound_device, &device));

    // Still usable after the reformat
    let fd = vfs
        .open("/fresh", OpenFlags::WRONLY | OpenFlags::CREAT)
        .unwrap();
    vfs.close(fd).unwrap();
}

#[test]
fn test_auto_format_mount() {
    let vfs = Vfs::new();
    let device: Arc<dyn BlockDevice> =
        Arc::new(FlashDevice::new(RamFlash::new(FLASH_SIZE), 0, 0).unwrap());
    let fs: Arc<dyn Filesystem> = Arc::new(LittleFsFilesystem::with_defaults());

    // Blank media: a plain mount fails, auto-format brings it up
    assert!(vfs
        .mount("/", fs.clone(), device.clone(), MountFlags::empty())
        .is_err());
    vfs.mount("/", fs, device, MountFlags::AUTO_FORMAT).unwrap();
    assert_eq!(vfs.stat("/whatever").unwrap_err(), Error::NotFound);
}

#[test]
fn test_strerror_ranges() {
    assert_eq!(strerror(Error::NotFound.code()), "No such file or directory");
    assert_eq!(strerror(-5009), "SD data CRC error");
    assert_eq!(strerror(-4002), "flash operation not permitted");
}
