//! Overlay behavior through the VFS: copy-up, deletion persistence and
//! reconstruction.

mod fixtures;

use std::sync::Arc;

use fixtures::backend_read;
use fixtures::seed_backend;
use fixtures::vfs_with_mount;
use mountfs::Backend;
use mountfs::Errno;
use mountfs::MemFs;
use mountfs::Mutexed;
use mountfs::Overlay;
use mountfs::OverlayOptions;
use mountfs::Vfs;
use mountfs::DELETION_LOG_PATH;

fn overlay_over(lower: Arc<MemFs>) -> (Overlay, Arc<MemFs>) {
    let upper = Arc::new(MemFs::new());
    let overlay = Overlay::new(OverlayOptions {
        writable: upper.clone(),
        readable: lower,
    })
    .unwrap();
    (overlay, upper)
}

#[test]
fn write_over_read_only_file() {
    let lower = seed_backend(&[("/f", b"hello")]);
    let (overlay, upper) = overlay_over(lower.clone());
    let fs = Vfs::with_root(Arc::new(overlay));

    assert_eq!(fs.read_file("/f").unwrap(), b"hello");
    fs.write_file("/f", b"HELLO").unwrap();

    assert_eq!(fs.read_file("/f").unwrap(), b"HELLO");
    assert_eq!(backend_read(lower.as_ref(), "/f"), b"hello");
    assert!(upper.exists("/f").unwrap());
}

#[test]
fn delete_persists_across_reconstruction() {
    let lower = seed_backend(&[("/f", b"hello")]);
    let (overlay, upper) = overlay_over(lower.clone());
    let fs = Vfs::with_root(Arc::new(overlay));

    fs.unlink("/f").unwrap();
    assert!(!fs.exists("/f").unwrap());
    assert_eq!(backend_read(upper.as_ref(), DELETION_LOG_PATH), b"d/f\n");

    let rebuilt = Overlay::new(OverlayOptions {
        writable: upper,
        readable: lower,
    })
    .unwrap();
    let fs = Vfs::with_root(Arc::new(rebuilt));
    assert!(!fs.exists("/f").unwrap());
    assert_eq!(fs.stat("/f").unwrap_err().errno, Errno::ENOENT);
}

#[test]
fn overlay_mounted_within_larger_namespace() {
    let lower = seed_backend(&[("/conf/app.toml", b"[pkg]")]);
    let (overlay, _) = overlay_over(lower);
    let fs = vfs_with_mount("/etc", Arc::new(overlay));

    assert_eq!(fs.read_file("/etc/conf/app.toml").unwrap(), b"[pkg]");
    fs.write_file("/etc/conf/app.toml", b"[pkg2]").unwrap();
    assert_eq!(fs.read_file("/etc/conf/app.toml").unwrap(), b"[pkg2]");

    // Deletion goes through the mount translation as well.
    fs.unlink("/etc/conf/app.toml").unwrap();
    assert!(!fs.exists("/etc/conf/app.toml").unwrap());
}

#[test]
fn lower_only_view_is_writable_and_mode_is_preserved_otherwise() {
    let lower = seed_backend(&[("/ro", b"x")]);
    let (overlay, _) = overlay_over(lower);
    let stats = overlay.stat("/ro").unwrap();
    assert_eq!(stats.mode & 0o222, 0o222);
}

#[test]
fn merged_listing_hides_deleted_and_unions_layers() {
    let lower = seed_backend(&[("/d/from_lower", b"1"), ("/d/gone", b"2")]);
    let (overlay, _) = overlay_over(lower);
    let fs = Vfs::with_root(Arc::new(overlay));

    fs.write_file("/d/from_upper", b"3").unwrap();
    fs.unlink("/d/gone").unwrap();

    let mut entries = fs.readdir("/d").unwrap();
    entries.sort();
    assert_eq!(entries, ["from_lower", "from_upper"]);
}

#[test]
fn mutexed_overlay_keeps_composed_operations_working() {
    let lower = seed_backend(&[("/f", b"orig")]);
    let (overlay, upper) = overlay_over(lower);
    let fs = Vfs::with_root(Arc::new(Mutexed::new(overlay)));

    fs.write_file("/f", b"changed").unwrap();
    assert_eq!(fs.read_file("/f").unwrap(), b"changed");
    fs.rename("/f", "/g").unwrap();
    assert!(!fs.exists("/f").unwrap());
    assert_eq!(fs.read_file("/g").unwrap(), b"changed");
    assert!(upper.exists("/g").unwrap());
}

#[test]
fn rmdir_lower_directory_is_logged() {
    let lower = seed_backend(&[("/dir/f", b"1")]);
    let (overlay, upper) = overlay_over(lower);
    let fs = Vfs::with_root(Arc::new(overlay));

    fs.unlink("/dir/f").unwrap();
    fs.rmdir("/dir").unwrap();
    assert!(!fs.exists("/dir").unwrap());

    let log = backend_read(upper.as_ref(), DELETION_LOG_PATH);
    let log = String::from_utf8(log).unwrap();
    assert!(log.contains("d/dir\n"));
    assert!(log.contains("d/dir/f\n"));
}
