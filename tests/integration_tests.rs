//! End-to-end tests of the path surface.

use mountfs::AccessFlags;
use mountfs::Credentials;
use mountfs::Errno;
use mountfs::MkdirOptions;
use mountfs::ReaddirOptions;
use mountfs::RmOptions;
use mountfs::SymlinkType;
use mountfs::Vfs;
use mountfs::WatchEventType;

#[test]
fn round_trip_bytes_and_strings() {
    let fs = Vfs::new();
    let payload: Vec<u8> = (0u16..600).map(|v| (v % 251) as u8).collect();
    fs.write_file("/blob", &payload).unwrap();
    assert_eq!(fs.read_file("/blob").unwrap(), payload);

    fs.write_file("/text", "grüße".as_bytes()).unwrap();
    assert_eq!(fs.read_file_to_string("/text").unwrap(), "grüße");
}

#[test]
fn mkdir_recursive_scenario() {
    let fs = Vfs::new();
    let first = fs
        .mkdir(
            "/a/b/c",
            MkdirOptions {
                recursive: true,
                mode: 0o755,
            },
        )
        .unwrap();
    assert_eq!(first.as_deref(), Some("/a"));
    for dir in ["/a", "/a/b", "/a/b/c"] {
        let stats = fs.stat(dir).unwrap();
        assert!(stats.is_dir());
        assert_eq!(stats.perm(), 0o755, "{dir}");
    }
    let second = fs
        .mkdir(
            "/a/b/c",
            MkdirOptions {
                recursive: true,
                mode: 0o755,
            },
        )
        .unwrap();
    assert_eq!(second, None);
}

#[test]
fn exclusive_create_scenario() {
    let fs = Vfs::new();
    fs.write_file("/e", b"1").unwrap();
    assert_eq!(fs.open("/e", "wx").unwrap_err().errno, Errno::EEXIST);
    assert_eq!(fs.open("/e", "ax+").unwrap_err().errno, Errno::EEXIST);
}

#[test]
fn write_grows_fstat_size() {
    let fs = Vfs::new();
    let fd = fs.open_fd("/g", "w", 0o644).unwrap();
    let before = fs.fstat(fd).unwrap().size;
    fs.write(fd, b"0123456789", None).unwrap();
    let mid = fs.fstat(fd).unwrap().size;
    assert!(mid >= before);
    assert_eq!(mid, 10);
    // Writing past the end extends to pos + n.
    fs.write(fd, b"xy", Some(20)).unwrap();
    assert_eq!(fs.fstat(fd).unwrap().size, 22);
    fs.close(fd).unwrap();
}

#[test]
fn access_and_permission_classes() {
    let fs = Vfs::new();
    fs.write_file("/shared", b"data").unwrap();
    fs.chmod("/shared", 0o640).unwrap();
    fs.chown("/shared", 100, 200).unwrap();

    fs.set_credentials(Credentials::new(100, 999));
    fs.access("/shared", AccessFlags::R_OK | AccessFlags::W_OK)
        .unwrap();

    fs.set_credentials(Credentials::new(500, 200));
    fs.access("/shared", AccessFlags::R_OK).unwrap();
    assert_eq!(
        fs.access("/shared", AccessFlags::W_OK).unwrap_err().errno,
        Errno::EACCES
    );

    fs.set_credentials(Credentials::new(500, 999));
    assert_eq!(
        fs.open("/shared", "r").unwrap_err().errno,
        Errno::EACCES
    );
}

#[test]
fn symlink_chain_and_dangling_links() {
    let fs = Vfs::new();
    fs.mkdir("/real", MkdirOptions::default()).unwrap();
    fs.write_file("/real/file", b"deep").unwrap();
    fs.symlink("/real", "/alias", SymlinkType::Dir).unwrap();

    assert_eq!(fs.read_file("/alias/file").unwrap(), b"deep");
    assert_eq!(fs.realpath("/alias/file").unwrap(), "/real/file");

    fs.symlink("/nowhere", "/dangling", SymlinkType::File).unwrap();
    assert!(!fs.exists("/dangling").unwrap());
    assert!(fs.lstat("/dangling").unwrap().is_symlink());
}

#[test]
fn readdir_with_types_and_recursion() {
    let fs = Vfs::new();
    fs.mkdir(
        "/tree/sub",
        MkdirOptions {
            recursive: true,
            mode: 0o755,
        },
    )
    .unwrap();
    fs.write_file("/tree/f1", b"").unwrap();
    fs.write_file("/tree/sub/f2", b"").unwrap();
    fs.symlink("/tree/f1", "/tree/ln", SymlinkType::File).unwrap();

    let mut entries = fs
        .readdir_with_options("/tree", ReaddirOptions { recursive: true })
        .unwrap();
    entries.sort_by(|a, b| a.name.cmp(&b.name));
    let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, ["f1", "ln", "sub", "sub/f2"]);
    assert!(entries[0].is_file());
    assert!(entries[1].is_symlink());
    assert!(entries[2].is_dir());
}

#[test]
fn watch_receives_lifecycle_events() {
    let fs = Vfs::new();
    fs.mkdir("/w", MkdirOptions::default()).unwrap();
    let mut watcher = fs.watch("/w").unwrap();

    fs.write_file("/w/f", b"1").unwrap();
    fs.rename("/w/f", "/w/g").unwrap();
    fs.unlink("/w/g").unwrap();

    let mut events = Vec::new();
    while let Some(event) = watcher.try_next() {
        events.push(event);
    }
    // Creation, write, rename(old), change(new), unlink.
    assert!(events
        .iter()
        .any(|e| e.event_type == WatchEventType::Rename && e.filename == "f"));
    assert!(events
        .iter()
        .any(|e| e.event_type == WatchEventType::Change && e.filename == "f"));
    assert!(events
        .iter()
        .any(|e| e.event_type == WatchEventType::Rename && e.filename == "g"));
    watcher.close();
}

#[test]
fn rm_recursive_and_force() {
    let fs = Vfs::new();
    fs.mkdir(
        "/junk/nested",
        MkdirOptions {
            recursive: true,
            mode: 0o755,
        },
    )
    .unwrap();
    fs.write_file("/junk/nested/f", b"x").unwrap();

    fs.rm(
        "/junk",
        RmOptions {
            recursive: true,
            force: false,
        },
    )
    .unwrap();
    assert!(!fs.exists("/junk").unwrap());

    // force swallows the now-missing target
    fs.rm(
        "/junk",
        RmOptions {
            recursive: true,
            force: true,
        },
    )
    .unwrap();
}

#[test]
fn cp_recursive_preserves_structure() {
    let fs = Vfs::new();
    fs.mkdir(
        "/src/sub",
        MkdirOptions {
            recursive: true,
            mode: 0o750,
        },
    )
    .unwrap();
    fs.write_file("/src/a", b"alpha").unwrap();
    fs.write_file("/src/sub/b", b"beta").unwrap();
    fs.symlink("/src/a", "/src/ln", SymlinkType::File).unwrap();

    fs.cp(
        "/src",
        "/dst",
        mountfs::CpOptions {
            recursive: true,
            ..mountfs::CpOptions::default()
        },
    )
    .unwrap();

    assert_eq!(fs.read_file("/dst/a").unwrap(), b"alpha");
    assert_eq!(fs.read_file("/dst/sub/b").unwrap(), b"beta");
    assert_eq!(fs.readlink("/dst/ln").unwrap(), "/src/a");
    assert_eq!(fs.stat("/dst/sub").unwrap().perm(), 0o750);
}

#[test]
fn truncate_path_and_fd() {
    let fs = Vfs::new();
    fs.write_file("/t", b"0123456789").unwrap();
    fs.truncate("/t", 4).unwrap();
    assert_eq!(fs.read_file("/t").unwrap(), b"0123");

    let fd = fs.open_fd("/t", "r+", 0o644).unwrap();
    fs.ftruncate(fd, 0).unwrap();
    fs.close(fd).unwrap();
    assert_eq!(fs.read_file("/t").unwrap(), b"");
}
