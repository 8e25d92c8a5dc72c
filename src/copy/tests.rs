use super::*;
use std::ffi::CString;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{symlink, FileTypeExt, MetadataExt, PermissionsExt};

#[test]
fn attributed_copy_regular_file_preserves_content_and_mode() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("src");
    let dst = dir.path().join("dst");
    fs::write(&src, b"hello world").unwrap();
    fs::set_permissions(&src, fs::Permissions::from_mode(0o640)).unwrap();

    attributed_copy(&src, &dst).unwrap();

    assert_eq!(fs::read(&dst).unwrap(), b"hello world");
    let mode = fs::metadata(&dst).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o640);
}

#[test]
fn attributed_copy_symlink_preserves_target() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("link");
    let dst = dir.path().join("link2");
    symlink("/some/target", &src).unwrap();

    attributed_copy(&src, &dst).unwrap();

    let target = fs::read_link(&dst).unwrap();
    assert_eq!(target, std::path::Path::new("/some/target"));
}

#[test]
fn attributed_copy_directory_creates_empty_dir() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("srcdir");
    let dst = dir.path().join("dstdir");
    fs::create_dir(&src).unwrap();
    fs::set_permissions(&src, fs::Permissions::from_mode(0o750)).unwrap();

    attributed_copy(&src, &dst).unwrap();

    assert!(dst.is_dir());
    let mode = fs::metadata(&dst).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o750);
}

#[test]
fn attributed_copy_directory_already_existing_is_left_alone() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("srcdir");
    let dst = dir.path().join("dstdir");
    fs::create_dir(&src).unwrap();
    fs::create_dir(&dst).unwrap();
    fs::set_permissions(&dst, fs::Permissions::from_mode(0o700)).unwrap();

    attributed_copy(&src, &dst).unwrap();

    let mode = fs::metadata(&dst).unwrap().permissions().mode() & 0o777;
    assert_eq!(mode, 0o700);
}

#[test]
fn mv_same_filesystem_renames() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("a");
    let dst = dir.path().join("b");
    fs::write(&src, b"data").unwrap();

    mv(&src, &dst).unwrap();

    assert!(!src.exists());
    assert_eq!(fs::read(&dst).unwrap(), b"data");
}

#[test]
fn link_or_copy_hard_links_when_possible() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("a");
    let dst = dir.path().join("b");
    fs::write(&src, b"data").unwrap();

    link_or_copy(&src, &dst).unwrap();

    let src_meta = fs::metadata(&src).unwrap();
    let dst_meta = fs::metadata(&dst).unwrap();
    assert_eq!(src_meta.ino(), dst_meta.ino());
}

#[test]
fn link_or_copy_removes_existing_dest_first() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("a");
    let dst = dir.path().join("b");
    fs::write(&src, b"new").unwrap();
    fs::write(&dst, b"old").unwrap();

    link_or_copy(&src, &dst).unwrap();

    assert_eq!(fs::read(&dst).unwrap(), b"new");
}

#[test]
fn attributed_copy_fifo_round_trips_type() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("fifo");
    let dst = dir.path().join("fifo2");
    let c_src = CString::new(src.as_os_str().as_bytes()).unwrap();
    let ret = unsafe { libc::mkfifo(c_src.as_ptr(), 0o600) };
    assert_eq!(ret, 0);

    attributed_copy(&src, &dst).unwrap();

    assert!(fs::metadata(&dst).unwrap().file_type().is_fifo());
}
