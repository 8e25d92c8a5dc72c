//! Attribute-preserving copy primitive: `mv`, `link_or_copy`, `attributed_copy`.
//!
//! Every fallible syscall site returns [`Error`] with the syscall name and
//! involved path(s) attached, so callers (the merge engine, the driver) can
//! print one diagnostic line per failure.

use std::ffi::CString;
use std::fs;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{DirBuilderExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;

use crate::common::error::{Error, Result};

const COPY_BLOCK_SIZE: usize = crate::common::io::COPY_BLOCK_SIZE;

fn cstr(path: &Path) -> Result<CString> {
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::InvalidJournal(format!("path contains NUL: {}", path.display())))
}

fn last_errno() -> io::Error {
    io::Error::last_os_error()
}

/// `rename(2)`, falling back to `attributed_copy` + unlink on `EXDEV`.
pub fn mv(source: &Path, dest: &Path) -> Result<()> {
    match fs::rename(source, dest) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) => {
            attributed_copy(source, dest)?;
            fs::remove_file(source).map_err(|e| Error::io2("unlink", e, source, dest))
        }
        Err(e) => Err(Error::io2("rename", e, source, dest)),
    }
}

/// Unlink `dest` (ignoring "not found"), then hard-link `source` onto it;
/// falls back to `attributed_copy` on cross-device or permission failures.
pub fn link_or_copy(source: &Path, dest: &Path) -> Result<()> {
    if let Err(e) = fs::remove_file(dest) {
        if e.kind() != io::ErrorKind::NotFound {
            return Err(Error::io("unlink", e, dest));
        }
    }

    match fs::hard_link(source, dest) {
        Ok(()) => Ok(()),
        Err(e)
            if matches!(
                e.raw_os_error(),
                Some(libc::EXDEV) | Some(libc::EACCES) | Some(libc::EPERM)
            ) =>
        {
            attributed_copy(source, dest)
        }
        Err(e) => Err(Error::io2("link", e, source, dest)),
    }
}

/// Copy a single filesystem object (any type `lstat` reports), preserving
/// content, ownership, timestamps, mode, and best-effort extended attributes.
pub fn attributed_copy(source: &Path, dest: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(source).map_err(|e| Error::io("lstat", e, source))?;
    let file_type = meta.file_type();

    if !file_type.is_dir() {
        if let Err(e) = fs::remove_file(dest) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(Error::io("unlink", e, dest));
            }
        }
    }

    let mut skip_attributes = false;

    if file_type.is_symlink() {
        copy_symlink(source, dest, meta.size())?;
    } else if file_type.is_file() {
        copy_regular(source, dest, meta.size())?;
    } else if file_type.is_dir() {
        match fs::DirBuilder::new().mode(meta.mode()).create(dest) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => skip_attributes = true,
            Err(e) => return Err(Error::io("mkdir", e, dest)),
        }
    } else if is_fifo(meta.mode()) {
        mkfifo(dest, meta.mode())?;
    } else if is_chr_or_blk(meta.mode()) {
        mknod(dest, meta.mode(), meta.rdev())?;
    } else {
        return Err(Error::Other(format!(
            "invalid file type for {}",
            source.display()
        )));
    }

    if !skip_attributes {
        apply_attributes(source, dest, &meta, file_type.is_dir())?;
        copy_xattrs(source, dest);
    }

    Ok(())
}

/// Best-effort extended-attribute copy: failures (unsupported filesystem,
/// missing permission) are swallowed, matching the original project's stance
/// that xattrs are a nice-to-have, not a correctness requirement.
fn copy_xattrs(source: &Path, dest: &Path) {
    let names = match xattr::list(source) {
        Ok(names) => names,
        Err(_) => return,
    };
    for name in names {
        if let Ok(Some(value)) = xattr::get(source, &name) {
            let _ = xattr::set(dest, &name, &value);
        }
    }
}

fn is_fifo(mode: u32) -> bool {
    mode & libc::S_IFMT == libc::S_IFIFO
}

fn is_chr_or_blk(mode: u32) -> bool {
    matches!(mode & libc::S_IFMT, libc::S_IFCHR | libc::S_IFBLK)
}

/// Readlink into a buffer sized to the length `lstat` reported; fail if the
/// actual link content changed size between the two calls. The buffer holds
/// exactly `symlen` bytes plus the NUL terminator at index `symlen` (not
/// `symlen + 1`, which would write one byte past the end).
fn copy_symlink(source: &Path, dest: &Path, symlen: u64) -> Result<()> {
    let symlen = symlen as usize;
    let c_source = cstr(source)?;
    let mut buf = vec![0u8; symlen + 1];

    let n = unsafe {
        libc::readlink(
            c_source.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    };
    if n < 0 {
        return Err(Error::io("readlink", last_errno(), source));
    }
    if n as usize != symlen {
        return Err(Error::Other(format!(
            "symlink target length changed while copying {}",
            source.display()
        )));
    }
    buf[symlen] = 0;
    let target = std::ffi::OsStr::from_bytes(&buf[..symlen]);

    std::os::unix::fs::symlink(target, dest).map_err(|e| Error::io2("symlink", e, source, dest))
}

fn copy_regular(source: &Path, dest: &Path, size: u64) -> Result<()> {
    let src_file = fs::File::open(source).map_err(|e| Error::io("open", e, source))?;
    let dst_file = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o666)
        .open(dest)
        .map_err(|e| Error::io("creat", e, dest))?;

    if size != 0 {
        let ret = unsafe { libc::posix_fallocate(dst_file.as_raw_fd(), 0, size as libc::off_t) };
        if ret != 0 {
            return Err(Error::io(
                "posix_fallocate",
                io::Error::from_raw_os_error(ret),
                dest,
            ));
        }
    }

    unsafe {
        libc::posix_fadvise(
            src_file.as_raw_fd(),
            0,
            0,
            libc::POSIX_FADV_SEQUENTIAL | libc::POSIX_FADV_WILLNEED,
        );
        libc::posix_fadvise(dst_file.as_raw_fd(), 0, 0, libc::POSIX_FADV_SEQUENTIAL);
    }

    splice_all(&src_file, &dst_file, source, dest)?;

    drop(src_file);
    let _ = dst_file.sync_all();
    drop(dst_file);
    Ok(())
}

/// Copy file content in `COPY_BLOCK_SIZE` blocks, retrying short reads/writes
/// and `EINTR` until the source is drained.
fn splice_all(src: &fs::File, dst: &fs::File, source: &Path, dest: &Path) -> Result<()> {
    use std::io::{Read, Write};

    let mut reader = src;
    let mut writer = dst;
    let mut buf = vec![0u8; COPY_BLOCK_SIZE];

    loop {
        let n = match crate::common::io::retry_eintr(|| reader.read(&mut buf)) {
            Ok(n) => n,
            Err(e) => return Err(Error::io("read", e, source)),
        };
        if n == 0 {
            break;
        }
        let mut written = 0;
        while written < n {
            let w = match crate::common::io::retry_eintr(|| writer.write(&buf[written..n])) {
                Ok(w) => w,
                Err(e) => return Err(Error::io("write", e, dest)),
            };
            written += w;
        }
    }
    Ok(())
}

fn mkfifo(dest: &Path, mode: u32) -> Result<()> {
    let c_dest = cstr(dest)?;
    let ret = unsafe { libc::mkfifo(c_dest.as_ptr(), mode & !libc::S_IFMT) };
    if ret != 0 {
        return Err(Error::io("mkfifo", last_errno(), dest));
    }
    Ok(())
}

fn mknod(dest: &Path, mode: u32, rdev: u64) -> Result<()> {
    let c_dest = cstr(dest)?;
    let ret = unsafe { libc::mknod(c_dest.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) };
    if ret != 0 {
        return Err(Error::io("mknod", last_errno(), dest));
    }
    Ok(())
}

/// lchown, then timestamps (skipped on directories), then mode, in that
/// order — matching the original project's attribute-application sequence.
fn apply_attributes(source: &Path, dest: &Path, meta: &fs::Metadata, is_dir: bool) -> Result<()> {
    let c_dest = cstr(dest)?;

    let ret = unsafe { libc::lchown(c_dest.as_ptr(), meta.uid(), meta.gid()) };
    if ret != 0 {
        return Err(Error::io("lchown", last_errno(), dest));
    }

    if !is_dir {
        apply_timestamps(dest, meta, &c_dest, meta.file_type().is_symlink())?;
    }

    apply_mode(dest, meta, &c_dest, meta.file_type().is_symlink())?;

    Ok(())
}

fn apply_timestamps(
    dest: &Path,
    meta: &fs::Metadata,
    c_dest: &CString,
    is_symlink: bool,
) -> Result<()> {
    let times = [
        libc::timespec {
            tv_sec: meta.atime(),
            tv_nsec: meta.atime_nsec(),
        },
        libc::timespec {
            tv_sec: meta.mtime(),
            tv_nsec: meta.mtime_nsec(),
        },
    ];
    let ret = unsafe {
        libc::utimensat(
            libc::AT_FDCWD,
            c_dest.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if ret == 0 {
        return Ok(());
    }
    let err = last_errno();
    if err.raw_os_error() == Some(libc::ENOSYS) && !is_symlink {
        let tb = libc::utimbuf {
            actime: meta.atime(),
            modtime: meta.mtime(),
        };
        let ret = unsafe { libc::utime(c_dest.as_ptr(), &tb) };
        if ret != 0 {
            return Err(Error::io("utime", last_errno(), dest));
        }
        return Ok(());
    }
    Err(Error::io("utimensat", err, dest))
}

fn apply_mode(dest: &Path, meta: &fs::Metadata, c_dest: &CString, is_symlink: bool) -> Result<()> {
    let mode = meta.mode() & !libc::S_IFMT;
    let ret = unsafe {
        libc::fchmodat(
            libc::AT_FDCWD,
            c_dest.as_ptr(),
            mode as libc::mode_t,
            libc::AT_SYMLINK_NOFOLLOW,
        )
    };
    if ret == 0 {
        return Ok(());
    }
    let err = last_errno();
    let unsupported = matches!(
        err.raw_os_error(),
        Some(libc::EINVAL) | Some(libc::EOPNOTSUPP) | Some(libc::ENOTSUP) | Some(libc::ENOSYS)
    );
    if unsupported && !is_symlink {
        let ret = unsafe { libc::chmod(c_dest.as_ptr(), mode as libc::mode_t) };
        if ret != 0 {
            return Err(Error::io("chmod", last_errno(), dest));
        }
        return Ok(());
    }
    if unsupported {
        return Ok(());
    }
    Err(Error::io("fchmodat", err, dest))
}

#[cfg(test)]
mod tests;
