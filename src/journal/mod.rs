//! On-disk, memory-mapped install journal.
//!
//! Layout (little-endian, packed): `magic[5]` `version:u16` `flags:u32`
//! `prefix[7]` `length:u64` `maxpathlen:u64` `files[]` `0xFF`. Each file entry
//! is `file_flags:u8` followed by a NUL-terminated `path` and a NUL-terminated
//! `name`. See `src/merge/mod.rs` for what the flag bits mean; this module
//! only knows how to store and durably flip them.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::common::error::{Error, Result};

const MAGIC: &[u8; 5] = b"AIj!\0";
const HEADER_LEN: usize = 5 + 2 + 4 + 7 + 8 + 8;

const OFF_VERSION: usize = 5;
const OFF_FLAGS: usize = 7;
const OFF_PREFIX: usize = 11;
const OFF_LENGTH: usize = 18;
const OFF_MAXPATHLEN: usize = 26;
const OFF_FILES: usize = HEADER_LEN;

const TERMINATOR: u8 = 0xFF;

/// A file entry to feed into a new journal: either the whole source tree, or
/// an externally supplied removal list (the driver's `--input-files` mode).
pub enum Seed<'a> {
    Tree(&'a Path),
    Removals(&'a [String]),
}

/// An open, mmap-backed journal. Holds an exclusive advisory lock on the
/// underlying file for its whole lifetime.
pub struct Journal {
    file: File,
    mmap: MmapMut,
    path: PathBuf,
}

/// A borrowed position into the journal's file list. Cheap to copy; all
/// actual field access goes back through the owning `Journal`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Entry {
    offset: usize,
}

fn flock_exclusive(file: &File, path: &Path) -> Result<()> {
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if ret != 0 {
        return Err(Error::io("flock", io::Error::last_os_error(), path));
    }
    Ok(())
}

fn random_seed32() -> u32 {
    if let Ok(mut f) = File::open("/dev/urandom") {
        let mut buf = [0u8; 4];
        if f.read_exact(&mut buf).is_ok() {
            return u32::from_le_bytes(buf);
        }
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_nanos() as u32)
        .unwrap_or(0x9E37_79B9);
    nanos ^ std::process::id()
}

/// 6 lowercase letters derived from a 32-bit seed, one `'a'+seed%26` per
/// letter with the seed shifted right by 5 bits each round.
fn generate_prefix() -> [u8; 6] {
    let mut seed = random_seed32();
    let mut out = [0u8; 6];
    for slot in out.iter_mut() {
        *slot = b'a' + (seed % 26) as u8;
        seed >>= 5;
    }
    out
}

fn write_header(f: &mut File, flags: u32, prefix: &[u8; 6], length: u64, maxpathlen: u64) -> io::Result<()> {
    f.seek(SeekFrom::Start(0))?;
    f.write_all(MAGIC)?;
    f.write_all(&0u16.to_le_bytes())?;
    f.write_all(&flags.to_le_bytes())?;
    f.write_all(prefix)?;
    f.write_all(&[0u8])?;
    f.write_all(&length.to_le_bytes())?;
    f.write_all(&maxpathlen.to_le_bytes())?;
    Ok(())
}

fn write_entry(f: &mut File, file_flags: u8, path: &str, name: &str) -> io::Result<u64> {
    f.write_all(&[file_flags])?;
    f.write_all(path.as_bytes())?;
    f.write_all(&[0u8])?;
    f.write_all(name.as_bytes())?;
    f.write_all(&[0u8])?;
    Ok(1 + path.len() as u64 + 1 + name.len() as u64 + 1)
}

/// Split a removal-list line the same way the tree traversal would: dirname
/// (with leading and trailing `/`) and basename.
fn split_removal_path(raw: &str) -> Result<(String, String)> {
    let trimmed = raw.trim_matches('/');
    if trimmed.is_empty() {
        return Err(Error::InvalidJournal(format!("empty removal path {raw:?}")));
    }
    match trimmed.rsplit_once('/') {
        Some((dir, name)) => Ok((format!("/{dir}/"), name.to_string())),
        None => Ok(("/".to_string(), trimmed.to_string())),
    }
}

fn traverse_into(
    root: &Path,
    rel: &str,
    out: &mut File,
    maxpathlen: &mut u64,
    length: &mut u64,
) -> Result<()> {
    let dir_path = if rel == "/" {
        root.to_path_buf()
    } else {
        root.join(rel.trim_start_matches('/').trim_end_matches('/'))
    };
    let read_dir = std::fs::read_dir(&dir_path).map_err(|e| Error::io("opendir", e, &dir_path))?;
    for dent in read_dir {
        let dent = dent.map_err(|e| Error::io("readdir", e, &dir_path))?;
        let file_name = dent.file_name();
        let name = file_name
            .to_str()
            .ok_or_else(|| Error::InvalidJournal(format!("non-utf8 name under {}", dir_path.display())))?;
        let ty = dent
            .file_type()
            .map_err(|e| Error::io("lstat", e, &dent.path()))?;
        if ty.is_dir() {
            let child_rel = format!("{rel}{name}/");
            traverse_into(root, &child_rel, out, maxpathlen, length)?;
        } else {
            *length += write_entry(out, 0, rel, name).map_err(|e| Error::io("write", e, &dent.path()))?;
            let pathlen = rel.len() as u64 + name.len() as u64;
            if pathlen > *maxpathlen {
                *maxpathlen = pathlen;
            }
        }
    }
    Ok(())
}

/// Create a new journal file at `path`, seeded either from a source-tree
/// traversal or a removal list, and finalize its header. Does not leave the
/// journal open for use; call `Journal::open` afterward.
pub fn create(path: &Path, seed: Seed) -> Result<()> {
    let mut f = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .map_err(|e| Error::io("open", e, path))?;
    flock_exclusive(&f, path)?;

    let prefix = generate_prefix();
    write_header(&mut f, 0, &prefix, 0, 0).map_err(|e| Error::io("write", e, path))?;
    f.seek(SeekFrom::Start(OFF_FILES as u64))
        .map_err(|e| Error::io("lseek", e, path))?;

    let mut length = OFF_FILES as u64;
    let mut maxpathlen = 0u64;

    match seed {
        Seed::Tree(root) => traverse_into(root, "/", &mut f, &mut maxpathlen, &mut length)?,
        Seed::Removals(paths) => {
            for raw in paths {
                let (dir, name) = split_removal_path(raw)?;
                length += write_entry(&mut f, FILE_REMOVE, &dir, &name)
                    .map_err(|e| Error::io("write", e, path))?;
                let pathlen = dir.len() as u64 + name.len() as u64;
                if pathlen > maxpathlen {
                    maxpathlen = pathlen;
                }
            }
        }
    }

    f.write_all(&[TERMINATOR]).map_err(|e| Error::io("write", e, path))?;
    length += 1;

    write_header(&mut f, 0, &prefix, length, maxpathlen).map_err(|e| Error::io("write", e, path))?;
    f.flush().map_err(|e| Error::io("flush", e, path))?;
    Ok(())
}

/// Per-entry file flags. Bit meanings belong to the merge engine; re-exported
/// here only because `create` needs `FILE_REMOVE` to seed removal lists.
pub const FILE_REMOVE: u8 = 2;

impl Journal {
    /// Open an existing journal read/write, mmap it, and validate its header.
    pub fn open(path: &Path) -> Result<Journal> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| Error::io("open", e, path))?;
        flock_exclusive(&file, path)?;

        let size = file
            .metadata()
            .map_err(|e| Error::io("fstat", e, path))?
            .len();
        if (size as usize) < HEADER_LEN + 1 {
            return Err(Error::InvalidJournal("truncated header".to_string()));
        }

        let mmap = unsafe { MmapMut::map_mut(&file).map_err(|e| Error::io("mmap", e, path))? };

        if &mmap[0..5] != MAGIC {
            return Err(Error::InvalidJournal("bad magic".to_string()));
        }
        let version = u16::from_le_bytes(mmap[OFF_VERSION..OFF_VERSION + 2].try_into().unwrap());
        if version != 0 {
            return Err(Error::InvalidJournal(format!("unsupported version {version}")));
        }
        let length = u64::from_le_bytes(mmap[OFF_LENGTH..OFF_LENGTH + 8].try_into().unwrap());
        if length != size {
            return Err(Error::InvalidJournal(format!(
                "length mismatch: header says {length}, file is {size}"
            )));
        }

        Ok(Journal {
            file,
            mmap,
            path: path.to_path_buf(),
        })
    }

    /// Unmaps and releases the advisory lock (both happen on drop; this is
    /// the explicit, spec-named counterpart).
    pub fn close(self) -> Result<()> {
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn prefix(&self) -> &str {
        let bytes = &self.mmap[OFF_PREFIX..OFF_PREFIX + 7];
        let len = bytes.iter().position(|&b| b == 0).unwrap_or(6);
        std::str::from_utf8(&bytes[..len]).expect("prefix is ASCII")
    }

    pub fn maxpathlen(&self) -> u64 {
        u64::from_le_bytes(
            self.mmap[OFF_MAXPATHLEN..OFF_MAXPATHLEN + 8]
                .try_into()
                .unwrap(),
        )
    }

    pub fn length(&self) -> u64 {
        u64::from_le_bytes(self.mmap[OFF_LENGTH..OFF_LENGTH + 8].try_into().unwrap())
    }

    pub fn flags(&self) -> u32 {
        u32::from_le_bytes(self.mmap[OFF_FLAGS..OFF_FLAGS + 4].try_into().unwrap())
    }

    /// OR `bit` into the global flags and make it durable: a best-effort
    /// whole-disk `sync()` orders prior data writes ahead of the msync that
    /// follows, so the flag can never become visible before what it promises.
    pub fn set_global_flag(&mut self, bit: u32) -> Result<()> {
        let new = self.flags() | bit;
        self.mmap[OFF_FLAGS..OFF_FLAGS + 4].copy_from_slice(&new.to_le_bytes());
        unsafe { libc::sync() };
        self.mmap
            .flush()
            .map_err(|e| Error::io("msync", e, &self.path))
    }

    pub fn first(&self) -> Option<Entry> {
        if self.mmap[OFF_FILES] == TERMINATOR {
            None
        } else {
            Some(Entry { offset: OFF_FILES })
        }
    }

    fn entry_spans(&self, e: Entry) -> (usize, usize, usize) {
        let path_start = e.offset + 1;
        let path_len = self.mmap[path_start..]
            .iter()
            .position(|&b| b == 0)
            .expect("unterminated path");
        let name_start = path_start + path_len + 1;
        let name_len = self.mmap[name_start..]
            .iter()
            .position(|&b| b == 0)
            .expect("unterminated name");
        let end = name_start + name_len + 1;
        (path_start, name_start, end)
    }

    pub fn next(&self, e: Entry) -> Option<Entry> {
        let (_, _, end) = self.entry_spans(e);
        if self.mmap[end] == TERMINATOR {
            None
        } else {
            Some(Entry { offset: end })
        }
    }

    pub fn entry_flags(&self, e: Entry) -> u8 {
        self.mmap[e.offset]
    }

    pub fn set_file_flag(&mut self, e: Entry, bit: u8) {
        self.mmap[e.offset] |= bit;
    }

    pub fn path_of(&self, e: Entry) -> &str {
        let (path_start, name_start, _) = self.entry_spans(e);
        std::str::from_utf8(&self.mmap[path_start..name_start - 1]).expect("path is valid utf8")
    }

    pub fn name_of(&self, e: Entry) -> &str {
        let (_, name_start, end) = self.entry_spans(e);
        std::str::from_utf8(&self.mmap[name_start..end - 1]).expect("name is valid utf8")
    }

    pub fn entries(&self) -> Entries<'_> {
        Entries {
            journal: self,
            cur: self.first(),
        }
    }
}

pub struct Entries<'a> {
    journal: &'a Journal,
    cur: Option<Entry>,
}

impl Iterator for Entries<'_> {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        let e = self.cur?;
        self.cur = self.journal.next(e);
        Some(e)
    }
}
