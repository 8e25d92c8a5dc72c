//! Merge engine: the four-phase state machine (COPY_NEW, BACKUP_OLD, REPLACE,
//! CLEANUP) and its rollback mirror, driven entirely off journal flags.
//!
//! Grounded in the original project's `merge.cxx`; each function here is the
//! Rust reading of one `ai_merge_*` C function, operating on `Journal`/`copy`
//! instead of raw `journal.hxx`/`copy.hxx` calls.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::common::error::{Error, Result};
use crate::copy;
use crate::journal::{Entry, Journal};

pub use crate::journal::FILE_REMOVE;

pub const COPIED_NEW: u32 = 1;
pub const BACKED_OLD_UP: u32 = 2;
pub const REPLACED: u32 = 4;
pub const ROLLBACK_STARTED: u32 = 8;

pub const FILE_BACKED_UP: u8 = 1;
pub const FILE_IGNORE: u8 = 4;
pub const FILE_DIR: u8 = 8;

pub type ProgressFn<'a> = &'a mut dyn FnMut(&str, u64, u64);
pub type RemovalFn<'a> = &'a mut dyn FnMut(&str, i32);

fn require_flags(journal: &Journal, required: u32, unallowed: u32) -> Result<()> {
    if journal.flags() & (required | unallowed) == required {
        Ok(())
    } else {
        Err(Error::InvalidState)
    }
}

fn final_path(dest: &Path, path: &str, name: &str) -> PathBuf {
    PathBuf::from(format!("{}{}{}", dest.display(), path, name))
}

fn source_final_path(source: &Path, path: &str, name: &str) -> PathBuf {
    PathBuf::from(format!("{}{}{}", source.display(), path, name))
}

fn shadow_path(dest: &Path, path: &str, prefix: &str, name: &str, suffix: &str) -> PathBuf {
    PathBuf::from(format!(
        "{}{}.{}~{}.{}",
        dest.display(),
        path,
        prefix,
        name,
        suffix
    ))
}

fn entry_paths(journal: &Journal, e: Entry) -> (String, String) {
    (
        journal.path_of(e).to_string(),
        journal.name_of(e).to_string(),
    )
}

/// Walk `path`'s `/`-separated components from the top, materializing each
/// intermediate directory under `dest_root` with attributes copied from the
/// matching directory under `source_root`. The sole mechanism by which
/// destination subdirectories come into existence (spec §4.3.4).
fn mkdir_parents(
    source_root: &Path,
    dest_root: &Path,
    path: &str,
    mut progress: Option<ProgressFn<'_>>,
) -> Result<()> {
    let mut rel = String::new();
    for component in path.trim_matches('/').split('/').filter(|c| !c.is_empty()) {
        rel.push_str(component);
        rel.push('/');
        if let Some(cb) = progress.as_deref_mut() {
            cb(&rel, 0, 0);
        }
        let src_dir = source_root.join(rel.trim_end_matches('/'));
        let dst_dir = dest_root.join(rel.trim_end_matches('/'));
        copy::attributed_copy(&src_dir, &dst_dir)?;
    }
    Ok(())
}

/// Remove a file or directory, tolerating the outcomes a retried/resumed
/// rollback can legitimately hit a second time.
fn remove_tolerant(path: &Path, is_dir: bool) -> Result<()> {
    let result = if is_dir {
        fs::remove_dir(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) => {
            let errno = e.raw_os_error().unwrap_or(0);
            if e.kind() == io::ErrorKind::NotFound
                || errno == libc::ENOTEMPTY
                || errno == libc::EEXIST
            {
                Ok(())
            } else {
                Err(Error::io("remove", e, path))
            }
        }
    }
}

fn remove_dir_reporting(path: &Path) -> Result<i32> {
    match fs::remove_dir(path) {
        Ok(()) => Ok(0),
        Err(e) => {
            let errno = e.raw_os_error().unwrap_or(0);
            if errno == libc::EEXIST {
                Ok(libc::ENOTEMPTY)
            } else if e.kind() == io::ErrorKind::NotFound {
                Ok(libc::ENOENT)
            } else if errno == libc::ENOTEMPTY {
                Ok(libc::ENOTEMPTY)
            } else {
                Err(Error::io("rmdir", e, path))
            }
        }
    }
}

fn remove_file_reporting(path: &Path) -> Result<i32> {
    match fs::remove_file(path) {
        Ok(()) => Ok(0),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(libc::ENOENT),
        Err(e) => Err(Error::io("remove", e, path)),
    }
}

/// copy_new(source, dest): populate `.new` shadows for every entry, marking
/// `FILE_IGNORE` on removal entries that conflict with a same-named source
/// file.
pub fn copy_new(
    journal: &mut Journal,
    source: &Path,
    dest: &Path,
    mut progress: Option<ProgressFn<'_>>,
) -> Result<()> {
    require_flags(journal, 0, COPIED_NEW | ROLLBACK_STARTED)?;

    let prefix = journal.prefix().to_string();
    let entries: Vec<Entry> = journal.entries().collect();

    for e in entries {
        let flags = journal.entry_flags(e);
        let (path, name) = entry_paths(journal, e);

        if flags & FILE_REMOVE != 0 {
            let src_final = source_final_path(source, &path, &name);
            if fs::symlink_metadata(&src_final).is_ok() {
                journal.set_file_flag(e, FILE_IGNORE);
            }
            continue;
        }

        if let Some(cb) = progress.as_deref_mut() {
            cb(&format!("{path}{name}"), 0, 0);
        }

        let old = source_final_path(source, &path, &name);
        let new_shadow = shadow_path(dest, &path, &prefix, &name, "new");

        match copy::link_or_copy(&old, &new_shadow) {
            Ok(()) => {}
            Err(err) if err.is_kind(io::ErrorKind::NotFound) => {
                mkdir_parents(source, dest, &path, progress.as_deref_mut())?;
                copy::link_or_copy(&old, &new_shadow)?;
            }
            Err(err) => return Err(err),
        }
    }

    journal.set_global_flag(COPIED_NEW)
}

/// backup_old(dest): snapshot every pre-existing final path into an `.old`
/// shadow before `replace` overwrites it.
pub fn backup_old(journal: &mut Journal, dest: &Path) -> Result<()> {
    require_flags(journal, COPIED_NEW, BACKED_OLD_UP | ROLLBACK_STARTED)?;

    let prefix = journal.prefix().to_string();
    let entries: Vec<Entry> = journal.entries().collect();

    for e in entries {
        let flags = journal.entry_flags(e);
        if flags & FILE_IGNORE != 0 {
            continue;
        }
        let (path, name) = entry_paths(journal, e);
        let final_p = final_path(dest, &path, &name);

        if flags & FILE_REMOVE != 0 {
            match fs::symlink_metadata(&final_p) {
                Ok(meta) if meta.is_dir() => {
                    journal.set_file_flag(e, FILE_DIR);
                    continue;
                }
                _ => {}
            }
        }

        let old_shadow = shadow_path(dest, &path, &prefix, &name, "old");
        match copy::link_or_copy(&final_p, &old_shadow) {
            Ok(()) => journal.set_file_flag(e, FILE_BACKED_UP),
            Err(err) if err.is_kind(io::ErrorKind::NotFound) => {}
            Err(err) => return Err(err),
        }
    }

    journal.set_global_flag(BACKED_OLD_UP)
}

/// replace(dest): move each `.new` shadow onto its final path, or unlink the
/// final path outright for a non-directory removal entry.
pub fn replace(journal: &mut Journal, dest: &Path) -> Result<()> {
    require_flags(
        journal,
        COPIED_NEW | BACKED_OLD_UP,
        REPLACED | ROLLBACK_STARTED,
    )?;

    let prefix = journal.prefix().to_string();

    for e in journal.entries() {
        let flags = journal.entry_flags(e);
        if flags & FILE_IGNORE != 0 {
            continue;
        }
        let (path, name) = entry_paths(journal, e);
        let final_p = final_path(dest, &path, &name);

        if flags & FILE_REMOVE != 0 {
            if flags & FILE_DIR != 0 {
                continue;
            }
            if let Err(e) = fs::remove_file(&final_p) {
                if e.kind() != io::ErrorKind::NotFound {
                    return Err(Error::io("unlink", e, &final_p));
                }
            }
        } else {
            let new_shadow = shadow_path(dest, &path, &prefix, &name, "new");
            copy::mv(&new_shadow, &final_p)?;
        }
    }

    journal.set_global_flag(REPLACED)
}

/// cleanup(dest): remove what `replace` left behind (`.old` shadows, deferred
/// removal directories) and report the outcome of every removal entry.
///
/// The original project's cleanup loop skips `FILE_DIR` entries' actual
/// removal work via a `continue` that fires before the directory-removal
/// branch is reached, so a removed directory is never rmdir'd. This follows
/// the specification's text instead: `FILE_DIR` entries are rmdir'd here.
pub fn cleanup(journal: &mut Journal, dest: &Path, mut removal: Option<RemovalFn<'_>>) -> Result<()> {
    require_flags(journal, REPLACED, 0)?;

    let prefix = journal.prefix().to_string();

    for e in journal.entries() {
        let flags = journal.entry_flags(e);
        let (path, name) = entry_paths(journal, e);
        let relpath = format!("{path}{name}");

        if flags & FILE_REMOVE != 0 {
            if let Some(cb) = removal.as_deref_mut() {
                if flags & FILE_IGNORE != 0 {
                    cb(&relpath, libc::EEXIST);
                } else if flags & (FILE_BACKED_UP | FILE_DIR) == 0 {
                    cb(&relpath, libc::ENOENT);
                }
            }
        }

        if flags & FILE_IGNORE != 0 {
            continue;
        }

        let outcome = if flags & FILE_DIR != 0 {
            let final_p = final_path(dest, &path, &name);
            Some(remove_dir_reporting(&final_p)?)
        } else if flags & FILE_BACKED_UP != 0 {
            let old_shadow = shadow_path(dest, &path, &prefix, &name, "old");
            Some(remove_file_reporting(&old_shadow)?)
        } else {
            None
        };

        if let Some(outcome) = outcome {
            if flags & FILE_REMOVE != 0 {
                if let Some(cb) = removal.as_deref_mut() {
                    cb(&relpath, outcome);
                }
            }
        }
    }

    Ok(())
}

/// rollback_new(dest): remove every `.new` shadow this run produced. Safe to
/// call even when `copy_new` never ran (nothing exists to remove).
pub fn rollback_new(journal: &mut Journal, dest: &Path) -> Result<()> {
    journal.set_global_flag(ROLLBACK_STARTED)?;

    let prefix = journal.prefix().to_string();

    for e in journal.entries() {
        let flags = journal.entry_flags(e);
        if flags & FILE_REMOVE != 0 {
            continue;
        }
        let (path, name) = entry_paths(journal, e);
        let target = if flags & FILE_DIR != 0 {
            final_path(dest, &path, &name)
        } else {
            shadow_path(dest, &path, &prefix, &name, "new")
        };
        remove_tolerant(&target, flags & FILE_DIR != 0)?;
    }

    Ok(())
}

/// rollback_old(dest): remove every `.old` shadow. A no-op whenever
/// `BACKED_OLD_UP` never completed (the precondition this enforces), kept as
/// its own step purely to preserve the rollback ordering with `rollback_new`.
pub fn rollback_old(journal: &mut Journal, dest: &Path) -> Result<()> {
    require_flags(journal, 0, BACKED_OLD_UP)?;
    journal.set_global_flag(ROLLBACK_STARTED)?;

    let prefix = journal.prefix().to_string();

    for e in journal.entries() {
        let flags = journal.entry_flags(e);
        if flags & (FILE_IGNORE | FILE_DIR) != 0 {
            continue;
        }
        let (path, name) = entry_paths(journal, e);
        let old_shadow = shadow_path(dest, &path, &prefix, &name, "old");
        remove_tolerant(&old_shadow, false)?;
    }

    Ok(())
}

/// rollback_replace(dest): restore every backed-up original to its final
/// path (or unlink the final path if nothing was backed up), and remove the
/// `.new` shadow for every entry — this is the sole rollback transition taken
/// once `BACKED_OLD_UP` is set but `REPLACED` is not, so it must undo both
/// what `backup_old` and `copy_new` left behind; nothing downstream of it
/// runs `rollback_new` to pick up the latter.
pub fn rollback_replace(journal: &mut Journal, dest: &Path) -> Result<()> {
    require_flags(journal, COPIED_NEW | BACKED_OLD_UP, REPLACED)?;
    journal.set_global_flag(ROLLBACK_STARTED)?;

    let prefix = journal.prefix().to_string();

    for e in journal.entries() {
        let flags = journal.entry_flags(e);
        if flags & (FILE_IGNORE | FILE_DIR) != 0 {
            continue;
        }
        let (path, name) = entry_paths(journal, e);
        let final_p = final_path(dest, &path, &name);

        if flags & FILE_BACKED_UP != 0 {
            let old_shadow = shadow_path(dest, &path, &prefix, &name, "old");
            match copy::mv(&old_shadow, &final_p) {
                Ok(()) => {}
                Err(err) if err.is_kind(io::ErrorKind::NotFound) => {}
                Err(err) => return Err(err),
            }
        } else if let Err(e) = fs::remove_file(&final_p) {
            if e.kind() != io::ErrorKind::NotFound {
                return Err(Error::io("unlink", e, &final_p));
            }
        }

        if flags & FILE_REMOVE == 0 {
            let new_shadow = shadow_path(dest, &path, &prefix, &name, "new");
            remove_tolerant(&new_shadow, false)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests;
