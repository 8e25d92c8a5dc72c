use super::*;
use crate::journal::{self, Seed};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};

fn seed_source(root: &Path) {
    fs::write(root.join("a"), b"hello").unwrap();
    fs::create_dir(root.join("b")).unwrap();
    symlink("/tmp/x", root.join("b").join("c")).unwrap();
}

fn make_journal(dir: &Path, source: &Path) -> (PathBuf, Journal) {
    let journal_path = dir.join("journal");
    journal::create(&journal_path, Seed::Tree(source)).unwrap();
    let j = Journal::open(&journal_path).unwrap();
    (journal_path, j)
}

#[test]
fn full_forward_run_installs_tree_and_no_shadows_remain() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    let dest = dir.path().join("dest");
    fs::create_dir(&source).unwrap();
    fs::create_dir(&dest).unwrap();
    seed_source(&source);

    let (journal_path, mut j) = make_journal(dir.path(), &source);

    copy_new(&mut j, &source, &dest, None).unwrap();
    backup_old(&mut j, &dest).unwrap();
    replace(&mut j, &dest).unwrap();
    cleanup(&mut j, &dest, None).unwrap();

    assert_eq!(fs::read(dest.join("a")).unwrap(), b"hello");
    assert_eq!(
        fs::read_link(dest.join("b").join("c")).unwrap(),
        Path::new("/tmp/x")
    );

    let leftover: Vec<_> = fs::read_dir(&dest)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftover.len(), 2);

    drop(j);
    fs::remove_file(&journal_path).unwrap();
}

#[test]
fn replace_overwrites_existing_file_and_backs_it_up() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    let dest = dir.path().join("dest");
    fs::create_dir(&source).unwrap();
    fs::create_dir(&dest).unwrap();
    fs::write(source.join("a"), b"new").unwrap();
    fs::write(dest.join("a"), b"old").unwrap();

    let (_journal_path, mut j) = make_journal(dir.path(), &source);

    copy_new(&mut j, &source, &dest, None).unwrap();
    backup_old(&mut j, &dest).unwrap();
    replace(&mut j, &dest).unwrap();

    assert_eq!(fs::read(dest.join("a")).unwrap(), b"new");

    let e = j.first().unwrap();
    assert_eq!(j.entry_flags(e) & FILE_BACKED_UP, FILE_BACKED_UP);
}

#[test]
fn rollback_replace_restores_backed_up_original_and_clears_new_shadow() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    let dest = dir.path().join("dest");
    fs::create_dir(&source).unwrap();
    fs::create_dir(&dest).unwrap();
    fs::write(source.join("a"), b"new").unwrap();
    fs::write(dest.join("a"), b"old").unwrap();

    let (_journal_path, mut j) = make_journal(dir.path(), &source);

    copy_new(&mut j, &source, &dest, None).unwrap();
    backup_old(&mut j, &dest).unwrap();

    // Simulate a crash between BACKED_OLD_UP and REPLACED: roll back from
    // here directly, without ever calling `replace`.
    rollback_replace(&mut j, &dest).unwrap();

    assert_eq!(fs::read(dest.join("a")).unwrap(), b"old");
    let leftover: Vec<_> = fs::read_dir(&dest)
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(leftover, vec![std::ffi::OsString::from("a")]);
}

#[test]
fn copy_new_twice_is_rejected_by_precondition() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    let dest = dir.path().join("dest");
    fs::create_dir(&source).unwrap();
    fs::create_dir(&dest).unwrap();
    seed_source(&source);

    let (_journal_path, mut j) = make_journal(dir.path(), &source);

    copy_new(&mut j, &source, &dest, None).unwrap();
    let err = copy_new(&mut j, &source, &dest, None).unwrap_err();
    assert!(matches!(err, Error::InvalidState));
}

#[test]
fn removal_entry_conflicting_with_source_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    let dest = dir.path().join("dest");
    fs::create_dir(&source).unwrap();
    fs::create_dir(&dest).unwrap();
    fs::write(source.join("a"), b"new").unwrap();
    fs::write(dest.join("a"), b"old").unwrap();

    let journal_path = dir.path().join("journal");
    journal::create(&journal_path, Seed::Removals(&["a".to_string()])).unwrap();
    let mut j = Journal::open(&journal_path).unwrap();

    copy_new(&mut j, &source, &dest, None).unwrap();

    let e = j.first().unwrap();
    assert_eq!(j.entry_flags(e) & FILE_IGNORE, FILE_IGNORE);
}

#[test]
fn removal_entry_rmdirs_directory_in_cleanup() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    let dest = dir.path().join("dest");
    fs::create_dir(&source).unwrap();
    fs::create_dir(&dest).unwrap();
    fs::create_dir(dest.join("stale")).unwrap();

    let journal_path = dir.path().join("journal");
    journal::create(&journal_path, Seed::Removals(&["stale".to_string()])).unwrap();
    let mut j = Journal::open(&journal_path).unwrap();

    copy_new(&mut j, &source, &dest, None).unwrap();
    backup_old(&mut j, &dest).unwrap();
    replace(&mut j, &dest).unwrap();

    let mut reported = Vec::new();
    let mut cb = |path: &str, outcome: i32| reported.push((path.to_string(), outcome));
    cleanup(&mut j, &dest, Some(&mut cb)).unwrap();

    assert!(!dest.join("stale").exists());
    assert_eq!(reported, vec![("/stale".to_string(), 0)]);
}

#[test]
fn mkdir_parents_is_invoked_when_new_shadow_parent_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("source");
    let dest = dir.path().join("dest");
    fs::create_dir_all(source.join("nested")).unwrap();
    fs::create_dir(&dest).unwrap();
    fs::write(source.join("nested").join("f"), b"x").unwrap();

    let (_journal_path, mut j) = make_journal(dir.path(), &source);

    copy_new(&mut j, &source, &dest, None).unwrap();
    backup_old(&mut j, &dest).unwrap();
    replace(&mut j, &dest).unwrap();

    assert_eq!(fs::read(dest.join("nested").join("f")).unwrap(), b"x");
}
