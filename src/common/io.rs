use std::io::{self, BufRead};

/// Block size for the attributed-copy content loop (§4.1).
pub const COPY_BLOCK_SIZE: usize = 65536;

/// Read newline-terminated paths from stdin for `--input-files` mode.
///
/// Each line has its trailing `\n` (and a preceding `\r`, if present) stripped;
/// blank lines are skipped.
pub fn read_stdin_paths() -> io::Result<Vec<String>> {
    let stdin = io::stdin();
    let mut paths = Vec::new();
    for line in stdin.lock().lines() {
        let line = line?;
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if !trimmed.is_empty() {
            paths.push(trimmed.to_string());
        }
    }
    Ok(paths)
}

/// Re-run `f` while it fails with `EINTR`, as every blocking syscall in the
/// copy primitive must (signals never abort an in-flight I/O operation here).
pub fn retry_eintr<T>(mut f: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match f() {
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}
