#[cfg(not(unix))]
fn main() {
    eprintln!("ainstall: only available on Unix");
    std::process::exit(1);
}

// ainstall -- crash-safe, resumable, rollback-capable file tree installer
//
// Usage: ainstall [options] journal-file source dest

#[cfg(unix)]
use std::path::{Path, PathBuf};
#[cfg(unix)]
use std::process;
#[cfg(unix)]
use std::sync::atomic::{AtomicBool, Ordering};

#[cfg(unix)]
use ainstall::common::io::read_stdin_paths;
#[cfg(unix)]
use ainstall::journal::{Journal, Seed};
#[cfg(unix)]
use ainstall::merge;

#[cfg(unix)]
const TOOL_NAME: &str = "ainstall";
#[cfg(unix)]
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(unix)]
fn print_help() {
    println!("Usage: {} [options] journal-file source dest", TOOL_NAME);
    println!();
    println!("Options:");
    println!("    --help, -h          this help message");
    println!("    --version, -V       print program version");
    println!();
    println!("    --input-files, -i   read old paths from stdin (one per line)");
    println!("    --no-replace, -n    terminate before the replacement step");
    println!("    --onestep, -1       perform a smallest step possible");
    println!("    --resume, -r        resume existing merge, do not try creating new one");
    println!("    --rollback, -R      roll existing merge back");
    println!("    --verbose, -v       report progress verbosely");
}

/// Set from the `SIGINT`/`SIGTERM`/`SIGHUP` handler (async-signal-safe: only
/// an atomic store), then polled at the top of the main loop. This is the one
/// deliberate divergence from the original project, whose handler instead
/// re-entered the merge loop synchronously from signal context.
#[cfg(unix)]
static ROLLBACK_REQUESTED: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn request_rollback(_sig: libc::c_int) {
    ROLLBACK_REQUESTED.store(true, Ordering::SeqCst);
}

#[cfg(unix)]
fn install_signal_handlers() {
    unsafe {
        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = libc::SIG_IGN;
        libc::sigemptyset(&mut sa.sa_mask);
        sa.sa_flags = 0;
        libc::sigaction(libc::SIGUSR1, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGUSR2, &sa, std::ptr::null_mut());

        let mut sa: libc::sigaction = std::mem::zeroed();
        sa.sa_sigaction = request_rollback as usize;
        libc::sigemptyset(&mut sa.sa_mask);
        libc::sigaddset(&mut sa.sa_mask, libc::SIGINT);
        libc::sigaddset(&mut sa.sa_mask, libc::SIGTERM);
        libc::sigaddset(&mut sa.sa_mask, libc::SIGHUP);
        sa.sa_flags = 0;
        libc::sigaction(libc::SIGINT, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGTERM, &sa, std::ptr::null_mut());
        libc::sigaction(libc::SIGHUP, &sa, std::ptr::null_mut());
    }
}

#[cfg(unix)]
struct DriverState {
    journal: Journal,
    source: PathBuf,
    dest: PathBuf,
    journal_file: PathBuf,
    rollback: bool,
    no_replace: bool,
    verbose: bool,
    onestep: bool,
}

#[cfg(unix)]
fn print_progress(path: &str, megs: u64, _size: u64) {
    if megs == 0 {
        eprintln!(">>> {path}");
    }
}

#[cfg(unix)]
fn print_removal(path: &str, result: i32) {
    if result == 0 {
        eprintln!("<<<          {path}");
    } else if result == libc::EEXIST {
        eprintln!("--- REPLACED {path}");
    } else if result == libc::ENOENT {
        eprintln!("--- !EXIST   {path}");
    } else if result == libc::ENOTEMPTY {
        eprintln!("--- !EMPTY   {path}");
    }
}

/// Acquire a journal: open it if it already exists; otherwise, unless
/// `--resume`/`--rollback` was given, create a fresh one rooted at `source`
/// (optionally seeded from stdin under `--input-files`) and open that.
#[cfg(unix)]
fn acquire_journal(
    journal_file: &Path,
    source: &Path,
    input_files: bool,
    resume: bool,
    rollback: bool,
) -> Result<Journal, String> {
    match Journal::open(journal_file) {
        Ok(j) => Ok(j),
        Err(e) if e.is_kind(std::io::ErrorKind::NotFound) && !resume && !rollback => {
            println!("* Journal not found, creating...");

            let lines;
            let seed = if input_files {
                lines = read_stdin_paths()
                    .map_err(|e| format!("file list read failed: {e}"))?;
                Seed::Removals(&lines)
            } else {
                Seed::Tree(source)
            };

            ainstall::journal::create(journal_file, seed)
                .map_err(|e| format!("journal creation failed: {e}"))?;

            Journal::open(journal_file).map_err(|e| format!("journal open failed: {e}"))
        }
        Err(e) => Err(format!("journal open failed: {e}")),
    }
}

/// The merge-phase dispatch loop: one phase per iteration, rollback handled
/// as a single-branch dispatch on current journal flags rather than a
/// sequential pipeline (the three rollback transitions are mutually
/// exclusive, selected by how far the forward run got).
#[cfg(unix)]
fn run_loop(state: &mut DriverState) -> i32 {
    loop {
        if ROLLBACK_REQUESTED.swap(false, Ordering::SeqCst) {
            state.rollback = true;
        }

        let flags = state.journal.flags();

        if flags & merge::ROLLBACK_STARTED != 0 || state.rollback {
            if flags & merge::REPLACED != 0 {
                println!("! Replacement complete, rollback impossible.");
                return 1;
            } else if flags & merge::BACKED_OLD_UP != 0 {
                println!("* Rolling back replacement...");
                if let Err(e) = merge::rollback_replace(&mut state.journal, &state.dest) {
                    println!("* Replacement rollback failed: {e}");
                    return 1;
                }
            } else {
                println!("* Rolling back old backup...");
                if let Err(e) = merge::rollback_old(&mut state.journal, &state.dest) {
                    println!("* Old rollback failed: {e}");
                    return 1;
                }
            }

            println!("* Rolling back new copying...");
            return match merge::rollback_new(&mut state.journal, &state.dest) {
                Err(e) => {
                    println!("* New rollback failed: {e}");
                    1
                }
                Ok(()) => {
                    println!("* Rollback successful.");
                    if let Err(e) = std::fs::remove_file(&state.journal_file) {
                        println!("Journal removal failed: {e}");
                    }
                    0
                }
            };
        } else if flags & merge::REPLACED != 0 {
            println!("* Post-merge clean up...");
            let mut removal_cb = print_removal;
            let removal: Option<merge::RemovalFn<'_>> = if state.verbose {
                Some(&mut removal_cb)
            } else {
                None
            };
            return match merge::cleanup(&mut state.journal, &state.dest, removal) {
                Err(e) => {
                    println!("Cleanup failed: {e}");
                    1
                }
                Ok(()) => {
                    println!("* Install done.");
                    if let Err(e) = std::fs::remove_file(&state.journal_file) {
                        println!("Journal removal failed: {e}");
                    }
                    0
                }
            };
        } else if flags & merge::BACKED_OLD_UP != 0 && flags & merge::COPIED_NEW != 0 {
            if state.no_replace {
                return 0;
            }
            println!("* Replacing files...");
            if let Err(e) = merge::replace(&mut state.journal, &state.dest) {
                println!("Replacement failed: {e}");
                state.rollback = true;
            }
        } else if flags & merge::COPIED_NEW != 0 {
            println!("* Backing up existing files...");
            if let Err(e) = merge::backup_old(&mut state.journal, &state.dest) {
                println!("Backing old up failed: {e}");
                return 1;
            }
        } else {
            println!("* Copying new files...");
            let mut progress_cb =
                |path: &str, megs: u64, size: u64| print_progress(path, megs, size);
            let progress: Option<merge::ProgressFn<'_>> = if state.verbose {
                Some(&mut progress_cb)
            } else {
                None
            };
            if let Err(e) =
                merge::copy_new(&mut state.journal, &state.source, &state.dest, progress)
            {
                println!("Copying new failed: {e}");
                return 1;
            }
        }

        if state.onestep {
            return 0;
        }
    }
}

#[cfg(unix)]
fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut input_files = false;
    let mut resume = false;
    let mut rollback = false;
    let mut no_replace = false;
    let mut verbose = false;
    let mut onestep = false;
    let mut operands: Vec<String> = Vec::new();

    for arg in &args {
        match arg.as_str() {
            "-h" | "--help" => {
                print_help();
                return;
            }
            "-V" | "--version" => {
                println!("{TOOL_NAME} {VERSION}");
                return;
            }
            "-i" | "--input-files" => input_files = true,
            "-n" | "--no-replace" => no_replace = true,
            "-1" | "--onestep" => onestep = true,
            "-r" | "--resume" => resume = true,
            "-R" | "--rollback" => rollback = true,
            "-v" | "--verbose" => verbose = true,
            _ => operands.push(arg.clone()),
        }
    }

    if operands.len() < 3 {
        println!("Synopsis: {TOOL_NAME} [options] journal-file source dest");
        return;
    }

    let journal_file = PathBuf::from(&operands[0]);
    let source = PathBuf::from(&operands[1]);
    let dest = PathBuf::from(&operands[2]);

    let journal = match acquire_journal(&journal_file, &source, input_files, resume, rollback) {
        Ok(j) => j,
        Err(msg) => {
            eprintln!("{TOOL_NAME}: {msg}");
            process::exit(1);
        }
    };
    println!(
        "* Journal file open, {}.",
        if rollback { "rolling back" } else { "resuming" }
    );

    install_signal_handlers();

    let mut state = DriverState {
        journal,
        source,
        dest,
        journal_file,
        rollback,
        no_replace,
        verbose,
        onestep,
    };

    let ret = run_loop(&mut state);

    if let Err(e) = state.journal.close() {
        eprintln!("{TOOL_NAME}: journal close failed: {e}");
        process::exit(1);
    }

    process::exit(ret);
}
