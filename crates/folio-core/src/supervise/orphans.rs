//! Cleanup of renderer processes left behind by a previous host.
//!
//! When a host crashes, its renderer is re-parented to init and keeps
//! running. Such processes are recognised by their command line (program
//! and arguments) and by having init as their parent.

use std::ffi::OsString;
use std::path::Path;

use crate::error::Result;

/// Terminate orphaned renderer processes started as `program args...`.
///
/// Returns the ids of the processes that were signalled. Only supported on
/// Linux; elsewhere nothing is reaped.
pub fn reap_orphans(program: &Path, args: &[OsString]) -> Result<Vec<u32>> {
    let orphans = find_orphans(program, args)?;
    let mut reaped = Vec::with_capacity(orphans.len());
    for pid in orphans {
        if terminate(pid) {
            reaped.push(pid);
        }
    }
    if !reaped.is_empty() {
        tracing::info!(
            "terminated {} orphaned renderer process(es): {:?}",
            reaped.len(),
            reaped
        );
    }
    Ok(reaped)
}

#[cfg(target_os = "linux")]
fn find_orphans(program: &Path, args: &[OsString]) -> Result<Vec<u32>> {
    let own_pid = std::process::id();
    let mut found = Vec::new();

    for entry in std::fs::read_dir("/proc")? {
        let Ok(entry) = entry else { continue };
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if pid == own_pid {
            continue;
        }

        // Processes may exit while we look at them.
        let Ok(cmdline) = std::fs::read(entry.path().join("cmdline")) else {
            continue;
        };
        if !matches_command(&cmdline, program, args) {
            continue;
        }
        let Ok(stat) = std::fs::read_to_string(entry.path().join("stat")) else {
            continue;
        };
        if is_orphan(parent_pid(&stat), own_pid) {
            found.push(pid);
        }
    }

    Ok(found)
}

#[cfg(not(target_os = "linux"))]
fn find_orphans(_program: &Path, _args: &[OsString]) -> Result<Vec<u32>> {
    tracing::debug!("orphaned renderer detection is only supported on Linux");
    Ok(Vec::new())
}

#[cfg(unix)]
fn terminate(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc != 0 {
        tracing::warn!(
            "failed to terminate orphaned renderer {}: {}",
            pid,
            std::io::Error::last_os_error()
        );
    }
    rc == 0
}

#[cfg(not(unix))]
fn terminate(_pid: u32) -> bool {
    false
}

/// Check a NUL-separated `/proc/<pid>/cmdline` against `program args...`.
///
/// The program matches by exact path or by file name; arguments must match
/// exactly.
pub(crate) fn matches_command(cmdline: &[u8], program: &Path, args: &[OsString]) -> bool {
    let cmdline = cmdline.strip_suffix(&[0]).unwrap_or(cmdline);
    if cmdline.is_empty() {
        return false;
    }

    let mut parts = cmdline.split(|&b| b == 0);
    let Some(argv0) = parts.next() else {
        return false;
    };
    if !program_matches(argv0, program) {
        return false;
    }

    let rest: Vec<&[u8]> = parts.collect();
    rest.len() == args.len()
        && rest
            .iter()
            .zip(args)
            .all(|(seen, expected)| *seen == expected.as_encoded_bytes())
}

fn program_matches(argv0: &[u8], program: &Path) -> bool {
    if argv0 == program.as_os_str().as_encoded_bytes() {
        return true;
    }
    let Ok(argv0) = std::str::from_utf8(argv0) else {
        return false;
    };
    match (Path::new(argv0).file_name(), program.file_name()) {
        (Some(seen), Some(expected)) => seen == expected,
        _ => false,
    }
}

/// Whether a matching process with parent `ppid` was left behind by a
/// previous host.
///
/// When this host is itself pid 1 its live children also have parent 1 and
/// nothing can be told apart, so nothing is an orphan.
pub(crate) fn is_orphan(ppid: Option<u32>, own_pid: u32) -> bool {
    own_pid != 1 && ppid == Some(1)
}

/// Parent pid from the contents of `/proc/<pid>/stat`.
///
/// The command name is parenthesised and may itself contain spaces or
/// parentheses, so fields are counted from the last `)`.
pub(crate) fn parent_pid(stat: &str) -> Option<u32> {
    let rest = &stat[stat.rfind(')')? + 1..];
    let mut fields = rest.split_whitespace();
    let _state = fields.next()?;
    fields.next()?.parse().ok()
}
