//! Pidfiles: decimal text of the OS process id, nothing else.
//!
//! An unreadable, unparsable, non-positive or unsignalable pid means "not
//! running". None of those are errors.

use std::io;
use std::path::Path;

pub fn write(path: &Path, pid: u32) -> io::Result<()> {
    std::fs::write(path, pid.to_string())
}

/// The recorded pid, if the file holds a usable one.
pub fn read(path: &Path) -> Option<i32> {
    let text = std::fs::read_to_string(path).ok()?;
    // kill(0, ..) and kill(-1, ..) address groups, never a single process.
    text.trim().parse::<i32>().ok().filter(|pid| *pid > 0)
}

pub fn remove(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

/// Probe with the null signal.
pub fn is_alive(pid: i32) -> bool {
    pid > 0 && unsafe { libc::kill(pid, 0) } == 0
}

pub fn is_running(path: &Path) -> bool {
    read(path).is_some_and(is_alive)
}

pub fn signal(pid: i32, sig: libc::c_int) -> io::Result<()> {
    if pid <= 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "refusing to signal pid <= 0"));
    }
    if unsafe { libc::kill(pid, sig) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}
