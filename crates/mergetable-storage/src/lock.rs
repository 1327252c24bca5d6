//! Advisory directory lock
//!
//! A table directory is owned by one open handle at a time. The lock is an
//! exclusive `flock` on the `LOCK` file, released when the handle drops.

use mergetable_core::{Error, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::io::AsRawFd;

/// Name of the lock file inside a table directory
pub const LOCK_FILE: &str = "LOCK";

/// Held lock on a table directory
#[derive(Debug)]
pub struct DirLock {
    _file: File,
    path: PathBuf,
}

impl DirLock {
    /// Take the lock on `dir`, failing with `LockHeld` if another handle
    /// (in this or any other process) already has it.
    pub fn acquire(dir: &Path) -> Result<Self> {
        let path = dir.join(LOCK_FILE);

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)?;

        if let Err(e) = try_lock(&file) {
            return Err(if e.kind() == io::ErrorKind::WouldBlock {
                Error::LockHeld(dir.to_path_buf())
            } else {
                Error::Io(e)
            });
        }

        // Holder's pid, for whoever finds the table locked
        file.set_len(0)?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;

        Ok(Self { _file: file, path })
    }

    /// Path of the lock file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn try_lock(file: &File) -> io::Result<()> {
    use libc::{flock, LOCK_EX, LOCK_NB};

    let fd = file.as_raw_fd();
    // SAFETY: `fd` is a valid open descriptor owned by `file` for the
    // duration of the call.
    let result = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if result != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn try_lock(_file: &File) -> io::Result<()> {
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lock_is_exclusive() {
        let dir = tempdir().unwrap();

        let lock = DirLock::acquire(dir.path()).expect("Failed to acquire lock");
        assert!(lock.path().exists());

        let contents = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(contents.trim(), std::process::id().to_string());

        match DirLock::acquire(dir.path()) {
            Err(Error::LockHeld(path)) => assert_eq!(path, dir.path()),
            other => panic!("expected LockHeld, got {:?}", other),
        }
    }

    #[test]
    fn test_lock_released_on_drop() {
        let dir = tempdir().unwrap();

        let lock = DirLock::acquire(dir.path()).unwrap();
        drop(lock);

        DirLock::acquire(dir.path()).expect("lock should be free again");
    }
}
