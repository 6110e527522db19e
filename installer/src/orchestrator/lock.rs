//! Exclusive advisory lock over the installation root.
//!
//! `flock(LOCK_EX | LOCK_NB)` on `<root>/.install.lock`, held for the guard's lifetime. The
//! kernel drops the lock when the process dies, so a crashed run never leaves a stale lock.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::{debug, info};

use crate::error::InstallError;

pub struct InstallLock {
    _file: File,
    path: PathBuf,
}

impl std::fmt::Debug for InstallLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallLock")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl InstallLock {
    /// Take the lock or fail immediately with `InstallError::Lock`.
    pub fn acquire(path: &Path) -> Result<Self, InstallError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                InstallError::precondition(format!(
                    "Cannot create installation root {:?}: {}",
                    parent, e
                ))
            })?;
        }

        let mut opts = OpenOptions::new();
        opts.create(true).read(true).write(true).truncate(false);
        #[cfg(unix)]
        opts.mode(0o600);
        let mut file = opts.open(path).map_err(|e| {
            InstallError::precondition(format!("Cannot open lock file {:?}: {}", path, e))
        })?;

        match try_flock_exclusive(&file) {
            Ok(true) => {}
            Ok(false) => {
                return Err(InstallError::Lock {
                    path: path.to_path_buf(),
                })
            }
            Err(e) => {
                return Err(InstallError::precondition(format!(
                    "flock on {:?} failed: {}",
                    path, e
                )))
            }
        }

        // Holder info for operators inspecting a contended lock.
        if let Err(e) = write_holder(&mut file) {
            debug!(
                "[PHASE: validating] [STEP: lock] Could not record lock holder in {:?}: {}",
                path, e
            );
        }
        info!(
            "[PHASE: validating] [STEP: lock] Acquired install lock {:?}",
            path
        );
        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_holder(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    writeln!(
        file,
        "pid={} since={}",
        std::process::id(),
        chrono::Utc::now().to_rfc3339()
    )?;
    file.flush()
}

fn try_flock_exclusive(file: &File) -> io::Result<bool> {
    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;
        let fd = file.as_raw_fd();
        // SAFETY: fd is a valid descriptor owned by `file` for the duration of the call.
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EWOULDBLOCK)
        {
            return Ok(false);
        }
        Err(err)
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        Ok(true)
    }
}
