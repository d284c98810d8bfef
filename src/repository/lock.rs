#![allow(unsafe_code)]
//! Cooperative per-session advisory file locks.
//!
//! The process writing a session holds an exclusive lock on
//! `_lockdir/<session_uuid>` for the session's lifetime. Repository scans
//! probe the lock to decide whether a `Running` header belongs to a live
//! process or a crashed one: if the lock can be acquired, the writer is
//! gone.
//!
//! POSIX record locks do not exclude the owning process, so in-process
//! liveness is tracked separately by the repository; this module only
//! answers about other processes.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::Result;

/// An exclusive hold on one session's lock file. Dropping releases the lock
/// and removes the file.
#[derive(Debug)]
pub struct SessionLock {
    file: Option<File>,
    path: PathBuf,
    session_id: Uuid,
}

impl SessionLock {
    /// Tries to take the session's lock without blocking. `None` means some
    /// other process holds it.
    pub fn acquire(lock_dir: &Path, session_id: Uuid) -> Result<Option<Self>> {
        let path = lock_path(lock_dir, session_id);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        if !sys::try_lock_exclusive(&file)? {
            return Ok(None);
        }
        Ok(Some(Self {
            file: Some(file),
            path,
            session_id,
        }))
    }

    /// The session the lock belongs to.
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Releases the lock and deletes the lock file.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = sys::unlock(&file);
            drop(file);
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// True when another process currently holds the session's lock. A missing
/// lock file means nobody does.
pub fn is_locked_elsewhere(lock_dir: &Path, session_id: Uuid) -> Result<bool> {
    let path = lock_path(lock_dir, session_id);
    let file = match OpenOptions::new().read(true).write(true).open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err.into()),
    };
    if sys::try_lock_exclusive(&file)? {
        let _ = sys::unlock(&file);
        Ok(false)
    } else {
        Ok(true)
    }
}

/// Deletes a session's stale lock file once recovery has finished with it.
pub fn remove_stale_lock(lock_dir: &Path, session_id: Uuid) {
    let _ = std::fs::remove_file(lock_path(lock_dir, session_id));
}

fn lock_path(lock_dir: &Path, session_id: Uuid) -> PathBuf {
    lock_dir.join(session_id.to_string())
}

#[cfg(unix)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::os::unix::io::AsRawFd;

    use crate::error::Result;

    pub fn try_lock_exclusive(file: &File) -> Result<bool> {
        let fd = file.as_raw_fd();
        let mut flock = libc::flock {
            l_type: libc::F_WRLCK as _,
            l_whence: libc::SEEK_SET as _,
            l_start: 0,
            l_len: 0,
            l_pid: 0,
        };
        loop {
            let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut flock) };
            if res == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EAGAIN) | Some(libc::EACCES) => return Ok(false),
                _ => return Err(err.into()),
            }
        }
    }

    pub fn unlock(file: &File) -> Result<()> {
        let fd = file.as_raw_fd();
        let mut flock = libc::flock {
            l_type: libc::F_UNLCK as _,
            l_whence: libc::SEEK_SET as _,
            l_start: 0,
            l_len: 0,
            l_pid: 0,
        };
        let res = unsafe { libc::fcntl(fd, libc::F_SETLK, &mut flock) };
        if res == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error().into())
        }
    }
}

#[cfg(windows)]
mod sys {
    use std::fs::File;
    use std::io;
    use std::mem::zeroed;
    use std::os::windows::io::AsRawHandle;

    use windows_sys::Win32::Foundation::ERROR_LOCK_VIOLATION;
    use windows_sys::Win32::Storage::FileSystem::{
        LockFileEx, UnlockFileEx, LOCKFILE_EXCLUSIVE_LOCK, LOCKFILE_FAIL_IMMEDIATELY,
    };
    use windows_sys::Win32::System::IO::OVERLAPPED;

    use crate::error::Result;

    pub fn try_lock_exclusive(file: &File) -> Result<bool> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            let flags = LOCKFILE_EXCLUSIVE_LOCK | LOCKFILE_FAIL_IMMEDIATELY;
            let res = LockFileEx(handle as isize, flags, 0, 1, 0, &mut overlapped);
            if res != 0 {
                Ok(true)
            } else {
                let err = io::Error::last_os_error();
                if matches!(err.raw_os_error(), Some(code) if code as u32 == ERROR_LOCK_VIOLATION)
                {
                    Ok(false)
                } else {
                    Err(err.into())
                }
            }
        }
    }

    pub fn unlock(file: &File) -> Result<()> {
        unsafe {
            let handle = file.as_raw_handle();
            let mut overlapped: OVERLAPPED = zeroed();
            let res = UnlockFileEx(handle as isize, 0, 1, 0, &mut overlapped);
            if res != 0 {
                Ok(())
            } else {
                Err(io::Error::last_os_error().into())
            }
        }
    }
}

#[cfg(not(any(unix, windows)))]
mod sys {
    use std::fs::File;

    use crate::error::{AgentError, Result};

    pub fn try_lock_exclusive(_file: &File) -> Result<bool> {
        Err(AgentError::InvalidArgument(
            "file locking unsupported on this platform".into(),
        ))
    }

    pub fn unlock(_file: &File) -> Result<()> {
        Ok(())
    }
}
