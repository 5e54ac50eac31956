//! Process-level ownership of a store file.
//!
//! The dispatch lock persisted in the store only tells a crashed attempt
//! apart from a running one when a single process owns the store. Every
//! command that opens a store first takes an advisory OS file lock
//! (flock) scoped to the store path and holds it for the process lifetime.
//! Lock files are never removed, so every process contends on one inode.

use anyhow::{Context, Result};
use std::collections::hash_map::DefaultHasher;
use std::fs::{self, File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{self, Seek, SeekFrom, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

const STORE_LOCK_FILE: &str = "beacon-store.lock";

/// Held while this process owns a store.
pub struct StoreGuard {
    _lock: ProcessLock,
}

/// Take ownership of the store at `store_path`, failing if another
/// beacon process already owns it.
pub fn acquire_store_guard(store_path: &Path) -> Result<StoreGuard> {
    match try_acquire_store_guard(store_path)? {
        Some(guard) => Ok(guard),
        None => anyhow::bail!(
            "another beacon process is using the store at {}",
            store_path.display()
        ),
    }
}

/// Take ownership of the store if it is free.
pub fn try_acquire_store_guard(store_path: &Path) -> Result<Option<StoreGuard>> {
    Ok(try_acquire_lock(STORE_LOCK_FILE, store_path)?.map(|lock| StoreGuard { _lock: lock }))
}

struct ProcessLock {
    file: File,
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        let _ = unlock_file(&self.file);
    }
}

fn try_acquire_lock(filename: &str, store_path: &Path) -> Result<Option<ProcessLock>> {
    let dir = lock_dir();
    fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create runtime lock directory: {}", dir.display()))?;

    let path = lock_path(filename, store_path);
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open lock file: {}", path.display()))?;

    match lock_file_nonblocking(&file) {
        Ok(()) => {
            // Owner info for debugging
            let _ = file.set_len(0);
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "pid={}", std::process::id());
            let _ = writeln!(file, "store={}", store_path.display());
            let _ = file.flush();

            Ok(Some(ProcessLock { file }))
        }
        Err(e) if is_lock_busy(&e) => Ok(None),
        Err(e) => Err(e).with_context(|| format!("failed to lock file: {}", path.display())),
    }
}

fn lock_dir() -> PathBuf {
    let mut dir = match std::env::var_os("XDG_RUNTIME_DIR") {
        Some(path) if !path.is_empty() => PathBuf::from(path),
        _ => std::env::temp_dir(),
    };
    dir.push("beacon");
    dir
}

fn lock_path(filename: &str, store_path: &Path) -> PathBuf {
    lock_dir().join(scoped_lock_filename(filename, store_path))
}

fn scoped_lock_filename(base_filename: &str, store_path: &Path) -> String {
    let mut hasher = DefaultHasher::new();
    store_path.to_string_lossy().hash(&mut hasher);
    let digest = hasher.finish();
    format!("{base_filename}.{digest:016x}")
}

fn is_lock_busy(error: &io::Error) -> bool {
    matches!(error.kind(), io::ErrorKind::WouldBlock)
        || matches!(error.raw_os_error(), Some(11) | Some(35))
}

#[cfg(unix)]
fn lock_file_nonblocking(file: &File) -> io::Result<()> {
    const LOCK_EX: i32 = 2;
    const LOCK_NB: i32 = 4;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_EX | LOCK_NB) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
fn unlock_file(file: &File) -> io::Result<()> {
    const LOCK_UN: i32 = 8;
    let fd = file.as_raw_fd();
    // SAFETY: flock is called with a valid file descriptor and constant flags.
    let rc = unsafe { flock(fd, LOCK_UN) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(unix)]
extern "C" {
    fn flock(fd: i32, operation: i32) -> i32;
}

#[cfg(not(unix))]
compile_error!("beacon process locks currently require Unix (macOS/Linux)");

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_second_owner_is_refused_until_release() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("store.db");

        let first = acquire_store_guard(&store).unwrap();
        assert!(try_acquire_store_guard(&store).unwrap().is_none());
        assert!(acquire_store_guard(&store).is_err());

        drop(first);
        assert!(try_acquire_store_guard(&store).unwrap().is_some());
    }

    #[test]
    fn test_waiter_and_newcomer_never_both_own_after_release() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("store.db");

        let first = acquire_store_guard(&store).unwrap();
        // A second process opened the lock file and is about to flock it
        let waiter = OpenOptions::new()
            .read(true)
            .write(true)
            .open(lock_path(STORE_LOCK_FILE, &store))
            .unwrap();
        drop(first);

        assert!(lock_file_nonblocking(&waiter).is_ok());
        assert!(try_acquire_store_guard(&store).unwrap().is_none());

        unlock_file(&waiter).unwrap();
        assert!(try_acquire_store_guard(&store).unwrap().is_some());
    }

    #[test]
    fn test_locks_are_scoped_per_store() {
        let dir = TempDir::new().unwrap();
        let _a = acquire_store_guard(&dir.path().join("a.db")).unwrap();
        assert!(acquire_store_guard(&dir.path().join("b.db")).is_ok());
    }
}
