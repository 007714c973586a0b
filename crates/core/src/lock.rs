//! Host-level lock files serializing hardening sessions
//!
//! One file per scope under the runtime directory, holding
//! `<pid>\t<unix ms>` and an exclusive `flock`. The flock is what actually
//! excludes other processes; the content lets a waiter tell whether the
//! holder is still around.

use crate::error::{EngineError, Result};
use crate::time::now_ms;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Who holds a lock
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    pub pid: u32,
    pub acquired_at_ms: u64,
}

impl LockHolder {
    fn render(&self) -> String {
        format!("{}\t{}\n", self.pid, self.acquired_at_ms)
    }

    fn parse(text: &str) -> Option<Self> {
        let (pid, ts) = text.trim().split_once('\t')?;
        Some(Self {
            pid: pid.trim().parse().ok()?,
            acquired_at_ms: ts.trim().parse().ok()?,
        })
    }
}

/// Result of [`LockManager::inspect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held(LockHolder),
    /// Flock taken, holder line not written yet
    Acquiring,
    /// Lock file present but its holder is gone or too old
    Stale(Option<LockHolder>),
}

/// Hands out [`LockHandle`]s for named scopes
#[derive(Debug, Clone)]
pub struct LockManager {
    runtime_dir: PathBuf,
    stale_after: Duration,
}

impl LockManager {
    pub fn new(runtime_dir: impl Into<PathBuf>, stale_after: Duration) -> Self {
        Self {
            runtime_dir: runtime_dir.into(),
            stale_after,
        }
    }

    pub fn lock_path(&self, scope: &str) -> PathBuf {
        self.runtime_dir.join(format!("{scope}.lock"))
    }

    /// Acquire the lock for `scope`, polling until `timeout` elapses.
    ///
    /// Stale locks are reclaimed on the way. Fails with `LockTimeout` naming
    /// the live holder once the budget is spent.
    pub fn acquire(&self, scope: &str, timeout: Duration) -> Result<LockHandle> {
        if scope.is_empty() || scope.contains('/') {
            return Err(EngineError::Config(format!("invalid lock scope '{scope}'")));
        }
        std::fs::create_dir_all(&self.runtime_dir)
            .map_err(|e| EngineError::io(&self.runtime_dir, e))?;

        let path = self.lock_path(scope);
        let started = Instant::now();

        loop {
            let mut file = OpenOptions::new()
                .create(true)
                .read(true)
                .write(true)
                .open(&path)
                .map_err(|e| EngineError::io(&path, e))?;

            if try_flock_exclusive(&file).map_err(|e| EngineError::io(&path, e))? {
                // The file may have been unlinked by a stale-lock reclaim
                // between our open and flock; start over on the fresh one.
                if !same_file(&file, &path) {
                    continue;
                }
                let holder = LockHolder {
                    pid: std::process::id(),
                    acquired_at_ms: now_ms(),
                };
                write_holder(&mut file, &holder).map_err(|e| EngineError::io(&path, e))?;
                tracing::debug!(scope, pid = holder.pid, "Acquired lock");
                return Ok(LockHandle {
                    scope: scope.to_string(),
                    path,
                    file: Some(file),
                });
            }

            // Someone holds the flock. A missing or half-written holder line
            // means they are between flock and write, so keep waiting.
            let holder = read_holder(&mut file);
            if let Some(stale) = holder.as_ref().filter(|h| self.is_stale(h)) {
                tracing::warn!(scope, holder = stale.pid, "Reclaiming stale lock");
                drop(file);
                let _ = std::fs::remove_file(&path);
                continue;
            }

            let waited = started.elapsed();
            if waited >= timeout {
                return Err(EngineError::LockTimeout {
                    scope: scope.to_string(),
                    holder: holder.map(|h| h.pid).unwrap_or(0),
                    waited,
                });
            }
            drop(file);
            sleep(POLL_INTERVAL.min(timeout - waited));
        }
    }

    /// Current state of `scope`'s lock, without taking it
    pub fn inspect(&self, scope: &str) -> Result<LockState> {
        let path = self.lock_path(scope);
        let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LockState::Free),
            Err(e) => return Err(EngineError::io(&path, e)),
        };

        if try_flock_exclusive(&file).map_err(|e| EngineError::io(&path, e))? {
            // Nobody holds the flock; whatever the file says is leftover
            let holder = read_holder(&mut file);
            unlock(&file);
            return Ok(match holder {
                None => LockState::Free,
                some => LockState::Stale(some),
            });
        }

        Ok(match read_holder(&mut file) {
            None => LockState::Acquiring,
            Some(h) if self.is_stale(&h) => LockState::Stale(Some(h)),
            Some(h) => LockState::Held(h),
        })
    }

    /// Holder is gone, or has held the lock longer than `stale_after`
    fn is_stale(&self, holder: &LockHolder) -> bool {
        !is_process_alive(holder.pid)
            || now_ms().saturating_sub(holder.acquired_at_ms) > self.stale_after.as_millis() as u64
    }
}

/// Proof of holding a scope's lock. Released on drop.
#[derive(Debug)]
pub struct LockHandle {
    scope: String,
    path: PathBuf,
    file: Option<File>,
}

impl LockHandle {
    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_held(&self) -> bool {
        self.file.is_some()
    }

    /// Remove the lock file and drop the flock. Safe to call repeatedly.
    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            // Only unlink while we still own the file at that path
            if same_file(&file, &self.path) {
                let _ = std::fs::remove_file(&self.path);
            }
            unlock(&file);
            tracing::debug!(scope = %self.scope, "Released lock");
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

fn write_holder(file: &mut File, holder: &LockHolder) -> std::io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(holder.render().as_bytes())?;
    file.sync_all()
}

fn read_holder(file: &mut File) -> Option<LockHolder> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    LockHolder::parse(&contents)
}

/// Try to acquire exclusive file lock (non-blocking)
#[cfg(unix)]
fn try_flock_exclusive(file: &File) -> std::io::Result<bool> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::EWOULDBLOCK) => Ok(false),
        Err(e) => Err(std::io::Error::from(e)),
    }
}

#[cfg(unix)]
fn unlock(file: &File) {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    let _ = flock(file.as_raw_fd(), FlockArg::Unlock);
}

#[cfg(unix)]
fn same_file(file: &File, path: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;

    match (file.metadata(), std::fs::metadata(path)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

/// Check if process is alive
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    // Null signal: existence check only
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => true,
        Err(nix::errno::Errno::ESRCH) => false,
        Err(_) => true, // EPERM: exists, owned by someone else
    }
}
