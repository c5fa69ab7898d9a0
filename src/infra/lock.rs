//! Host-wide conversion lock backed by a filesystem marker.
//!
//! The marker is created with create-exclusive semantics so that independent
//! processes racing for it observe exactly one winner. Its content is the
//! holder's process id.

use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::domain::ConversionError;

pub const LOCK_FILE_NAME: &str = "gpreview-vi-convert-exec.lock";
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default marker location in the system temp directory.
pub fn default_lock_path() -> PathBuf {
    std::env::temp_dir().join(LOCK_FILE_NAME)
}

/// Serializes conversions across every process on the host.
#[async_trait]
pub trait ConversionLock: Send + Sync {
    /// Wait until the lock is free and take it, or fail once the bound elapses.
    async fn acquire(&self) -> Result<LockLease, ConversionError>;

    /// Give the lock back. Callers log failures instead of propagating them.
    async fn release(&self, lease: LockLease) -> io::Result<()>;
}

/// Proof of holding the conversion lock.
///
/// Dropping an unreleased lease removes the marker synchronously if it still
/// carries this holder's pid, so a cancelled or panicking conversion does not
/// wedge other processes.
#[derive(Debug)]
pub struct LockLease {
    marker: PathBuf,
    holder: u32,
    waited: Duration,
    armed: bool,
}

impl LockLease {
    pub fn marker(&self) -> &Path {
        &self.marker
    }

    pub fn holder(&self) -> u32 {
        self.holder
    }

    /// Time spent polling before the lock was obtained.
    pub fn waited(&self) -> Duration {
        self.waited
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let state = marker_state(std::fs::read_to_string(&self.marker), self.holder);
        let removed = match state {
            Ok(MarkerState::Missing) => return,
            Ok(MarkerState::Foreign(found)) => {
                warn!(
                    target = "infra::lock",
                    op = "lock::drop",
                    marker = %self.marker.display(),
                    holder = self.holder,
                    found = ?found,
                    "Conversion lock marker belongs to another holder; left in place"
                );
                return;
            }
            Ok(MarkerState::Held) => match std::fs::remove_file(&self.marker) {
                Err(err) if err.kind() == ErrorKind::NotFound => return,
                other => other,
            },
            Err(err) => Err(err),
        };
        match removed {
            Ok(()) => {
                warn!(
                    target = "infra::lock",
                    op = "lock::drop",
                    marker = %self.marker.display(),
                    "Conversion lock dropped without release; marker removed"
                );
            }
            Err(err) => {
                warn!(
                    target = "infra::lock",
                    op = "lock::drop",
                    marker = %self.marker.display(),
                    error = %err,
                    "Failed to remove conversion lock marker on drop"
                );
            }
        }
    }
}

/// What a lease finds at its marker path when giving the lock back.
#[derive(Debug, PartialEq, Eq)]
enum MarkerState {
    Missing,
    Held,
    /// Recreated by someone else after ours went away; carries their pid if readable.
    Foreign(Option<u32>),
}

fn marker_state(content: io::Result<String>, holder: u32) -> io::Result<MarkerState> {
    match content {
        Ok(content) => match content.trim().parse::<u32>() {
            Ok(pid) if pid == holder => Ok(MarkerState::Held),
            Ok(pid) => Ok(MarkerState::Foreign(Some(pid))),
            Err(_) => Ok(MarkerState::Foreign(None)),
        },
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(MarkerState::Missing),
        Err(err) => Err(err),
    }
}

/// [`ConversionLock`] implemented with a marker file at a fixed path.
#[derive(Debug, Clone)]
pub struct FileConversionLock {
    path: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
}

impl FileConversionLock {
    pub fn new(path: PathBuf, timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            path,
            timeout,
            poll_interval,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn try_create(&self) -> io::Result<u32> {
        let holder = std::process::id();
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await?;
        let written = async {
            file.write_all(holder.to_string().as_bytes()).await?;
            file.flush().await
        }
        .await;
        if let Err(err) = written {
            // A marker that was created but never filled must not block other processes.
            drop(file);
            let _ = fs::remove_file(&self.path).await;
            return Err(err);
        }
        Ok(holder)
    }
}

impl Default for FileConversionLock {
    fn default() -> Self {
        Self::new(default_lock_path(), DEFAULT_LOCK_TIMEOUT, DEFAULT_POLL_INTERVAL)
    }
}

#[async_trait]
impl ConversionLock for FileConversionLock {
    async fn acquire(&self) -> Result<LockLease, ConversionError> {
        let started_at = Instant::now();
        let mut attempts: u64 = 0;

        loop {
            attempts += 1;
            match self.try_create().await {
                Ok(holder) => {
                    let waited = started_at.elapsed();
                    info!(
                        target = "infra::lock",
                        op = "lock::acquire",
                        result = "acquired",
                        marker = %self.path.display(),
                        holder,
                        attempts,
                        waited_ms = waited.as_millis() as u64,
                        "Conversion lock acquired"
                    );
                    return Ok(LockLease {
                        marker: self.path.clone(),
                        holder,
                        waited,
                        armed: true,
                    });
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
                Err(err) => {
                    warn!(
                        target = "infra::lock",
                        op = "lock::acquire",
                        result = "error",
                        marker = %self.path.display(),
                        error = %err,
                        "Failed to create conversion lock marker"
                    );
                    return Err(ConversionError::LockIo {
                        path: self.path.clone(),
                        source: err,
                    });
                }
            }

            let waited = started_at.elapsed();
            if waited >= self.timeout {
                let holder = read_holder(&self.path).await;
                warn!(
                    target = "infra::lock",
                    op = "lock::acquire",
                    result = "timeout",
                    marker = %self.path.display(),
                    holder = ?holder,
                    attempts,
                    waited_ms = waited.as_millis() as u64,
                    "Timed out waiting for conversion lock"
                );
                return Err(ConversionError::lock_timeout(&self.path, waited));
            }

            if attempts == 1 {
                debug!(
                    target = "infra::lock",
                    op = "lock::acquire",
                    result = "contended",
                    marker = %self.path.display(),
                    "Conversion lock held elsewhere; polling"
                );
            }
            // Never sleep past the deadline.
            let remaining = self.timeout.saturating_sub(waited);
            tokio::time::sleep(self.poll_interval.min(remaining)).await;
        }
    }

    async fn release(&self, mut lease: LockLease) -> io::Result<()> {
        lease.disarm();
        let state = marker_state(fs::read_to_string(&lease.marker).await, lease.holder)?;
        let result = match state {
            MarkerState::Missing => Ok(()),
            MarkerState::Foreign(found) => {
                warn!(
                    target = "infra::lock",
                    op = "lock::release",
                    result = "foreign",
                    marker = %lease.marker.display(),
                    holder = lease.holder,
                    found = ?found,
                    "Conversion lock marker belongs to another holder; left in place"
                );
                return Ok(());
            }
            MarkerState::Held => match fs::remove_file(&lease.marker).await {
                Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        debug!(
            target = "infra::lock",
            op = "lock::release",
            result = if result.is_ok() { "released" } else { "error" },
            marker = %lease.marker.display(),
            holder = lease.holder,
            "Conversion lock released"
        );
        result
    }
}

/// Process id recorded in the marker at `path`, if the marker exists and is readable.
pub async fn read_holder(path: &Path) -> Option<u32> {
    let content = fs::read_to_string(path).await.ok()?;
    content.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock_in(dir: &TempDir, timeout: Duration) -> FileConversionLock {
        FileConversionLock::new(
            dir.path().join(LOCK_FILE_NAME),
            timeout,
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn acquire_writes_pid_and_release_removes_marker() {
        let dir = TempDir::new().expect("temp dir");
        let lock = lock_in(&dir, Duration::from_secs(1));

        let lease = lock.acquire().await.expect("acquire");
        assert_eq!(lease.holder(), std::process::id());
        assert_eq!(read_holder(lock.path()).await, Some(std::process::id()));

        lock.release(lease).await.expect("release");
        assert!(!lock.path().exists());
    }

    #[tokio::test]
    async fn stale_marker_times_out_within_bound() {
        let dir = TempDir::new().expect("temp dir");
        let lock = lock_in(&dir, Duration::from_millis(150));
        std::fs::write(lock.path(), "424242").expect("stale marker");

        let started = Instant::now();
        let err = lock.acquire().await.expect_err("must time out");
        assert!(matches!(err, ConversionError::LockTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(2));
        // The foreign marker is left alone.
        assert_eq!(read_holder(lock.path()).await, Some(424242));
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let dir = TempDir::new().expect("temp dir");
        let first = lock_in(&dir, Duration::from_secs(5));
        let second = lock_in(&dir, Duration::from_secs(5));

        let lease = first.acquire().await.expect("first acquire");
        let waiter = tokio::spawn(async move {
            let lease = second.acquire().await.expect("second acquire");
            second.release(lease).await.expect("second release");
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        first.release(lease).await.expect("first release");
        waiter.await.expect("waiter joined");
    }

    #[tokio::test]
    async fn dropped_lease_removes_marker() {
        let dir = TempDir::new().expect("temp dir");
        let lock = lock_in(&dir, Duration::from_secs(1));
        let lease = lock.acquire().await.expect("acquire");
        drop(lease);
        assert!(!lock.path().exists());
    }

    #[tokio::test]
    async fn release_tolerates_missing_marker() {
        let dir = TempDir::new().expect("temp dir");
        let lock = lock_in(&dir, Duration::from_secs(1));
        let lease = lock.acquire().await.expect("acquire");
        std::fs::remove_file(lock.path()).expect("remove behind lock's back");
        lock.release(lease).await.expect("release is best effort");
    }

    #[tokio::test]
    async fn timeout_does_not_overshoot_poll_interval() {
        let dir = TempDir::new().expect("temp dir");
        let lock = FileConversionLock::new(
            dir.path().join(LOCK_FILE_NAME),
            Duration::from_millis(150),
            Duration::from_secs(1),
        );
        std::fs::write(lock.path(), "424242").expect("stale marker");

        let started = Instant::now();
        let err = lock.acquire().await.expect_err("must time out");
        let elapsed = started.elapsed();
        assert!(matches!(err, ConversionError::LockTimeout { .. }));
        assert!(elapsed >= Duration::from_millis(150), "elapsed {elapsed:?}");
        assert!(elapsed < Duration::from_millis(600), "elapsed {elapsed:?}");
    }

    #[tokio::test]
    async fn release_leaves_marker_recreated_by_another_holder() {
        let dir = TempDir::new().expect("temp dir");
        let lock = lock_in(&dir, Duration::from_secs(1));
        let lease = lock.acquire().await.expect("acquire");
        // Ours was cleaned up externally and another process took the lock.
        std::fs::remove_file(lock.path()).expect("remove marker");
        std::fs::write(lock.path(), "424242").expect("foreign marker");

        lock.release(lease).await.expect("release");
        assert_eq!(read_holder(lock.path()).await, Some(424242));
    }

    #[tokio::test]
    async fn dropped_lease_leaves_foreign_marker() {
        let dir = TempDir::new().expect("temp dir");
        let lock = lock_in(&dir, Duration::from_secs(1));
        let lease = lock.acquire().await.expect("acquire");
        std::fs::write(lock.path(), "not-a-pid").expect("foreign marker");

        drop(lease);
        assert_eq!(
            std::fs::read_to_string(lock.path()).expect("marker kept"),
            "not-a-pid"
        );
    }

    #[test]
    fn marker_state_matches_holder() {
        let missing = io::Error::from(ErrorKind::NotFound);
        assert_eq!(marker_state(Err(missing), 7).expect("missing"), MarkerState::Missing);
        assert_eq!(marker_state(Ok("7\n".into()), 7).expect("held"), MarkerState::Held);
        assert_eq!(
            marker_state(Ok("8".into()), 7).expect("foreign"),
            MarkerState::Foreign(Some(8))
        );
        let denied = io::Error::from(ErrorKind::PermissionDenied);
        assert!(marker_state(Err(denied), 7).is_err());
    }
}
