use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run holds the lock {path} ({holder})")]
    Held { path: PathBuf, holder: String },
    #[error("lock io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Exclusive run lock backed by an `O_EXCL` lock file, one per lock key.
///
/// Released explicitly via [`RunLock::release`] or, as a fallback, on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    released: bool,
}

impl RunLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn acquire(
        lock_dir: &Path,
        key: &str,
        run_id: Uuid,
        stale_after: Duration,
    ) -> Result<Self, LockError> {
        let io = |path: &Path| {
            let path = path.to_path_buf();
            move |source| LockError::Io { path, source }
        };
        fs::create_dir_all(lock_dir).await.map_err(io(lock_dir))?;
        let path = lock_dir.join(format!("{key}.lock"));

        for _ in 0..2 {
            match fs::OpenOptions::new().create_new(true).write(true).open(&path).await {
                Ok(mut file) => {
                    let stamp = format!("{run_id} pid={}\n", std::process::id());
                    file.write_all(stamp.as_bytes()).await.map_err(io(&path))?;
                    file.flush().await.map_err(io(&path))?;
                    info!(lock = %path.display(), %run_id, "run lock acquired");
                    return Ok(Self { path, released: false });
                }
                Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = fs::read_to_string(&path).await.unwrap_or_default().trim().to_string();
                    let age = fs::metadata(&path)
                        .await
                        .and_then(|m| m.modified())
                        .ok()
                        .and_then(|modified| SystemTime::now().duration_since(modified).ok());
                    match age {
                        Some(age) if age > stale_after => {
                            warn!(lock = %path.display(), %holder, age_secs = age.as_secs(), "taking over stale run lock");
                            match fs::remove_file(&path).await {
                                Ok(()) => continue,
                                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                                Err(e) => return Err(io(&path)(e)),
                            }
                        }
                        _ => return Err(LockError::Held { path, holder }),
                    }
                }
                Err(err) => return Err(io(&path)(err)),
            }
        }

        let holder = fs::read_to_string(&path).await.unwrap_or_default().trim().to_string();
        Err(LockError::Held { path, holder })
    }

    pub async fn release(mut self) -> Result<(), LockError> {
        self.released = true;
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if !self.released {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn second_run_for_the_same_profile_is_rejected() {
        let dir = tempdir().unwrap();
        let first = RunLock::acquire(dir.path(), "profile-a", Uuid::new_v4(), Duration::from_secs(3600))
            .await
            .unwrap();
        let second = RunLock::acquire(dir.path(), "profile-a", Uuid::new_v4(), Duration::from_secs(3600)).await;
        assert!(matches!(second, Err(LockError::Held { .. })));

        let other = RunLock::acquire(dir.path(), "profile-b", Uuid::new_v4(), Duration::from_secs(3600)).await;
        assert!(other.is_ok());

        first.release().await.unwrap();
        let third = RunLock::acquire(dir.path(), "profile-a", Uuid::new_v4(), Duration::from_secs(3600)).await;
        assert!(third.is_ok());
    }

    #[tokio::test]
    async fn dropped_lock_is_released() {
        let dir = tempdir().unwrap();
        {
            let _lock = RunLock::acquire(dir.path(), "p", Uuid::new_v4(), Duration::from_secs(60))
                .await
                .unwrap();
        }
        assert!(!dir.path().join("p.lock").exists());
    }

    #[tokio::test]
    async fn stale_lock_is_taken_over() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("p.lock"), "crashed-run pid=1\n").unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let lock = RunLock::acquire(dir.path(), "p", Uuid::new_v4(), Duration::ZERO).await;
        assert!(lock.is_ok());
    }
}
