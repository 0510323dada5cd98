//! Cache-wide cleanup after crashed or interrupted runs.
//!
//! Assumes no populate is running against the cache root: staging
//! directories are deleted outright and every lock is broken.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use super::lock::{Lockfile, process_is_running};
use super::mirror::{CacheError, Mirror};
use super::paths::{LOCK_SUFFIX, STAGING_PREFIX};
use super::retry::{self, retry};
use crate::config::CacheConfig;

/// What [`unlock_all`] cleaned up.
#[derive(Debug, Default)]
pub struct UnlockReport {
    /// Mirror paths whose locks were broken.
    pub unlocked: Vec<PathBuf>,
    /// Staging directories that were deleted.
    pub removed_staging: Vec<PathBuf>,
    /// Entries that could not be cleaned.
    pub failures: Vec<(PathBuf, CacheError)>,
}

impl UnlockReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Break every mirror lock and delete every staging directory under the
/// cache root. Failures on individual entries are collected, not returned.
pub fn unlock_all(config: &CacheConfig) -> Result<UnlockReport, CacheError> {
    let root = config.paths.root();
    let mut report = UnlockReport::default();

    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(e.into()),
    };

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };

        if name.starts_with(STAGING_PREFIX) {
            match retry(
                &config.retry,
                "remove staging directory",
                || remove_path(&path),
                retry::any_error,
            ) {
                Ok(()) => {
                    log::info!("removed {}", path.display());
                    report.removed_staging.push(path);
                }
                Err(e) => report.failures.push((path, e.into())),
            }
        } else if let Some(mirror_name) = name.strip_suffix(LOCK_SUFFIX) {
            // Lock files are plain files; anything else is a mirror or user data.
            if !entry.file_type().is_ok_and(|t| t.is_file()) {
                continue;
            }
            let mirror_path = root.join(mirror_name);
            let lock = Lockfile::new(&mirror_path);
            if let Some(owner) = lock.owner().filter(|_| !lock.i_am_locking()) {
                if process_is_running(owner) {
                    log::warn!(
                        "breaking lock on {} still held by running process {}",
                        mirror_path.display(),
                        owner
                    );
                }
            }
            match Mirror::break_locks(&mirror_path, &config.retry) {
                Ok(true) => report.unlocked.push(mirror_path),
                Ok(false) => {}
                Err(e) => report.failures.push((mirror_path, e)),
            }
        }
    }

    report.unlocked.sort();
    report.removed_staging.sort();
    Ok(report)
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::RetryPolicy;
    use tempfile::tempdir;

    fn config(root: &Path) -> CacheConfig {
        let mut config = CacheConfig::new(root);
        config.retry = RetryPolicy::once();
        config
    }

    #[test]
    fn missing_root_reports_nothing() {
        let dir = tempdir().unwrap();
        let report = unlock_all(&config(&dir.path().join("missing"))).unwrap();
        assert!(report.unlocked.is_empty());
        assert!(report.removed_staging.is_empty());
        assert!(report.is_clean());
    }

    #[test]
    fn unlock_all_clears_locks_and_staging() {
        let dir = tempdir().unwrap();
        let root = dir.path();

        let staging = root.join(format!("{}abc123", STAGING_PREFIX));
        fs::create_dir_all(staging.join("objects")).unwrap();
        fs::write(staging.join("objects").join("x"), b"x").unwrap();

        let locked = root.join("host-locked");
        let pack_dir = locked.join("objects").join("pack");
        fs::create_dir_all(&pack_dir).unwrap();
        fs::write(locked.join("config"), b"").unwrap();
        fs::write(locked.join("config.lock"), b"").unwrap();
        fs::write(pack_dir.join("tmp_pack_1"), b"").unwrap();
        fs::write(root.join("host-locked.lock"), "1").unwrap();

        // Lock left behind for a mirror that was never created.
        fs::write(root.join("host-orphan.lock"), "999999").unwrap();

        let healthy = root.join("host-healthy");
        fs::create_dir_all(&healthy).unwrap();
        fs::write(healthy.join("config"), b"").unwrap();

        let report = unlock_all(&config(root)).unwrap();

        assert_eq!(report.unlocked, vec![locked.clone(), root.join("host-orphan")]);
        assert_eq!(report.removed_staging, vec![staging.clone()]);
        assert!(report.is_clean());

        assert!(!staging.exists());
        assert!(!root.join("host-locked.lock").exists());
        assert!(!root.join("host-orphan.lock").exists());
        assert!(!locked.join("config.lock").exists());
        assert!(!pack_dir.join("tmp_pack_1").exists());
        assert!(locked.join("config").exists());
        assert!(healthy.join("config").exists());
    }

    #[test]
    fn unlock_all_skips_directories_named_like_locks() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        let mirror = root.join("host-x.lock");
        fs::create_dir_all(&mirror).unwrap();
        fs::write(mirror.join("config"), b"").unwrap();
        fs::write(mirror.join("config.lock"), b"").unwrap();

        let report = unlock_all(&config(root)).unwrap();

        assert!(report.unlocked.is_empty());
        assert!(report.is_clean());
        assert!(mirror.join("config.lock").exists());
    }

    #[test]
    fn unlock_all_is_idempotent() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("host-repo.lock"), "1").unwrap();

        let first = unlock_all(&config(dir.path())).unwrap();
        assert_eq!(first.unlocked.len(), 1);

        let second = unlock_all(&config(dir.path())).unwrap();
        assert!(second.unlocked.is_empty());
        assert!(second.removed_staging.is_empty());
    }
}
