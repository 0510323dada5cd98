//! Cache configuration.
//!
//! A [`CacheConfig`] is resolved once by the binary and handed by reference to
//! every component, so several independent cache roots can coexist in one
//! process (tests do exactly that).
//!
//! Cache root precedence: `--cache-dir` flag, `GIT_CACHE_PATH`, git config
//! `cache.cachepath`, then `<system cache dir>/git-cache`.
//! Snapshot store precedence: `GIT_CACHE_BOOTSTRAP_STORE`, git config
//! `cache.bootstrapstore`, then `gs://chromium-git-cache`.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::cache::{CachePaths, MirrorIdentity, RetryPolicy, StoreLocation};

/// Pack file count above which a mirror is rebuilt from scratch.
pub const GC_AUTOPACKLIMIT: usize = 50;

/// Hosts known to publish bootstrap snapshots.
pub const DEFAULT_BOOTSTRAP_HOSTS: &[&str] = &[
    "chromium.googlesource.com",
    "chrome-internal.googlesource.com",
];

pub const DEFAULT_BOOTSTRAP_STORE: &str = "gs://chromium-git-cache";

pub const CACHE_PATH_ENV: &str = "GIT_CACHE_PATH";
pub const CACHE_PATH_GIT_CONFIG: &str = "cache.cachepath";
pub const BOOTSTRAP_STORE_ENV: &str = "GIT_CACHE_BOOTSTRAP_STORE";
pub const BOOTSTRAP_STORE_GIT_CONFIG: &str = "cache.bootstrapstore";

/// Errors returned while resolving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A relative cache root could not be anchored to the working directory.
    #[error("cannot resolve relative cache path {}: {source}", .path.display())]
    RelativeRoot {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Settings shared by every cache component.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache root layout.
    pub paths: CachePaths,
    /// Pack count threshold for forced rebuilds.
    pub gc_autopacklimit: usize,
    /// Hosts eligible for snapshot bootstrap.
    pub bootstrap_hosts: Vec<String>,
    /// Where snapshots are listed, downloaded and uploaded.
    pub bootstrap_store: StoreLocation,
    /// Policy for renames, deletes and lock removal.
    pub retry: RetryPolicy,
    /// Policy for network fetches.
    pub fetch_retry: RetryPolicy,
}

impl CacheConfig {
    /// Configuration rooted at `root` with every other setting at its default.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            paths: CachePaths::new(root),
            gc_autopacklimit: GC_AUTOPACKLIMIT,
            bootstrap_hosts: DEFAULT_BOOTSTRAP_HOSTS
                .iter()
                .map(|h| h.to_string())
                .collect(),
            bootstrap_store: StoreLocation::parse(DEFAULT_BOOTSTRAP_STORE),
            retry: RetryPolicy::default(),
            fetch_retry: RetryPolicy::new(3, Duration::from_secs(1)),
        }
    }

    /// Resolve from the flag value, process environment and global git config.
    pub fn resolve(cache_dir: Option<PathBuf>) -> Result<Self, ConfigError> {
        Self::resolve_with(
            cache_dir,
            |key| std::env::var(key).ok(),
            git_config_value,
        )
    }

    /// Resolve using explicit lookups for environment and git config values.
    pub fn resolve_with(
        cache_dir: Option<PathBuf>,
        env: impl Fn(&str) -> Option<String>,
        git_config: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let non_empty = |value: Option<String>| value.filter(|v| !v.trim().is_empty());

        let root = cache_dir
            .or_else(|| non_empty(env(CACHE_PATH_ENV)).map(PathBuf::from))
            .or_else(|| non_empty(git_config(CACHE_PATH_GIT_CONFIG)).map(PathBuf::from))
            .unwrap_or_else(|| CachePaths::default().root().to_path_buf());

        let root = if root.is_absolute() {
            root
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(&root))
                .map_err(|source| ConfigError::RelativeRoot { path: root, source })?
        };

        let mut config = Self::new(root);
        if let Some(store) = non_empty(env(BOOTSTRAP_STORE_ENV))
            .or_else(|| non_empty(git_config(BOOTSTRAP_STORE_GIT_CONFIG)))
        {
            config.bootstrap_store = StoreLocation::parse(&store);
        }

        log::debug!(
            "cache root {}, snapshot store {}",
            config.paths.root().display(),
            config.bootstrap_store
        );
        Ok(config)
    }

    /// Whether snapshots may exist for this remote.
    pub fn is_bootstrap_eligible(&self, identity: &MirrorIdentity) -> bool {
        identity
            .host()
            .is_some_and(|host| self.bootstrap_hosts.iter().any(|h| h.eq_ignore_ascii_case(&host)))
    }
}

fn git_config_value(key: &str) -> Option<String> {
    git2::Config::open_default().ok()?.get_string(key).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::path::Path;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_new_uses_defaults() {
        let config = CacheConfig::new("/cache");
        assert_eq!(config.paths.root(), Path::new("/cache"));
        assert_eq!(config.gc_autopacklimit, 50);
        assert_eq!(
            config.bootstrap_store,
            StoreLocation::Gcs {
                bucket: "chromium-git-cache".to_string()
            }
        );
        assert_eq!(config.retry.attempts, 10);
    }

    #[test]
    fn test_flag_beats_env_and_git_config() {
        let config = CacheConfig::resolve_with(
            Some(PathBuf::from("/from-flag")),
            lookup(&[(CACHE_PATH_ENV, "/from-env")]),
            lookup(&[(CACHE_PATH_GIT_CONFIG, "/from-git")]),
        )
        .unwrap();
        assert_eq!(config.paths.root(), Path::new("/from-flag"));
    }

    #[test]
    fn test_env_beats_git_config() {
        let config = CacheConfig::resolve_with(
            None,
            lookup(&[(CACHE_PATH_ENV, "/from-env")]),
            lookup(&[(CACHE_PATH_GIT_CONFIG, "/from-git")]),
        )
        .unwrap();
        assert_eq!(config.paths.root(), Path::new("/from-env"));
    }

    #[test]
    fn test_git_config_used_when_env_empty() {
        let config = CacheConfig::resolve_with(
            None,
            lookup(&[(CACHE_PATH_ENV, "  ")]),
            lookup(&[(CACHE_PATH_GIT_CONFIG, "/from-git")]),
        )
        .unwrap();
        assert_eq!(config.paths.root(), Path::new("/from-git"));
    }

    #[test]
    fn test_falls_back_to_system_cache_dir() {
        let config = CacheConfig::resolve_with(None, lookup(&[]), lookup(&[])).unwrap();
        assert!(config.paths.root().ends_with("git-cache"));
        assert!(config.paths.root().is_absolute());
    }

    #[test]
    fn test_relative_root_is_anchored() {
        let config = CacheConfig::resolve_with(
            Some(PathBuf::from("relative-cache")),
            lookup(&[]),
            lookup(&[]),
        )
        .unwrap();
        assert!(config.paths.root().is_absolute());
        assert!(config.paths.root().ends_with("relative-cache"));
    }

    #[test]
    fn test_bootstrap_store_override() {
        let config = CacheConfig::resolve_with(
            Some(PathBuf::from("/cache")),
            lookup(&[]),
            lookup(&[(BOOTSTRAP_STORE_GIT_CONFIG, "file:///srv/snapshots")]),
        )
        .unwrap();
        assert_eq!(
            config.bootstrap_store,
            StoreLocation::Local {
                root: PathBuf::from("/srv/snapshots")
            }
        );
    }

    #[test]
    fn test_bootstrap_eligibility() {
        let config = CacheConfig::new("/cache");
        let eligible = |url: &str| config.is_bootstrap_eligible(&MirrorIdentity::new(url).unwrap());
        assert!(eligible("https://chromium.googlesource.com/chromium/src"));
        assert!(eligible("https://Chromium.Googlesource.com/a/v8/v8.git"));
        assert!(!eligible("https://github.com/octocat/hello"));
        assert!(!eligible("/local/repo"));
    }
}
