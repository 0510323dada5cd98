//! Bootstrap snapshots: compressed copies of whole mirrors kept in an object
//! store so a cold cache can skip most of an initial fetch.
//!
//! Snapshots of a mirror live under `<dir-name>/` and are named by a
//! generation number (commits on the default branch) zero-padded to ten
//! digits, so the lexicographically greatest name is the newest.

use std::fs;
use std::io;
use std::path::Path;

use thiserror::Error;

use super::archive::{ArchiveError, Extractor};
use super::git::{self, GitError, Vcs};
use super::paths::MirrorIdentity;
use super::store::{ObjectStore, StoreError};
use crate::config::CacheConfig;

pub const SNAPSHOT_SUFFIX: &str = ".tar.gz";

/// Errors returned while producing or consuming a snapshot.
#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("git error: {0}")]
    Git(#[from] GitError),
    #[error("object store error: {0}")]
    Store(#[from] StoreError),
    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Key prefix holding every snapshot of a mirror.
pub fn snapshot_prefix(identity: &MirrorIdentity) -> String {
    format!("{}/", identity.dir_name())
}

/// Object name of the snapshot for `generation`.
pub fn snapshot_name(identity: &MirrorIdentity, generation: usize) -> String {
    format!(
        "{}{:0>10}{}",
        snapshot_prefix(identity),
        generation,
        SNAPSHOT_SUFFIX
    )
}

/// Downloads and uploads mirror snapshots.
pub struct BootstrapTransfer {
    store: Box<dyn ObjectStore>,
    extractor: Extractor,
}

impl BootstrapTransfer {
    pub fn new(store: Box<dyn ObjectStore>, extractor: Extractor) -> Self {
        Self { store, extractor }
    }

    /// Open the configured store and pick an archiver for this machine.
    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.bootstrap_store.open(), Extractor::detect())
    }

    /// Unpack the newest snapshot of `identity` into `dest`.
    ///
    /// Returns false, leaving `dest` empty, when `config` lists no snapshots
    /// for the host, no snapshot exists, or anything goes wrong along the way.
    pub fn bootstrap(&self, config: &CacheConfig, identity: &MirrorIdentity, dest: &Path) -> bool {
        if !config.is_bootstrap_eligible(identity) {
            log::debug!("no snapshots for {}: host not eligible", identity.url());
            return false;
        }

        let prefix = snapshot_prefix(identity);
        let names = match self.store.list(&prefix) {
            Ok(names) => names,
            Err(e) => {
                log::warn!("listing snapshots for {} failed: {}", identity.url(), e);
                return false;
            }
        };

        let Some(latest) = names
            .into_iter()
            .filter(|name| name.ends_with(SNAPSHOT_SUFFIX))
            .max()
        else {
            log::info!("no snapshots found for {}", identity.url());
            return false;
        };

        log::info!("bootstrapping {} from {}", identity.url(), latest);
        match self.download_and_extract(&latest, dest) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("bootstrap from {} failed: {}", latest, e);
                if let Err(e) = clear_dir(dest) {
                    log::warn!("failed to clear {}: {}", dest.display(), e);
                }
                false
            }
        }
    }

    fn download_and_extract(&self, name: &str, dest: &Path) -> Result<(), BootstrapError> {
        // Removed on drop, whatever happens below.
        let archive = tempfile::Builder::new()
            .prefix("git-cache-snapshot")
            .suffix(SNAPSHOT_SUFFIX)
            .tempfile()?;

        self.store.get(name, archive.path())?;
        fs::create_dir_all(dest)?;
        self.extractor.extract(archive.path(), dest)?;
        Ok(())
    }

    /// Repack `mirror_path` and upload it as the newest snapshot of `identity`.
    ///
    /// With `prune`, every other snapshot of the mirror is deleted afterwards.
    /// Returns the uploaded object name.
    pub fn update_snapshot(
        &self,
        identity: &MirrorIdentity,
        mirror_path: &Path,
        vcs: &dyn Vcs,
        prune: bool,
        gc_aggressive: bool,
    ) -> Result<String, BootstrapError> {
        vcs.gc(mirror_path, gc_aggressive)?;

        let generation = git::default_branch_commit_count(mirror_path)?;
        let name = snapshot_name(identity, generation);
        let prefix = snapshot_prefix(identity);

        let existing = self.store.list(&prefix)?;
        if let Some(newest) = existing.iter().max() {
            if *newest > name {
                log::warn!(
                    "{} is older than existing snapshot {}; history may have been rewritten",
                    name,
                    newest
                );
            }
        }

        {
            let archive = tempfile::Builder::new()
                .prefix("git-cache-snapshot")
                .suffix(SNAPSHOT_SUFFIX)
                .tempfile()?;
            self.extractor.compress(mirror_path, archive.path())?;
            self.store.put(archive.path(), &name)?;
        }
        log::info!("uploaded snapshot {}", name);

        if prune {
            for old in existing.iter().filter(|old| **old != name) {
                match self.store.delete(old) {
                    Ok(()) => log::info!("pruned snapshot {}", old),
                    Err(e) => log::warn!("failed to prune snapshot {}: {}", old, e),
                }
            }
        }

        Ok(name)
    }
}

fn clear_dir(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}
