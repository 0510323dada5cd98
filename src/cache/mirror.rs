//! Mirror orchestration.
//!
//! A [`MirrorCache`] ties configuration, the git runner and the snapshot
//! transfer together; a [`Mirror`] is one remote's bare repository under the
//! cache root. Populating a mirror either refreshes it in place or rebuilds it
//! in a staging directory that replaces the live mirror only once a fetch of
//! the default branches has succeeded.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use thiserror::Error;

use super::bootstrap::{BootstrapError, BootstrapTransfer};
use super::git::{self, GitCli, GitError, Vcs};
use super::lock::{LockError, Lockfile};
use super::paths::{InvalidMirrorUrl, MirrorIdentity, STAGING_PREFIX};
use super::retry::{self, RetryPolicy, retry};
use crate::config::CacheConfig;

/// Refspec mirroring every branch; always fetched first.
pub const DEFAULT_FETCH_SPEC: &str = "+refs/heads/*:refs/heads/*";

/// Depth used for `shallow` populates without an explicit depth.
pub const SHALLOW_DEPTH: u32 = 10000;

/// Errors returned by mirror operations.
#[derive(Error, Debug)]
pub enum CacheError {
    /// The URL cannot be given a mirror directory.
    #[error(transparent)]
    InvalidUrl(#[from] InvalidMirrorUrl),
    /// A git operation failed.
    #[error("git error: {0}")]
    Git(#[from] GitError),
    /// The mirror lock could not be taken or released.
    #[error(transparent)]
    Lock(#[from] LockError),
    /// Producing or consuming a snapshot failed.
    #[error("bootstrap error: {0}")]
    Bootstrap(#[from] BootstrapError),
    /// The default fetch failed again after rebuilding the mirror.
    #[error("fetching {refspec} from {url} failed after rebuilding the mirror: {source}")]
    Fetch {
        url: String,
        refspec: String,
        source: GitError,
    },
    /// Swapping a rebuilt mirror into place failed; the old mirror was kept.
    #[error("installing mirror at {} failed: {source}", .path.display())]
    Install {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// No mirror exists for the remote.
    #[error("no mirror for {0}")]
    NotFound(String),
    /// An underlying IO operation failed.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// A refspec as written to `remote.origin.fetch`, with the pattern used to
/// replace any earlier entry for the same source.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FetchSpec {
    refspec: String,
    value_regex: String,
}

impl FetchSpec {
    /// Canonicalize a user ref or a configured refspec.
    ///
    /// `foo` becomes `+refs/heads/foo:refs/heads/foo`; a full `src:dst` keeps
    /// its destination. Trailing slashes are dropped and the force flag is
    /// always set.
    pub fn parse(spec: &str) -> Self {
        let spec = spec.trim();
        let (src, dst) = match spec.split_once(':') {
            Some((src, dst)) => (src, Some(dst)),
            None => (spec, None),
        };

        let src = src.trim_start_matches('+').trim_end_matches('/');
        let src = if src.starts_with("refs/") {
            src.to_string()
        } else {
            format!("refs/heads/{}", src)
        };
        let dst = dst
            .map(|dst| dst.trim_end_matches('/').to_string())
            .unwrap_or_else(|| src.clone());

        Self {
            value_regex: format!(r"\+{}:.*", src.replace('*', r"\*")),
            refspec: format!("+{}:{}", src, dst),
        }
    }

    pub fn refspec(&self) -> &str {
        &self.refspec
    }

    /// Pattern matching existing config values with the same source.
    pub fn value_regex(&self) -> &str {
        &self.value_regex
    }

    pub fn is_default(&self) -> bool {
        self.refspec == DEFAULT_FETCH_SPEC
    }
}

/// The set of refspecs a mirror fetches; the default spec is always first.
#[derive(Debug, Clone)]
pub struct FetchSpecs {
    default: FetchSpec,
    extra: BTreeSet<FetchSpec>,
}

impl Default for FetchSpecs {
    fn default() -> Self {
        Self {
            default: FetchSpec::parse(DEFAULT_FETCH_SPEC),
            extra: BTreeSet::new(),
        }
    }
}

impl FetchSpecs {
    /// Add a spec; returns false when it is already present.
    pub fn insert(&mut self, spec: FetchSpec) -> bool {
        if spec == self.default {
            return false;
        }
        self.extra.insert(spec)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FetchSpec> {
        std::iter::once(&self.default).chain(self.extra.iter())
    }
}

/// Knobs for [`Mirror::populate`].
#[derive(Debug, Clone, Default)]
pub struct PopulateOptions {
    /// Fetch depth; disables bootstrap.
    pub depth: Option<u32>,
    /// Use [`SHALLOW_DEPTH`] when `depth` is unset.
    pub shallow: bool,
    /// Try a snapshot before fetching into a fresh mirror.
    pub bootstrap: bool,
    /// How long to wait for the mirror lock.
    pub lock_timeout: Option<Duration>,
    /// Skip the mirror lock entirely.
    pub ignore_lock: bool,
    /// Rebuild even when the mirror looks healthy.
    pub force: bool,
    /// Drop configured refspecs not requested by this call.
    pub reset_fetch_config: bool,
}

impl PopulateOptions {
    pub fn effective_depth(&self) -> Option<u32> {
        self.depth.or(self.shallow.then_some(SHALLOW_DEPTH))
    }
}

/// Knobs for [`Mirror::update_bootstrap`].
#[derive(Debug, Clone, Default)]
pub struct SnapshotOptions {
    /// Delete every other snapshot of the mirror after uploading.
    pub prune: bool,
    /// Run an aggressive gc before packing.
    pub gc_aggressive: bool,
    pub lock_timeout: Option<Duration>,
}

/// Result of fetching every refspec into a target directory.
enum FetchOutcome {
    /// The target is ready to be installed.
    Installed,
    /// The default refspec failed; the target cannot be trusted.
    NeedsRebuild(GitError),
}

#[derive(Debug, Clone, Copy)]
enum RebuildReason {
    Missing,
    Forced,
    TooManyPacks(usize),
}

/// Where a populate fetches into.
enum Target {
    Live(PathBuf),
    Staged(TempDir),
}

impl Target {
    fn path(&self) -> &Path {
        match self {
            Target::Live(path) => path,
            Target::Staged(dir) => dir.path(),
        }
    }
}

/// Cache manager for git mirrors.
pub struct MirrorCache {
    config: CacheConfig,
    vcs: Box<dyn Vcs>,
    bootstrap: BootstrapTransfer,
}

impl MirrorCache {
    pub fn new(config: CacheConfig, vcs: Box<dyn Vcs>, bootstrap: BootstrapTransfer) -> Self {
        Self {
            config,
            vcs,
            bootstrap,
        }
    }

    /// Cache using the system git and the configured snapshot store.
    pub fn from_config(config: CacheConfig) -> Self {
        let bootstrap = BootstrapTransfer::from_config(&config);
        Self::new(config, Box::new(GitCli::new()), bootstrap)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Handle for the mirror of `url`. Nothing is touched on disk.
    pub fn mirror(&self, url: &str) -> Result<Mirror<'_>, CacheError> {
        let identity = MirrorIdentity::new(url)?;
        let path = self.config.paths.mirror_dir(&identity);
        Ok(Mirror {
            cache: self,
            identity,
            path,
            fetch_specs: FetchSpecs::default(),
        })
    }
}

/// One remote's bare mirror under the cache root.
pub struct Mirror<'c> {
    cache: &'c MirrorCache,
    identity: MirrorIdentity,
    path: PathBuf,
    fetch_specs: FetchSpecs,
}

impl<'c> Mirror<'c> {
    /// Also fetch `refs` (branch names or refspecs) on populate.
    pub fn with_refs<S: AsRef<str>>(mut self, refs: &[S]) -> Self {
        for r in refs {
            self.fetch_specs.insert(FetchSpec::parse(r.as_ref()));
        }
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether a mirror has been created at the mirror path.
    pub fn exists(&self) -> bool {
        self.path.join("config").is_file()
    }

    /// Whether the mirror exists and contains `revision` as a commit.
    pub fn contains_revision(&self, revision: &str) -> Result<bool, CacheError> {
        if !self.exists() {
            return Ok(false);
        }
        Ok(git::contains_commit(&self.path, revision)?)
    }

    /// Deletion retries under a lock wait sleep at most a quarter of a
    /// nonzero `timeout`.
    fn lock_retry(&self, timeout: Option<Duration>) -> RetryPolicy {
        match timeout.filter(|t| !t.is_zero()) {
            Some(timeout) => self.cache.config.retry.capped_to(timeout),
            None => self.cache.config.retry,
        }
    }

    fn lockfile(&self, timeout: Option<Duration>) -> Lockfile {
        Lockfile::new(&self.path).with_retry(self.lock_retry(timeout))
    }

    /// Create or refresh the mirror so it holds every branch of the remote
    /// plus any extra refs.
    pub fn populate(&mut self, options: &PopulateOptions) -> Result<(), CacheError> {
        fs::create_dir_all(self.cache.config.paths.root())?;
        let lock = if options.ignore_lock {
            let lock = self.lockfile(None);
            if lock.is_locked() && !lock.i_am_locking() {
                log::warn!(
                    "ignoring lock on {} held by {:?}",
                    self.path.display(),
                    lock.owner()
                );
            }
            None
        } else {
            Some(self.lockfile(options.lock_timeout))
        };
        locked(lock.as_ref(), options.lock_timeout, || {
            self.populate_locked(options)
        })
    }

    fn populate_locked(&mut self, options: &PopulateOptions) -> Result<(), CacheError> {
        let cache = self.cache;
        let depth = options.effective_depth();
        let existed = self.exists();
        if existed {
            git::delete_tmp_pack_files(&self.path);
        }

        let trigger = if !existed {
            Some(RebuildReason::Missing)
        } else if options.force {
            Some(RebuildReason::Forced)
        } else {
            let packs = git::pack_file_count(&self.path);
            (packs > cache.config.gc_autopacklimit).then_some(RebuildReason::TooManyPacks(packs))
        };
        if let Some(reason) = trigger {
            log::info!("rebuilding mirror of {}: {:?}", self.identity.url(), reason);
            if existed && !options.reset_fetch_config {
                self.preserve_fetch_specs();
            }
        }

        let mut corrupted = false;
        loop {
            let target = self.prepare_target(trigger.is_some() || corrupted, corrupted, options, depth)?;
            self.configure(target.path(), options.reset_fetch_config)?;

            match self.fetch_all(target.path(), depth) {
                FetchOutcome::Installed => {
                    match target {
                        Target::Staged(staging) => self.install(staging)?,
                        Target::Live(path) => {
                            if let Some(RebuildReason::TooManyPacks(_)) = trigger {
                                if let Err(e) = cache.vcs.gc(&path, false) {
                                    log::warn!("gc of {} failed: {}", path.display(), e);
                                }
                            }
                        }
                    }
                    return Ok(());
                }
                FetchOutcome::NeedsRebuild(source) if !corrupted => {
                    log::warn!(
                        "fetch into {} failed, rebuilding from scratch: {}",
                        target.path().display(),
                        source
                    );
                    corrupted = true;
                }
                FetchOutcome::NeedsRebuild(source) => {
                    return Err(CacheError::Fetch {
                        url: self.identity.url().to_string(),
                        refspec: DEFAULT_FETCH_SPEC.to_string(),
                        source,
                    });
                }
            }
        }
    }

    /// Pick the directory to fetch into.
    ///
    /// A staging directory is created for a rebuild and seeded from a
    /// snapshot when one is available. Without a snapshot, a remote that
    /// never has snapshots keeps fetching into its existing mirror unless
    /// that mirror is known to be broken.
    fn prepare_target(
        &self,
        rebuild: bool,
        discard_live: bool,
        options: &PopulateOptions,
        depth: Option<u32>,
    ) -> Result<Target, CacheError> {
        if !rebuild {
            return Ok(Target::Live(self.path.clone()));
        }

        let cache = self.cache;
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(cache.config.paths.root())?;

        if options.bootstrap && depth.is_some() {
            log::debug!("skipping bootstrap for a depth-limited fetch");
        } else if options.bootstrap
            && cache
                .bootstrap
                .bootstrap(&cache.config, &self.identity, staging.path())
        {
            log::info!("bootstrapped {} from snapshot", self.identity.url());
            return Ok(Target::Staged(staging));
        }

        if !discard_live && self.exists() && !cache.config.is_bootstrap_eligible(&self.identity) {
            log::info!(
                "no snapshots for {}; fetching into the existing mirror",
                self.identity.url()
            );
            return Ok(Target::Live(self.path.clone()));
        }

        cache.vcs.init_bare(staging.path())?;
        Ok(Target::Staged(staging))
    }

    fn configure(&self, dir: &Path, reset_fetch_config: bool) -> Result<(), CacheError> {
        let vcs = self.cache.vcs.as_ref();

        if reset_fetch_config {
            match vcs.run(dir, &["config", "--unset-all", "remote.origin.fetch"]) {
                Ok(_) => {}
                // Nothing to unset.
                Err(e) if e.exit_code() == Some(5) => {}
                Err(e) => return Err(e.into()),
            }
        }

        vcs.run(dir, &["config", "gc.autodetach", "0"])?;
        vcs.run(dir, &["config", "gc.autopacklimit", "0"])?;
        vcs.run(dir, &["config", "core.deltaBaseCacheLimit", "2g"])?;
        vcs.run(dir, &["config", "remote.origin.url", self.identity.url()])?;
        for spec in self.fetch_specs.iter() {
            vcs.run(
                dir,
                &[
                    "config",
                    "--replace-all",
                    "remote.origin.fetch",
                    spec.refspec(),
                    spec.value_regex(),
                ],
            )?;
        }
        Ok(())
    }

    /// Fold refspecs already configured on the live mirror into this handle.
    fn preserve_fetch_specs(&mut self) {
        let output = self.cache.vcs.run(
            &self.path,
            &["config", "--get-all", "remote.origin.fetch"],
        );
        match output {
            Ok(output) => {
                for line in output.lines().map(str::trim).filter(|l| !l.is_empty()) {
                    self.fetch_specs.insert(FetchSpec::parse(line));
                }
            }
            Err(e) if e.exit_code() == Some(1) => {}
            Err(e) => log::warn!(
                "could not read fetch specs of {}: {}",
                self.path.display(),
                e
            ),
        }
    }

    fn fetch_all(&self, dir: &Path, depth: Option<u32>) -> FetchOutcome {
        let cache = self.cache;
        for spec in self.fetch_specs.iter() {
            log::info!("fetching {} from {}", spec.refspec(), self.identity.url());
            let result = retry(
                &cache.config.fetch_retry,
                &format!("fetch {}", spec.refspec()),
                || cache.vcs.fetch(dir, spec.refspec(), depth),
                GitError::is_transient,
            );
            match result {
                Ok(()) => {}
                Err(e) if spec.is_default() => return FetchOutcome::NeedsRebuild(e),
                Err(e) => log::warn!(
                    "fetch of {} from {} failed: {}",
                    spec.refspec(),
                    self.identity.url(),
                    e
                ),
            }
        }
        FetchOutcome::Installed
    }

    fn install(&self, staging: TempDir) -> Result<(), CacheError> {
        install_staged(
            staging.path(),
            &self.path,
            &self.cache.config.retry,
            |from, to| fs::rename(from, to),
        )
    }

    /// Forcibly clear every lock on this mirror.
    pub fn unlock(&self) -> Result<bool, CacheError> {
        Self::break_locks(&self.path, &self.cache.config.retry)
    }

    /// Remove the mirror lock, git's `config.lock` and half-written pack
    /// files at `path`. Returns whether a lock was removed.
    pub fn break_locks(path: &Path, policy: &RetryPolicy) -> Result<bool, CacheError> {
        let mut unlocked = Lockfile::new(path).with_retry(*policy).break_lock()?;

        let config_lock = path.join("config.lock");
        match fs::remove_file(&config_lock) {
            Ok(()) => {
                log::info!("removed {}", config_lock.display());
                unlocked = true;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        git::delete_tmp_pack_files(path);
        Ok(unlocked)
    }

    /// Repack the mirror and publish it as the newest snapshot.
    pub fn update_bootstrap(&self, options: &SnapshotOptions) -> Result<String, CacheError> {
        if !self.exists() {
            return Err(CacheError::NotFound(self.identity.url().to_string()));
        }
        let lock = self.lockfile(options.lock_timeout);
        locked(Some(&lock), options.lock_timeout, || {
            Ok(self.cache.bootstrap.update_snapshot(
                &self.identity,
                &self.path,
                self.cache.vcs.as_ref(),
                options.prune,
                options.gc_aggressive,
            )?)
        })
    }
}

/// Run `op` while holding `lock`, if any.
///
/// A failure to release is reported only when `op` itself succeeded.
fn locked<T>(
    lock: Option<&Lockfile>,
    timeout: Option<Duration>,
    op: impl FnOnce() -> Result<T, CacheError>,
) -> Result<T, CacheError> {
    if let Some(lock) = lock {
        lock.lock(timeout)?;
    }
    let result = op();
    if let Some(lock) = lock {
        if let Err(e) = lock.unlock() {
            if result.is_ok() {
                return Err(e.into());
            }
            log::warn!("failed to release {}: {}", lock.lockfile_path().display(), e);
        }
    }
    result
}

/// Replace the directory at `mirror` with `staging`.
///
/// The live mirror is first renamed aside and restored if the second rename
/// fails, so `mirror` always holds either the old or the new repository.
pub(crate) fn install_staged<F>(
    staging: &Path,
    mirror: &Path,
    policy: &RetryPolicy,
    rename: F,
) -> Result<(), CacheError>
where
    F: Fn(&Path, &Path) -> io::Result<()>,
{
    let install_error = |source| CacheError::Install {
        path: mirror.to_path_buf(),
        source,
    };

    let previous = if mirror.exists() {
        let aside = retired_path(mirror);
        if aside.exists() {
            fs::remove_dir_all(&aside).map_err(install_error)?;
        }
        retry(
            policy,
            "move old mirror aside",
            || rename(mirror, &aside),
            retry::any_error,
        )
        .map_err(install_error)?;
        Some(aside)
    } else {
        None
    };

    if let Err(e) = retry(
        policy,
        "install mirror",
        || rename(staging, mirror),
        retry::any_error,
    ) {
        if let Some(aside) = &previous {
            if let Err(restore) = rename(aside, mirror) {
                log::error!(
                    "could not restore {} from {}: {}",
                    mirror.display(),
                    aside.display(),
                    restore
                );
            }
        }
        return Err(install_error(e));
    }

    if let Some(aside) = previous {
        if let Err(e) = retry(
            policy,
            "remove old mirror",
            || fs::remove_dir_all(&aside),
            retry::any_error,
        ) {
            log::warn!(
                "left old mirror at {} ({}); `unlock --all` removes it",
                aside.display(),
                e
            );
        }
    }
    log::info!("installed mirror at {}", mirror.display());
    Ok(())
}

fn retired_path(mirror: &Path) -> PathBuf {
    let name = mirror
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let parent = mirror.parent().unwrap_or(Path::new("."));
    parent.join(format!(
        "{}old-{}-{}",
        STAGING_PREFIX,
        name,
        std::process::id()
    ))
}
