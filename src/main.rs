pub mod cache;
pub mod config;

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Parser, Subcommand};

use crate::cache::{GitCli, MirrorCache, PopulateOptions, SnapshotOptions, Vcs, dir_to_url};
use crate::config::CacheConfig;

#[derive(Parser)]
#[command(
    name = "git-cache",
    about = "Shared on-disk cache of bare git mirrors"
)]
struct Cli {
    /// Cache root (overrides GIT_CACHE_PATH and git config cache.cachepath)
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    /// More logging: -v info, -vv debug, -vvv trace
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or refresh the mirror of a remote
    Populate {
        /// Remote URL or local repository path
        url: String,

        /// Extra ref or refspec to fetch (repeatable)
        #[arg(long = "ref")]
        refs: Vec<String>,

        /// Fetch only this many commits of history
        #[arg(long)]
        depth: Option<u32>,

        /// Shallow fetch with a large default depth
        #[arg(long)]
        shallow: bool,

        /// Never seed a new mirror from a snapshot
        #[arg(long)]
        no_bootstrap: bool,

        /// Do not take the mirror lock
        #[arg(long)]
        ignore_locks: bool,

        /// Break any existing locks on the mirror first
        #[arg(long)]
        break_locks: bool,

        /// Seconds to wait for the mirror lock
        #[arg(long)]
        lock_timeout: Option<u64>,

        /// Forget refspecs configured by earlier populates
        #[arg(long)]
        reset_fetch_config: bool,

        /// Rebuild the mirror from scratch
        #[arg(long)]
        force: bool,
    },

    /// Refresh cached remotes of the current repository, then fetch from them
    Fetch {
        /// Remotes to fetch (default: all)
        remotes: Vec<String>,

        /// Never seed a new mirror from a snapshot
        #[arg(long)]
        no_bootstrap: bool,
    },

    /// Print the mirror path if the mirror exists
    Exists {
        url: String,

        /// Also require this commit to be present
        #[arg(long)]
        commit: Option<String>,
    },

    /// Break mirror locks left by crashed processes
    Unlock {
        url: Option<String>,

        /// Unlock every mirror and remove abandoned staging directories
        #[arg(long)]
        all: bool,

        /// Required; unlocking a mirror in use corrupts it
        #[arg(long)]
        force: bool,
    },

    /// Upload a snapshot of the mirror for future bootstraps
    UpdateBootstrap {
        url: String,

        /// Delete older snapshots of this mirror
        #[arg(long)]
        prune: bool,

        /// Run an aggressive gc first
        #[arg(long)]
        gc_aggressive: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = match CacheConfig::resolve(cli.cache_dir) {
        Ok(config) => run(cli.command, MirrorCache::from_config(config)),
        Err(e) => Err(e.into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

fn run(command: Commands, cache: MirrorCache) -> Result<(), Box<dyn std::error::Error>> {
    let needs_git = !matches!(command, Commands::Exists { .. } | Commands::Unlock { .. });
    if needs_git && !GitCli::new().is_available() {
        return Err("git is not installed or not on PATH".into());
    }

    match command {
        Commands::Populate {
            url,
            refs,
            depth,
            shallow,
            no_bootstrap,
            ignore_locks,
            break_locks,
            lock_timeout,
            reset_fetch_config,
            force,
        } => {
            let options = PopulateOptions {
                depth,
                shallow,
                bootstrap: !no_bootstrap,
                lock_timeout: lock_timeout.map(Duration::from_secs),
                ignore_lock: ignore_locks,
                force,
                reset_fetch_config,
            };
            cmd_populate(&cache, &url, &refs, break_locks, &options)
        }
        Commands::Fetch {
            remotes,
            no_bootstrap,
        } => cmd_fetch(&cache, &remotes, no_bootstrap),
        Commands::Exists { url, commit } => cmd_exists(&cache, &url, commit.as_deref()),
        Commands::Unlock { url, all, force } => cmd_unlock(&cache, url.as_deref(), all, force),
        Commands::UpdateBootstrap {
            url,
            prune,
            gc_aggressive,
        } => cmd_update_bootstrap(&cache, &url, prune, gc_aggressive),
    }
}

fn cmd_populate(
    cache: &MirrorCache,
    url: &str,
    refs: &[String],
    break_locks: bool,
    options: &PopulateOptions,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut mirror = cache.mirror(url)?.with_refs(refs);
    if break_locks {
        mirror.unlock()?;
    }
    mirror.populate(options)?;
    println!("{}", mirror.path().display());
    Ok(())
}

fn cmd_fetch(
    cache: &MirrorCache,
    remotes: &[String],
    no_bootstrap: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let repo = git2::Repository::discover(".")?;
    let workdir = repo.workdir().unwrap_or_else(|| repo.path()).to_path_buf();

    let remotes = if remotes.is_empty() {
        repo.remotes()?
            .iter()
            .flatten()
            .map(str::to_string)
            .collect()
    } else {
        remotes.to_vec()
    };
    if remotes.is_empty() {
        return Err("no remotes configured".into());
    }

    let options = PopulateOptions {
        bootstrap: !no_bootstrap,
        ..Default::default()
    };
    let git = GitCli::new();

    for name in &remotes {
        let remote = repo.find_remote(name)?;
        let url = remote.url().unwrap_or_default();
        if let Some(dir_name) = cached_mirror_name(cache.config().paths.root(), url) {
            let upstream = dir_to_url(&dir_name);
            log::info!("refreshing mirror of {} for remote {}", upstream, name);
            cache.mirror(&upstream)?.populate(&options)?;
        }
        git.run(&workdir, &["fetch", name.as_str()])?;
    }
    Ok(())
}

/// Directory name of the mirror `url` points at, if it lies in the cache root.
fn cached_mirror_name(root: &Path, url: &str) -> Option<String> {
    let relative = Path::new(url).strip_prefix(root).ok()?;
    let mut components = relative.components();
    let name = components.next()?.as_os_str().to_str()?.to_string();
    components.next().is_none().then_some(name)
}

fn cmd_exists(
    cache: &MirrorCache,
    url: &str,
    commit: Option<&str>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mirror = cache.mirror(url)?;
    let present = match commit {
        Some(commit) => mirror.contains_revision(commit)?,
        None => mirror.exists(),
    };

    if !present {
        std::process::exit(1);
    }
    println!("{}", mirror.path().display());
    Ok(())
}

fn cmd_unlock(
    cache: &MirrorCache,
    url: Option<&str>,
    all: bool,
    force: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    if !force {
        return Err(
            "unlocking a mirror another process is using will corrupt it; re-run with --force"
                .into(),
        );
    }

    if all {
        let report = crate::cache::unlock_all(cache.config())?;
        for path in &report.unlocked {
            println!("Unlocked {}", path.display());
        }
        for path in &report.removed_staging {
            println!("Removed {}", path.display());
        }
        for (path, e) in &report.failures {
            eprintln!("Failed to clean {}: {}", path.display(), e);
        }
        if !report.is_clean() {
            return Err(format!("{} entries could not be cleaned", report.failures.len()).into());
        }
        return Ok(());
    }

    let Some(url) = url else {
        return Err("specify a repository URL or --all".into());
    };
    let mirror = cache.mirror(url)?;
    if mirror.unlock()? {
        println!("Unlocked {}", mirror.path().display());
    } else {
        println!("{} was not locked", mirror.path().display());
    }
    Ok(())
}

fn cmd_update_bootstrap(
    cache: &MirrorCache,
    url: &str,
    prune: bool,
    gc_aggressive: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let options = SnapshotOptions {
        prune,
        gc_aggressive,
        lock_timeout: None,
    };
    let name = cache.mirror(url)?.update_bootstrap(&options)?;
    println!("Uploaded {}", name);
    Ok(())
}
