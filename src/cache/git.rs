//! Git operations using a hybrid CLI + libgit2 approach.
//!
//! **CLI (with hardening) for anything that talks to a remote or writes:**
//! - `init_bare` - create an empty bare mirror
//! - `fetch` - fetch one refspec from `origin`, optionally with `--depth`
//! - `gc` - repack before a snapshot upload
//! - `run` - raw `git config` and friends
//!
//! **libgit2 for local reads:**
//! - `contains_commit` - revision existence check
//! - `default_branch_commit_count` - snapshot generation numbers
//!
//! The CLI side sits behind the [`Vcs`] trait so mirror orchestration can be
//! exercised against wrappers that inject failures.

use git2::{ErrorCode, Repository};
use std::fs;
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;

/// Errors returned by git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// libgit2 reported an error.
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    /// Repository path does not contain a git repo.
    #[error("repository not found at {0}")]
    NotFound(String),
    /// A git subprocess exited unsuccessfully.
    #[error("`git {command}` failed{}: {}", exit_suffix(.code), .stderr.trim())]
    Command {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
    /// Output parsing or unexpected git data.
    #[error("failed to parse git data: {0}")]
    ParseError(String),
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

fn exit_suffix(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!(" with exit code {}", code),
        None => " (killed by signal)".to_string(),
    }
}

impl GitError {
    /// Whether a fetch failing with this error is worth retrying.
    ///
    /// Any unsuccessful git run may be a network blip; spawn failures and
    /// rejected inputs will fail the same way again.
    pub fn is_transient(&self) -> bool {
        matches!(self, GitError::Command { .. })
    }

    /// Exit code of a failed git subprocess.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            GitError::Command { code, .. } => *code,
            _ => None,
        }
    }
}

/// Validate a refspec or revision passed as a git argument.
///
/// Rejects:
/// - Empty strings
/// - Strings starting with `-` (could be interpreted as flags)
/// - Strings containing null bytes or control characters
pub(crate) fn validate_git_arg(value: &str, name: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput(format!("{} cannot be empty", name)));
    }
    if value.starts_with('-') {
        return Err(GitError::InvalidInput(format!(
            "{} cannot start with '-'",
            name
        )));
    }
    if value.bytes().any(|b| b < 0x20) {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain null or control characters",
            name
        )));
    }
    Ok(())
}

/// Version-control operations the mirror cache needs from a subprocess runner.
pub trait Vcs: Send + Sync {
    /// Run `git <args>` in `cwd`, returning stdout.
    fn run(&self, cwd: &Path, args: &[&str]) -> Result<String, GitError>;

    /// Create an empty bare repository at `path`.
    fn init_bare(&self, path: &Path) -> Result<(), GitError>;

    /// Fetch one refspec from `origin` into the repository at `cwd`.
    fn fetch(&self, cwd: &Path, refspec: &str, depth: Option<u32>) -> Result<(), GitError>;

    /// Garbage-collect and prune the repository at `cwd`.
    fn gc(&self, cwd: &Path, aggressive: bool) -> Result<(), GitError>;
}

/// Git CLI wrapper with security hardening.
#[derive(Debug, Clone)]
pub struct GitCli {
    git_path: String,
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCli {
    /// Create a new GitCli instance using the system git.
    pub fn new() -> Self {
        Self {
            git_path: "git".into(),
        }
    }

    /// Whether the git binary can be executed.
    pub fn is_available(&self) -> bool {
        Command::new(&self.git_path)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|s| s.success())
            .unwrap_or(false)
    }

    /// Create a hardened Command with security settings.
    ///
    /// Applies:
    /// - `GIT_LFS_SKIP_SMUDGE=1` - skip LFS file downloads
    /// - `GIT_TERMINAL_PROMPT=0` - disable interactive prompts
    /// - `core.hooksPath=` - disable hooks execution
    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.git_path);
        cmd.env("GIT_LFS_SKIP_SMUDGE", "1");
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.args(["-c", "core.hooksPath="]);
        cmd.stdin(Stdio::null());
        cmd
    }

    fn output(&self, cwd: Option<&Path>, args: &[&str]) -> Result<String, GitError> {
        let mut cmd = self.command();
        if let Some(cwd) = cwd {
            cmd.arg("-C").arg(cwd);
        }
        cmd.args(args);

        log::debug!("running git {}", args.join(" "));
        let output = cmd.output()?;

        if !output.status.success() {
            return Err(GitError::Command {
                command: args.join(" "),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

impl Vcs for GitCli {
    fn run(&self, cwd: &Path, args: &[&str]) -> Result<String, GitError> {
        self.output(Some(cwd), args)
    }

    fn init_bare(&self, path: &Path) -> Result<(), GitError> {
        fs::create_dir_all(path)?;
        let path_str = path
            .to_str()
            .ok_or_else(|| GitError::ParseError("mirror path is not valid UTF-8".to_string()))?;
        self.output(None, &["init", "--bare", "--quiet", path_str])?;
        Ok(())
    }

    fn fetch(&self, cwd: &Path, refspec: &str, depth: Option<u32>) -> Result<(), GitError> {
        validate_git_arg(refspec, "refspec")?;

        let depth_arg = depth.map(|d| format!("--depth={}", d));
        let mut args = vec!["fetch", "--prune", "--quiet"];
        if let Some(depth_arg) = depth_arg.as_deref() {
            args.push(depth_arg);
        }
        args.extend(["origin", refspec]);

        self.output(Some(cwd), &args)?;
        Ok(())
    }

    fn gc(&self, cwd: &Path, aggressive: bool) -> Result<(), GitError> {
        let mut args = vec!["gc", "--prune=all", "--quiet"];
        if aggressive {
            args.push("--aggressive");
        }
        self.output(Some(cwd), &args)?;
        Ok(())
    }
}

/// Open an existing repository at the given path.
pub fn open_repository(path: &Path) -> Result<Repository, GitError> {
    let repo = Repository::open(path).map_err(|e| {
        if e.code() == ErrorCode::NotFound {
            GitError::NotFound(path.display().to_string())
        } else {
            GitError::Git(e)
        }
    })?;
    Ok(repo)
}

/// Whether `revision` resolves to a commit in the repository at `path`.
pub fn contains_commit(path: &Path, revision: &str) -> Result<bool, GitError> {
    validate_git_arg(revision, "revision")?;
    let repo = open_repository(path)?;
    let spec = format!("{}^{{commit}}", revision);

    match repo.revparse_single(&spec) {
        Ok(_) => Ok(true),
        Err(e)
            if matches!(
                e.code(),
                ErrorCode::NotFound | ErrorCode::InvalidSpec | ErrorCode::Ambiguous
            ) || e.class() == git2::ErrorClass::Object =>
        {
            Ok(false)
        }
        Err(e) => Err(GitError::Git(e)),
    }
}

/// Number of commits reachable from the default branch of the repository.
///
/// The default branch is `HEAD` when it resolves, else `main`, else `master`.
pub fn default_branch_commit_count(path: &Path) -> Result<usize, GitError> {
    let repo = open_repository(path)?;

    let tip = ["HEAD", "refs/heads/main", "refs/heads/master"]
        .iter()
        .find_map(|name| {
            repo.revparse_single(&format!("{}^{{commit}}", name))
                .ok()
                .map(|object| object.id())
        })
        .ok_or_else(|| GitError::NotFound(format!("default branch in {}", path.display())))?;

    let mut walk = repo.revwalk()?;
    walk.push(tip)?;

    let mut count = 0;
    for oid in walk {
        oid?;
        count += 1;
    }
    Ok(count)
}

/// Number of `*.pack` files in the repository's object store.
pub fn pack_file_count(path: &Path) -> usize {
    let Ok(entries) = fs::read_dir(path.join("objects").join("pack")) else {
        return 0;
    };
    entries
        .flatten()
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "pack"))
        .count()
}

/// Remove pack files an interrupted git process left half-written.
///
/// Returns the number of files removed.
pub fn delete_tmp_pack_files(path: &Path) -> usize {
    let Ok(entries) = fs::read_dir(path.join("objects").join("pack")) else {
        return 0;
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !(name.starts_with(".tmp-") || name.starts_with("tmp_pack_")) {
            continue;
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => {
                log::info!("removed stale pack file {}", entry.path().display());
                removed += 1;
            }
            Err(e) => log::warn!("failed to remove {}: {}", entry.path().display(), e),
        }
    }
    removed
}
