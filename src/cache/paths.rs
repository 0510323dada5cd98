//! Cache directory path management
//!
//! Every mirror lives directly under the cache root, named by a normalized
//! form of its remote URL:
//!
//! ```text
//! <root>/
//! ├── chromium.googlesource.com-chromium-src/       # Bare mirror
//! ├── chromium.googlesource.com-chromium-src.lock   # Owner pid
//! └── _cache_tmpXXXXXX/                              # Staging dir for a rebuild
//! ```
//!
//! The URL to directory mapping strips the scheme, drops a trailing `/` or
//! `.git`, escapes `-` as `--` and then turns `/` into `-`. The reverse mapping
//! is only an approximation: a path segment that itself starts or ends with a
//! `-` cannot be told apart from an escaped hyphen next to a separator.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use thiserror::Error;

/// Name prefix for staging directories created under the cache root.
pub const STAGING_PREFIX: &str = "_cache_tmp";

/// Suffix appended to a mirror path to form its lock file.
pub const LOCK_SUFFIX: &str = ".lock";

/// Manages the filesystem paths of the cache layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePaths {
    root: PathBuf,
}

impl CachePaths {
    /// Creates a new CachePaths with the specified root directory
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the root cache directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the mirror directory for a remote: `{root}/{normalized-name}`
    pub fn mirror_dir(&self, identity: &MirrorIdentity) -> PathBuf {
        self.root.join(identity.dir_name())
    }

}

impl Default for CachePaths {
    /// Creates a CachePaths using the system cache directory + "git-cache"
    fn default() -> Self {
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"));
        Self::new(cache_dir.join("git-cache"))
    }
}

/// Lock file path guarding `mirror_path`.
pub fn lock_path_for(mirror_path: &Path) -> PathBuf {
    let mut name = OsString::from(mirror_path.as_os_str());
    name.push(LOCK_SUFFIX);
    PathBuf::from(name)
}

/// A URL whose directory name would not be a mirror of its own.
#[derive(Error, Debug)]
#[error("{url:?} does not map to a usable cache directory (got {dir_name:?})")]
pub struct InvalidMirrorUrl {
    pub url: String,
    pub dir_name: String,
}

/// A remote URL paired with the cache directory name it maps to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MirrorIdentity {
    url: String,
    dir_name: String,
}

impl MirrorIdentity {
    /// Rejects URLs that normalize to the cache root itself, its parent, or a
    /// name reserved for staging directories.
    pub fn new(url: impl Into<String>) -> Result<Self, InvalidMirrorUrl> {
        let url = url.into();
        let dir_name = url_to_dir(&url);
        if matches!(dir_name.as_str(), "" | "." | "..") || dir_name.starts_with(STAGING_PREFIX) {
            return Err(InvalidMirrorUrl { url, dir_name });
        }
        Ok(Self { url, dir_name })
    }

    /// The remote URL as given by the caller.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The normalized directory name under the cache root.
    pub fn dir_name(&self) -> &str {
        &self.dir_name
    }

    /// Lowercased host of the remote, `None` for local paths.
    pub fn host(&self) -> Option<String> {
        url_host(&self.url)
    }
}

/// Convert a remote URL to the normalized cache directory name.
///
/// Absolute local paths are escaped as-is (no lowercasing) so that two
/// distinct local repositories never share a mirror.
pub fn url_to_dir(url: &str) -> String {
    if url.starts_with('/') {
        return escape(url.trim_end_matches('/'));
    }

    let rest = host_and_path(url);
    let rest = rest.trim_end_matches('/');
    let rest = rest.strip_suffix(".git").unwrap_or(rest);
    let rest = rest.trim_end_matches('/');

    // Authenticated googlesource URLs share a mirror with anonymous ones.
    let rest = rest.replacen("googlesource.com/a/", "googlesource.com/", 1);

    escape(&rest).to_lowercase()
}

/// Convert a cache directory name back to a URL.
///
/// `--` decodes to `-` and a lone `-` decodes to `/`, scanning left to right.
/// Names of local mirrors (leading `-`) decode to the absolute path; anything
/// else gets an `https://` scheme.
pub fn dir_to_url(name: &str) -> String {
    let mut decoded = String::with_capacity(name.len());
    let mut chars = name.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '-' {
            decoded.push(c);
        } else if chars.peek() == Some(&'-') {
            chars.next();
            decoded.push('-');
        } else {
            decoded.push('/');
        }
    }

    if decoded.starts_with('/') {
        decoded
    } else {
        format!("https://{}", decoded)
    }
}

/// Lowercased host (without userinfo or port) of a remote URL.
pub fn url_host(url: &str) -> Option<String> {
    if url.starts_with('/') {
        return None;
    }
    let rest = host_and_path(url);
    let host = rest.split('/').next().unwrap_or_default();
    let host = host.split(':').next().unwrap_or_default();
    if host.is_empty() {
        None
    } else {
        Some(host.to_lowercase())
    }
}

fn escape(value: &str) -> String {
    value.replace('-', "--").replace('/', "-")
}

/// Strip the scheme and userinfo, leaving `host[:port]/path`.
///
/// scp-like remotes (`git@host:org/repo`) are rewritten to `host/org/repo`.
fn host_and_path(url: &str) -> String {
    if let Some((_, rest)) = url.split_once("://") {
        return strip_userinfo(rest).to_string();
    }

    let rest = strip_userinfo(url);
    match rest.split_once(':') {
        Some((host, path)) if !host.contains('/') && !path.starts_with("//") => {
            format!("{}/{}", host, path.trim_start_matches('/'))
        }
        _ => rest.to_string(),
    }
}

fn strip_userinfo(rest: &str) -> &str {
    let authority_end = rest.find('/').unwrap_or(rest.len());
    match rest[..authority_end].rfind('@') {
        Some(at) => &rest[at + 1..],
        None => rest,
    }
}
