//! Object stores holding bootstrap snapshots.
//!
//! Names are `/`-separated keys such as `host-org-repo/0000001234.tar.gz`.
//! Two implementations exist:
//! - [`LocalObjectStore`] keeps objects as files under a directory (shared
//!   filesystems, tests).
//! - [`HttpObjectStore`] reads a public Google Cloud Storage bucket over
//!   its JSON API. It cannot write; uploads need credentials this tool does
//!   not manage.

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

const GCS_API: &str = "https://storage.googleapis.com";

/// Errors returned by object store operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// No object with this name.
    #[error("object not found: {0}")]
    NotFound(String),
    /// The name is empty or escapes the store root.
    #[error("invalid object name: {0}")]
    InvalidName(String),
    /// The store does not accept writes.
    #[error("{0} is read-only")]
    ReadOnly(String),
    /// An HTTP request failed.
    #[error("request to {url} failed: {message}")]
    Http { url: String, message: String },
    /// The listing response could not be decoded.
    #[error("failed to parse listing: {0}")]
    Parse(#[from] serde_json::Error),
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Remote object storage consumed by bootstrap transfers.
pub trait ObjectStore: Send + Sync {
    /// Names of all objects starting with `prefix`, sorted ascending.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Download object `name` to the local file `dest`.
    fn get(&self, name: &str, dest: &Path) -> Result<(), StoreError>;

    /// Upload the local file `src` as object `name`, replacing any existing one.
    fn put(&self, src: &Path, name: &str) -> Result<(), StoreError>;

    /// Delete object `name`.
    fn delete(&self, name: &str) -> Result<(), StoreError>;
}

/// Where snapshots live, as configured by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// `gs://<bucket>`
    Gcs { bucket: String },
    /// `file:///<dir>` or a plain directory path.
    Local { root: PathBuf },
}

impl StoreLocation {
    pub fn parse(value: &str) -> Self {
        if let Some(bucket) = value.strip_prefix("gs://") {
            return StoreLocation::Gcs {
                bucket: bucket.trim_end_matches('/').to_string(),
            };
        }
        let path = value.strip_prefix("file://").unwrap_or(value);
        StoreLocation::Local {
            root: PathBuf::from(path),
        }
    }

    /// Open a store client for this location.
    pub fn open(&self) -> Box<dyn ObjectStore> {
        match self {
            StoreLocation::Gcs { bucket } => Box::new(HttpObjectStore::new(bucket.clone())),
            StoreLocation::Local { root } => Box::new(LocalObjectStore::new(root.clone())),
        }
    }
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreLocation::Gcs { bucket } => write!(f, "gs://{}", bucket),
            StoreLocation::Local { root } => write!(f, "file://{}", root.display()),
        }
    }
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    let path = Path::new(name);
    let valid = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(name.to_string()))
    }
}

/// Directory-backed object store.
#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn object_path(&self, name: &str) -> Result<PathBuf, StoreError> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }
}

impl ObjectStore for LocalObjectStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        // Only the directory holding the prefix's last segment can contain matches.
        let dir_part = prefix.rfind('/').map(|i| &prefix[..i]).unwrap_or("");
        let start = if dir_part.is_empty() {
            self.root.clone()
        } else {
            self.object_path(dir_part)?
        };

        let mut names = Vec::new();
        collect_files(&start, dir_part, &mut names)?;
        names.retain(|name| name.starts_with(prefix));
        names.sort();
        Ok(names)
    }

    fn get(&self, name: &str, dest: &Path) -> Result<(), StoreError> {
        let path = self.object_path(name)?;
        match fs::copy(&path, dest) {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, src: &Path, name: &str) -> Result<(), StoreError> {
        let path = self.object_path(name)?;
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent)?;

        // Readers never see a partially copied object.
        let mut staged = tempfile::NamedTempFile::new_in(parent)?;
        io::copy(&mut File::open(src)?, staged.as_file_mut())?;
        staged.as_file().sync_all()?;
        staged.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<(), StoreError> {
        let path = self.object_path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn collect_files(dir: &Path, relative: &str, names: &mut Vec<String>) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        let Some(file_name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        // Skip uploads still being staged by `put`.
        if file_name.starts_with(".tmp") {
            continue;
        }
        let name = if relative.is_empty() {
            file_name
        } else {
            format!("{}/{}", relative, file_name)
        };
        if entry.file_type()?.is_dir() {
            collect_files(&entry.path(), &name, names)?;
        } else {
            names.push(name);
        }
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<ListItem>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListItem {
    name: String,
}

/// Read-only client for a public Google Cloud Storage bucket.
pub struct HttpObjectStore {
    bucket: String,
    agent: ureq::Agent,
}

impl HttpObjectStore {
    pub fn new(bucket: impl Into<String>) -> Self {
        let agent = ureq::builder()
            .timeout_connect(Duration::from_secs(30))
            .timeout_read(Duration::from_secs(300))
            .user_agent(concat!("git-cache/", env!("CARGO_PKG_VERSION")))
            .build();
        Self {
            bucket: bucket.into(),
            agent,
        }
    }

    fn http_error(url: &str, err: ureq::Error) -> StoreError {
        StoreError::Http {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

impl ObjectStore for HttpObjectStore {
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let url = format!("{}/storage/v1/b/{}/o", GCS_API, self.bucket);
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut request = self
                .agent
                .get(&url)
                .query("prefix", prefix)
                .query("fields", "items(name),nextPageToken");
            if let Some(token) = &page_token {
                request = request.query("pageToken", token);
            }

            let body = request
                .call()
                .map_err(|e| Self::http_error(&url, e))?
                .into_string()?;
            let page: ListResponse = serde_json::from_str(&body)?;
            names.extend(page.items.into_iter().map(|item| item.name));

            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        log::debug!("listed {} objects under gs://{}/{}", names.len(), self.bucket, prefix);
        names.sort();
        Ok(names)
    }

    fn get(&self, name: &str, dest: &Path) -> Result<(), StoreError> {
        validate_name(name)?;
        let url = format!("{}/{}/{}", GCS_API, self.bucket, name);

        let response = match self.agent.get(&url).call() {
            Ok(response) => response,
            Err(ureq::Error::Status(404, _)) => {
                return Err(StoreError::NotFound(name.to_string()));
            }
            Err(e) => return Err(Self::http_error(&url, e)),
        };

        let mut file = File::create(dest)?;
        let bytes = io::copy(&mut response.into_reader(), &mut file)?;
        file.sync_all()?;
        log::debug!("downloaded {} ({} bytes)", url, bytes);
        Ok(())
    }

    fn put(&self, _src: &Path, _name: &str) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly(format!("gs://{}", self.bucket)))
    }

    fn delete(&self, _name: &str) -> Result<(), StoreError> {
        Err(StoreError::ReadOnly(format!("gs://{}", self.bucket)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn network_tests_enabled() -> bool {
        match std::env::var("GIT_CACHE_RUN_NETWORK_TESTS") {
            Ok(value) => {
                let value = value.to_ascii_lowercase();
                value == "1" || value == "true" || value == "yes"
            }
            Err(_) => false,
        }
    }

    fn local_store_with(names: &[&str]) -> (tempfile::TempDir, LocalObjectStore) {
        let dir = tempdir().unwrap();
        let store = LocalObjectStore::new(dir.path().join("bucket"));
        let src = dir.path().join("payload");
        fs::write(&src, b"payload").unwrap();
        for name in names {
            store.put(&src, name).unwrap();
        }
        (dir, store)
    }

    #[test]
    fn test_store_location_parse() {
        assert_eq!(
            StoreLocation::parse("gs://chromium-git-cache/"),
            StoreLocation::Gcs {
                bucket: "chromium-git-cache".to_string()
            }
        );
        assert_eq!(
            StoreLocation::parse("file:///srv/snapshots"),
            StoreLocation::Local {
                root: PathBuf::from("/srv/snapshots")
            }
        );
        assert_eq!(
            StoreLocation::parse("/srv/snapshots"),
            StoreLocation::Local {
                root: PathBuf::from("/srv/snapshots")
            }
        );
        assert_eq!(
            StoreLocation::parse("gs://bucket").to_string(),
            "gs://bucket"
        );
    }

    #[test]
    fn test_local_list_filters_by_prefix_and_sorts() {
        let (_dir, store) = local_store_with(&[
            "repo-a/0000000002.tar.gz",
            "repo-a/0000000010.tar.gz",
            "repo-ab/0000000001.tar.gz",
            "repo-b/0000000005.tar.gz",
        ]);

        assert_eq!(
            store.list("repo-a/").unwrap(),
            vec!["repo-a/0000000002.tar.gz", "repo-a/0000000010.tar.gz"]
        );
        assert_eq!(store.list("repo-a").unwrap().len(), 3);
        assert!(store.list("missing/").unwrap().is_empty());
    }

    #[test]
    fn test_local_get_put_delete() {
        let (dir, store) = local_store_with(&["repo/1.tar.gz"]);
        let dest = dir.path().join("download");

        store.get("repo/1.tar.gz", &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"payload");

        store.delete("repo/1.tar.gz").unwrap();
        assert!(store.list("repo/").unwrap().is_empty());
        assert!(matches!(
            store.delete("repo/1.tar.gz"),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.get("repo/1.tar.gz", &dest),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_local_put_replaces_existing() {
        let (dir, store) = local_store_with(&["repo/1.tar.gz"]);
        let src = dir.path().join("newer");
        fs::write(&src, b"newer").unwrap();
        store.put(&src, "repo/1.tar.gz").unwrap();

        let dest = dir.path().join("download");
        store.get("repo/1.tar.gz", &dest).unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"newer");
        assert_eq!(store.list("repo/").unwrap(), vec!["repo/1.tar.gz"]);
    }

    #[test]
    fn test_names_cannot_escape_root() {
        let (dir, store) = local_store_with(&[]);
        let src = dir.path().join("payload");
        assert!(matches!(
            store.put(&src, "../outside"),
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(
            store.put(&src, "/etc/passwd"),
            Err(StoreError::InvalidName(_))
        ));
        assert!(matches!(store.put(&src, ""), Err(StoreError::InvalidName(_))));
    }

    #[test]
    fn test_http_store_is_read_only() {
        let store = HttpObjectStore::new("bucket");
        assert!(matches!(
            store.put(Path::new("x"), "repo/1.tar.gz"),
            Err(StoreError::ReadOnly(_))
        ));
        assert!(matches!(
            store.delete("repo/1.tar.gz"),
            Err(StoreError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_list_response_parsing() {
        let page: ListResponse = serde_json::from_str(
            r#"{"items":[{"name":"a/1.tar.gz"},{"name":"a/2.tar.gz"}],"nextPageToken":"abc"}"#,
        )
        .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_page_token.as_deref(), Some("abc"));

        let empty: ListResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.items.is_empty());
        assert!(empty.next_page_token.is_none());
    }

    #[test]
    fn test_http_list_public_bucket() {
        if !network_tests_enabled() {
            eprintln!("skipping network test (set GIT_CACHE_RUN_NETWORK_TESTS=1)");
            return;
        }
        let store = HttpObjectStore::new("chromium-git-cache");
        let names = store
            .list("chromium.googlesource.com-chromium-tools-depot_tools/")
            .unwrap();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }
}
