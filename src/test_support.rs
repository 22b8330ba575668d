//! In-memory stand-in for the contents API used by unit tests

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

use crate::error::{Result, SyncError};
use crate::github::{Credentials, EntryKind, RemoteContents, RemoteEntry};

#[derive(Default)]
pub(crate) struct FakeRemote {
    listings: HashMap<String, Vec<RemoteEntry>>,
    files: HashMap<String, Vec<u8>>,
    failing: HashSet<String>,
    panicking: HashSet<String>,
    requests: Mutex<Vec<String>>,
}

fn dir_url(identifier: &str, path: &str) -> String {
    if path.is_empty() {
        format!("fake://{}/contents", identifier)
    } else {
        format!("fake://{}/contents/{}", identifier, path)
    }
}

fn raw_url(identifier: &str, path: &str) -> String {
    format!("fake://{}/raw/{}", identifier, path)
}

impl FakeRemote {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Publish `files` (repository-relative path, contents) for `identifier`
    pub(crate) fn with_repo(mut self, identifier: &str, _branch: &str, files: &[(&str, &str)]) -> Self {
        self.listings.entry(dir_url(identifier, "")).or_default();

        for (path, content) in files {
            let parts: Vec<&str> = path.split('/').collect();
            let mut parent = String::new();

            for (i, part) in parts.iter().enumerate() {
                let current = if parent.is_empty() {
                    part.to_string()
                } else {
                    format!("{}/{}", parent, part)
                };
                let is_file = i + 1 == parts.len();

                let listing = self.listings.entry(dir_url(identifier, &parent)).or_default();
                if !listing.iter().any(|e| e.name == *part) {
                    listing.push(RemoteEntry {
                        name: part.to_string(),
                        kind: if is_file { EntryKind::File } else { EntryKind::Directory },
                        path: current.clone(),
                        content_url: format!("{}?ref=x", dir_url(identifier, &current)),
                        download_url: is_file.then(|| raw_url(identifier, &current)),
                    });
                }
                if !is_file {
                    self.listings.entry(dir_url(identifier, &current)).or_default();
                }
                parent = current;
            }

            self.files.insert(raw_url(identifier, path), content.as_bytes().to_vec());
        }
        self
    }

    /// Make fetching one file fail
    pub(crate) fn fail_file(mut self, identifier: &str, path: &str) -> Self {
        self.failing.insert(raw_url(identifier, path));
        self
    }

    /// Make listing one directory fail; an empty path fails the root listing
    pub(crate) fn fail_listing(mut self, identifier: &str, path: &str) -> Self {
        self.failing.insert(dir_url(identifier, path));
        self
    }

    /// Panic on any request for `identifier`
    pub(crate) fn panic_on(mut self, identifier: &str) -> Self {
        self.panicking.insert(identifier.to_string());
        self
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn observe(&self, url: &str) -> Result<String> {
        self.requests.lock().unwrap().push(url.to_string());

        let key = url.split('?').next().unwrap_or(url).to_string();
        if self.panicking.iter().any(|id| key.starts_with(&format!("fake://{}/", id))) {
            panic!("remote blew up while serving {}", key);
        }
        if self.failing.contains(&key) {
            return Err(SyncError::network(url, "simulated outage"));
        }
        Ok(key)
    }
}

#[async_trait]
impl RemoteContents for FakeRemote {
    fn contents_url(&self, identifier: &str, branch: &str) -> Result<String> {
        crate::config::split_identifier(identifier)?;
        Ok(format!("{}?ref={}", dir_url(identifier, ""), branch))
    }

    async fn list_directory(&self, url: &str, _credentials: &Credentials) -> Result<Vec<RemoteEntry>> {
        let key = self.observe(url)?;
        self.listings
            .get(&key)
            .cloned()
            .ok_or_else(|| SyncError::network(url, "HTTP 404 Not Found"))
    }

    async fn fetch_file(&self, url: &str, _credentials: &Credentials) -> Result<Vec<u8>> {
        let key = self.observe(url)?;
        self.files
            .get(&key)
            .cloned()
            .ok_or_else(|| SyncError::network(url, "HTTP 404 Not Found"))
    }
}

/// Every entry under `root` keyed by `/`-separated relative path
///
/// Directories appear with a trailing `/` and empty contents, so an extra or
/// missing empty directory changes the map.
pub(crate) fn read_tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut tree = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let path = entry.path();
            let relative = path
                .strip_prefix(root)
                .unwrap()
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            if entry.file_type().unwrap().is_dir() {
                tree.insert(format!("{}/", relative), Vec::new());
                pending.push(path);
            } else {
                tree.insert(relative, std::fs::read(&path).unwrap());
            }
        }
    }
    tree
}
