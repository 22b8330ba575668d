//! Common test utilities: a wiremock stand-in for the GitHub contents API
#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Output;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use repomirror::RepoConfig;

/// Fake GitHub serving directory listings and raw files
pub struct FakeGitHub {
    pub server: MockServer,
}

impl FakeGitHub {
    pub async fn start() -> Self {
        Self {
            server: MockServer::start().await,
        }
    }

    pub fn api_base(&self) -> String {
        self.server.uri()
    }

    fn contents_path(repo: &str, dir: &str) -> String {
        if dir.is_empty() {
            format!("/repos/{}/contents", repo)
        } else {
            format!("/repos/{}/contents/{}", repo, dir)
        }
    }

    /// Serve `files` (path, contents) as the tree of `repo` at `branch`
    pub async fn publish(&self, repo: &str, branch: &str, files: &[(&str, &str)]) {
        let base = self.api_base();
        let mut listings: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        listings.entry(String::new()).or_default();

        for (file, content) in files {
            let parts: Vec<&str> = file.split('/').collect();
            let mut parent = String::new();

            for (i, part) in parts.iter().enumerate() {
                let current = if parent.is_empty() {
                    part.to_string()
                } else {
                    format!("{}/{}", parent, part)
                };
                let is_file = i + 1 == parts.len();

                let listing = listings.entry(parent.clone()).or_default();
                if !listing.iter().any(|e| e["name"] == *part) {
                    let url = format!("{}{}?ref={}", base, Self::contents_path(repo, &current), branch);
                    let download_url = if is_file {
                        json!(format!("{}/raw/{}/{}/{}", base, repo, branch, current))
                    } else {
                        Value::Null
                    };
                    listing.push(json!({
                        "name": part,
                        "type": if is_file { "file" } else { "dir" },
                        "path": current,
                        "url": url,
                        "download_url": download_url,
                    }));
                }
                if !is_file {
                    listings.entry(current.clone()).or_default();
                }
                parent = current;
            }

            Mock::given(method("GET"))
                .and(path(format!("/raw/{}/{}/{}", repo, branch, file)))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(content.as_bytes().to_vec()))
                .mount(&self.server)
                .await;
        }

        for (dir, entries) in listings {
            Mock::given(method("GET"))
                .and(path(Self::contents_path(repo, &dir)))
                .and(query_param("ref", branch))
                .respond_with(ResponseTemplate::new(200).set_body_json(Value::Array(entries)))
                .mount(&self.server)
                .await;
        }
    }

    /// Make listing `dir` of `repo` answer 500; an empty `dir` is the root
    pub async fn fail_listing(&self, repo: &str, dir: &str) {
        Mock::given(method("GET"))
            .and(path(Self::contents_path(repo, dir)))
            .respond_with(ResponseTemplate::new(500))
            .with_priority(1)
            .mount(&self.server)
            .await;
    }

    /// Accept pushes of `file` to `repo` as a new file
    pub async fn accept_push(&self, repo: &str, file: &str) {
        let contents = Self::contents_path(repo, file);
        Mock::given(method("GET"))
            .and(path(contents.clone()))
            .respond_with(ResponseTemplate::new(404))
            .mount(&self.server)
            .await;
        Mock::given(method("PUT"))
            .and(path(contents))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({
                "content": { "path": file },
                "commit": { "sha": "c0ffee" }
            })))
            .expect(1)
            .mount(&self.server)
            .await;
    }
}

/// Tool config pointing at `api_base`, with state files kept inside `dir`
pub fn write_config(dir: &Path, api_base: &str) -> PathBuf {
    let config_path = dir.join("config.yml");
    let content = format!(
        r#"
github:
  api_base: "{api_base}"
  write_timeout: 5
daemon:
  interval: "1h"
  pid_file: "{pid}"
  log_file: "{log}"
logging:
  level: "warn"
"#,
        api_base = api_base,
        pid = dir.join("repomirror.pid").display(),
        log = dir.join("daemon.log").display(),
    );
    std::fs::write(&config_path, content).expect("Failed to write test config");
    config_path
}

/// Turn `dir` into a repository root tracking `repo` at `branch`
pub fn make_root(dir: &Path, repo: &str, branch: &str) {
    std::fs::create_dir_all(dir).expect("Failed to create root");
    RepoConfig::new(repo, branch)
        .save(dir)
        .expect("Failed to write repository record");
}

/// Run the compiled binary in `cwd` without blocking the async runtime
pub async fn run_cli(config: &Path, cwd: &Path, args: &[&str]) -> Output {
    let config = config.to_path_buf();
    let cwd = cwd.to_path_buf();
    let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();

    tokio::task::spawn_blocking(move || {
        std::process::Command::new(env!("CARGO_BIN_EXE_repomirror"))
            .arg("--config")
            .arg(&config)
            .args(&args)
            .current_dir(&cwd)
            .env_remove("RUST_LOG")
            .output()
            .expect("Failed to execute repomirror")
    })
    .await
    .expect("CLI task panicked")
}

/// Every entry under `root` keyed by `/`-separated relative path;
/// directories end in `/` and have empty contents
pub fn snapshot(root: &Path) -> BTreeMap<String, Vec<u8>> {
    let mut tree = BTreeMap::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        for entry in std::fs::read_dir(&dir).unwrap() {
            let entry = entry.unwrap();
            let relative = entry
                .path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/");
            if entry.file_type().unwrap().is_dir() {
                tree.insert(format!("{}/", relative), Vec::new());
                pending.push(entry.path());
            } else {
                tree.insert(relative, std::fs::read(entry.path()).unwrap());
            }
        }
    }
    tree
}
