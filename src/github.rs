use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::{header, Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{split_identifier, GitHubConfig, RepoConfig};
use crate::error::{Result, SyncError};

const USER_AGENT: &str = concat!("repomirror/", env!("CARGO_PKG_VERSION"));
const ACCEPT_JSON: &str = "application/vnd.github+json";
const ACCEPT_RAW: &str = "application/vnd.github.raw";

/// Credentials for one repository, taken from its own record
#[derive(Clone, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub token: Option<String>,
}

impl Credentials {
    pub fn anonymous() -> Self {
        Self::default()
    }

    fn token(&self) -> Option<&str> {
        self.token.as_deref().filter(|t| !t.is_empty())
    }
}

impl From<&RepoConfig> for Credentials {
    fn from(config: &RepoConfig) -> Self {
        Self {
            username: config.username.clone(),
            token: config.token.clone(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Kind of a node in a remote directory listing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum EntryKind {
    #[serde(rename = "file")]
    File,
    #[serde(rename = "dir")]
    Directory,
    /// Symlinks, submodules and anything else the mirror does not materialize
    #[serde(other)]
    Unsupported,
}

/// One node in a remote directory listing
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub path: String,
    /// Contents API URL for this node (lists a directory, describes a file)
    #[serde(rename = "url")]
    pub content_url: String,
    /// Raw download URL, absent for directories
    #[serde(default)]
    pub download_url: Option<String>,
}

impl RemoteEntry {
    /// URL that yields the raw bytes of a file entry
    pub fn raw_url(&self) -> &str {
        self.download_url.as_deref().unwrap_or(&self.content_url)
    }
}

/// Read access to a remote repository tree
#[async_trait]
pub trait RemoteContents: Send + Sync {
    /// URL of the repository root listing on `branch`
    fn contents_url(&self, identifier: &str, branch: &str) -> Result<String>;

    /// List one remote directory
    async fn list_directory(&self, url: &str, credentials: &Credentials) -> Result<Vec<RemoteEntry>>;

    /// Fetch the raw bytes of one remote file
    async fn fetch_file(&self, url: &str, credentials: &Credentials) -> Result<Vec<u8>>;
}

/// Result of a single-file push
#[derive(Debug, Clone)]
pub struct PushOutcome {
    pub path: String,
    pub commit_sha: Option<String>,
    /// The file did not exist on the branch before
    pub created: bool,
}

#[derive(Deserialize)]
struct RepoMetadata {
    default_branch: Option<String>,
}

#[derive(Deserialize)]
struct ExistingFile {
    sha: String,
}

#[derive(Serialize)]
struct PutRequest<'a> {
    message: &'a str,
    content: String,
    branch: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    sha: Option<String>,
}

#[derive(Deserialize)]
struct PutResponse {
    commit: Option<CommitRef>,
}

#[derive(Deserialize)]
struct CommitRef {
    sha: String,
}

/// GitHub contents API client
#[derive(Clone)]
pub struct GitHubClient {
    http: Client,
    api_base: Url,
    write_timeout: Duration,
}

impl GitHubClient {
    /// Create a client for the configured API endpoint
    pub fn new(config: &GitHubConfig) -> Result<Self> {
        let api_base = Url::parse(&config.api_base)
            .map_err(|e| SyncError::config(format!("Invalid api_base {}: {}", config.api_base, e)))?;
        if api_base.cannot_be_a_base() {
            return Err(SyncError::config(format!("Invalid api_base: {}", config.api_base)));
        }

        let mut builder = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(30));
        if let Some(secs) = config.read_timeout {
            builder = builder.timeout(Duration::from_secs(secs));
        }
        let http = builder
            .build()
            .map_err(|e| SyncError::config(format!("Failed to create HTTP client: {}", e)))?;

        debug!("GitHub client ready for {}", api_base);

        Ok(Self {
            http,
            api_base,
            write_timeout: Duration::from_secs(config.write_timeout),
        })
    }

    /// `{api_base}/repos/{owner}/{repo}` followed by `extra` path segments
    fn repo_url<'a>(
        &self,
        identifier: &str,
        extra: impl IntoIterator<Item = &'a str>,
    ) -> Result<Url> {
        let (owner, name) = split_identifier(identifier)?;
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::config(format!("Invalid api_base: {}", self.api_base)))?
            .pop_if_empty()
            .extend(["repos", owner, name])
            .extend(extra);
        Ok(url)
    }

    fn authorize(&self, request: RequestBuilder, credentials: &Credentials) -> RequestBuilder {
        match credentials.token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get(&self, url: &str, accept: &str, credentials: &Credentials) -> Result<Response> {
        let request = self.http.get(url).header(header::ACCEPT, accept);
        let response = self
            .authorize(request, credentials)
            .send()
            .await
            .map_err(|e| SyncError::network(url, e))?;

        if !response.status().is_success() {
            return Err(SyncError::network(url, format!("HTTP {}", response.status())));
        }
        Ok(response)
    }

    /// Ask the API for the repository's default branch
    pub async fn default_branch(&self, identifier: &str, credentials: &Credentials) -> Result<String> {
        let url = self.repo_url(identifier, std::iter::empty())?;
        let metadata: RepoMetadata = self
            .get(url.as_str(), ACCEPT_JSON, credentials)
            .await?
            .json()
            .await
            .map_err(|e| SyncError::network(url.as_str(), e))?;

        metadata
            .default_branch
            .filter(|b| !b.is_empty())
            .ok_or_else(|| SyncError::network(url.as_str(), "response has no default_branch"))
    }

    /// Create or replace one file on `branch`
    ///
    /// Looks up the current blob sha first so an existing file is updated
    /// rather than rejected. The PUT itself is bounded by `write_timeout`.
    pub async fn put_file(
        &self,
        identifier: &str,
        branch: &str,
        path: &str,
        content: &[u8],
        message: &str,
        credentials: &Credentials,
    ) -> Result<PushOutcome> {
        if credentials.token().is_none() {
            return Err(SyncError::config("Pushing requires a token. Run: repomirror config token <token>"));
        }

        let path = path.trim_matches('/');
        let mut url = self.repo_url(identifier, std::iter::once("contents").chain(path.split('/')))?;
        url.query_pairs_mut().append_pair("ref", branch);

        let sha = self.existing_sha(url.as_str(), credentials).await?;
        let created = sha.is_none();

        let body = PutRequest {
            message,
            content: STANDARD.encode(content),
            branch,
            sha,
        };

        debug!("Pushing {} bytes to {}:{}", content.len(), identifier, path);
        let request = self
            .authorize(self.http.put(url.as_str()), credentials)
            .header(header::ACCEPT, ACCEPT_JSON)
            .json(&body);

        let exchange = async {
            let response = request.send().await.map_err(|e| SyncError::network(url.as_str(), e))?;
            if !response.status().is_success() {
                return Err(SyncError::network(url.as_str(), format!("HTTP {}", response.status())));
            }
            let parsed: PutResponse = response
                .json()
                .await
                .map_err(|e| SyncError::network(url.as_str(), e))?;
            Ok::<_, SyncError>(parsed)
        };

        let response = tokio::time::timeout(self.write_timeout, exchange)
            .await
            .map_err(|_| {
                SyncError::network(
                    url.as_str(),
                    format!("timed out after {}s", self.write_timeout.as_secs()),
                )
            })??;

        info!("Pushed {} to {} ({})", path, identifier, branch);
        Ok(PushOutcome {
            path: path.to_string(),
            commit_sha: response.commit.map(|c| c.sha),
            created,
        })
    }

    async fn existing_sha(&self, url: &str, credentials: &Credentials) -> Result<Option<String>> {
        let request = self.http.get(url).header(header::ACCEPT, ACCEPT_JSON);
        let response = self
            .authorize(request, credentials)
            .send()
            .await
            .map_err(|e| SyncError::network(url, e))?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let existing: ExistingFile =
                    response.json().await.map_err(|e| SyncError::network(url, e))?;
                Ok(Some(existing.sha))
            }
            status => Err(SyncError::network(url, format!("HTTP {}", status))),
        }
    }
}

#[async_trait]
impl RemoteContents for GitHubClient {
    fn contents_url(&self, identifier: &str, branch: &str) -> Result<String> {
        let mut url = self.repo_url(identifier, ["contents"])?;
        url.query_pairs_mut().append_pair("ref", branch);
        Ok(url.into())
    }

    async fn list_directory(&self, url: &str, credentials: &Credentials) -> Result<Vec<RemoteEntry>> {
        debug!("Listing {}", url);
        self.get(url, ACCEPT_JSON, credentials)
            .await?
            .json::<Vec<RemoteEntry>>()
            .await
            .map_err(|e| SyncError::network(url, format!("unexpected listing payload: {}", e)))
    }

    async fn fetch_file(&self, url: &str, credentials: &Credentials) -> Result<Vec<u8>> {
        let bytes = self
            .get(url, ACCEPT_RAW, credentials)
            .await?
            .bytes()
            .await
            .map_err(|e| SyncError::network(url, e))?;
        Ok(bytes.to_vec())
    }
}
