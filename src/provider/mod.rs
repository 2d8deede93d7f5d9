//! # Provider Modules
//!
//! Git hosting backends.
//!
//! Each backend implements the primitive operations of [`GitProvider`]
//! (repository lookup and creation, deploy keys, file reads, atomic commits).
//! The idempotent contract operations (`ensure_repository`,
//! `register_deploy_key`, `commit_files`) are default methods shared by every
//! backend, so the reuse rules are written once.

use crate::config::{
    BootstrapConfig, BootstrapRequest, CommitAuthor, ProviderKind, RepositorySpec, Visibility,
};
use crate::credentials::keys::public_key_fingerprint;
use crate::error::{Error, Result};
use crate::manifests::{CommitIntent, CommitResult, ManifestFile};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

// Common utilities shared across providers
pub mod common;

// Provider implementations
pub mod gitea;
pub mod github;
pub mod gitlab;
pub mod server;

pub use common::{ProviderHandle, RateLimitState};
pub use gitea::GiteaProvider;
pub use github::GitHubProvider;
pub use gitlab::GitLabProvider;
pub use server::ServerProvider;

/// What a backend can do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Per-repository deploy keys can be managed through the API
    pub deploy_keys: bool,
    /// Commits can be created without a local clone
    pub server_side_commit: bool,
    /// Repositories can be created through the API
    pub create_repository: bool,
}

/// A repository as seen on the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryRef {
    pub owner: String,
    pub name: String,
    pub default_branch: String,
    /// `None` when the backend cannot report it (plain Git server)
    pub visibility: Option<Visibility>,
    pub exists: bool,
    /// SSH clone URL
    pub clone_url: Option<String>,
    /// HTTPS clone URL
    pub http_url: Option<String>,
}

impl RepositoryRef {
    /// `owner/name`
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }

    /// Placeholder for a repository that a dry run would create
    #[must_use]
    pub fn planned(spec: &RepositorySpec) -> Self {
        Self {
            owner: spec.owner.clone(),
            name: spec.name.clone(),
            default_branch: spec.branch.clone(),
            visibility: Some(spec.visibility),
            exists: false,
            clone_url: None,
            http_url: None,
        }
    }
}

/// A deploy key registered with the provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployKey {
    pub id: String,
    pub title: String,
    /// OpenSSH public key, `<algorithm> <base64> [comment]`
    pub key: String,
    pub read_only: bool,
}

impl DeployKey {
    /// SHA-256 fingerprint, `None` if the provider returned an unparseable key
    #[must_use]
    pub fn fingerprint(&self) -> Option<String> {
        public_key_fingerprint(&self.key).ok()
    }
}

/// Deploy key to register
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDeployKey {
    pub title: String,
    pub key: String,
    pub read_only: bool,
}

/// Content of a file at the tip of a branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub content: String,
    /// Blob sha, required by some backends to update the file
    pub revision: Option<String>,
}

/// Git hosting backend
///
/// Object safe; callers hold an `Arc<dyn GitProvider>`. Implementations keep
/// no local state between calls.
#[async_trait]
pub trait GitProvider: Send + Sync + Debug {
    fn kind(&self) -> ProviderKind;

    fn capabilities(&self) -> Capabilities;

    /// Look up a repository, `None` when it does not exist
    async fn get_repository(&self, owner: &str, name: &str) -> Result<Option<RepositoryRef>>;

    async fn create_repository(&self, spec: &RepositorySpec) -> Result<RepositoryRef>;

    async fn list_deploy_keys(&self, repo: &RepositoryRef) -> Result<Vec<DeployKey>>;

    /// Register a key and return its provider id
    async fn add_deploy_key(&self, repo: &RepositoryRef, key: &NewDeployKey) -> Result<String>;

    /// Remove a key; removing a key that is already gone succeeds
    async fn delete_deploy_key(&self, repo: &RepositoryRef, key_id: &str) -> Result<()>;

    /// Read the given paths at the tip of `branch`
    ///
    /// Missing paths (or a missing branch) are simply absent from the result.
    async fn read_files(
        &self,
        repo: &RepositoryRef,
        branch: &str,
        paths: &[String],
    ) -> Result<BTreeMap<String, RemoteFile>>;

    /// Create one atomic commit with every change of the intent, returning its sha
    async fn create_commit(&self, repo: &RepositoryRef, intent: &CommitIntent) -> Result<String>;

    /// Make sure the repository exists with the requested visibility
    ///
    /// Returns the repository and whether it was created by this call.
    async fn ensure_repository(&self, spec: &RepositorySpec) -> Result<(RepositoryRef, bool)> {
        if let Some(repo) = self.get_repository(&spec.owner, &spec.name).await? {
            check_visibility(&repo, spec)?;
            debug!(repository = %repo.full_name(), "Repository already exists");
            return Ok((repo, false));
        }

        if !self.capabilities().create_repository {
            return Err(Error::config(format!(
                "repository {} does not exist and {} cannot create it",
                spec.full_name(),
                self.kind()
            )));
        }

        let repo = self.create_repository(spec).await?;
        info!(repository = %repo.full_name(), visibility = spec.visibility.as_str(), "Created repository");
        Ok((repo, true))
    }

    /// Register `key`, reusing a registration with the same fingerprint
    async fn register_deploy_key(&self, repo: &RepositoryRef, key: &NewDeployKey) -> Result<String> {
        let fingerprint = public_key_fingerprint(&key.key)?;
        let existing = self.list_deploy_keys(repo).await?;

        if let Some(found) = existing
            .iter()
            .find(|k| k.fingerprint().as_deref() == Some(fingerprint.as_str()))
        {
            debug!(key_id = %found.id, %fingerprint, "Deploy key already registered");
            return Ok(found.id.clone());
        }

        let id = self.add_deploy_key(repo, key).await?;
        info!(key_id = %id, title = %key.title, %fingerprint, "Registered deploy key");
        Ok(id)
    }

    /// Remove keys titled `title` other than `keep_id`, returning how many were removed
    async fn remove_superseded_keys(
        &self,
        repo: &RepositoryRef,
        title: &str,
        keep_id: &str,
    ) -> Result<usize> {
        let mut removed = 0;
        for key in self.list_deploy_keys(repo).await? {
            if key.title == title && key.id != keep_id {
                self.delete_deploy_key(repo, &key.id).await?;
                warn!(key_id = %key.id, %title, "Removed superseded deploy key");
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Commit the files whose content differs from the tip of `branch`
    ///
    /// Nothing is written when every file already matches.
    async fn commit_files(
        &self,
        repo: &RepositoryRef,
        branch: &str,
        files: &[ManifestFile],
        author: &CommitAuthor,
        message: &str,
    ) -> Result<CommitResult> {
        let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
        let remote = self.read_files(repo, branch, &paths).await?;
        let intent = CommitIntent::diff(branch, author, message, files, &remote);

        if intent.is_empty() {
            return Ok(CommitResult::skipped());
        }

        let sha = self.create_commit(repo, &intent).await?;
        Ok(CommitResult::committed(sha, intent.paths()))
    }
}

/// `Conflict` when an existing repository's visibility differs from the request
///
/// Backends that cannot report visibility always pass.
pub fn check_visibility(repo: &RepositoryRef, spec: &RepositorySpec) -> Result<()> {
    match repo.visibility {
        Some(visibility) if visibility != spec.visibility => Err(Error::Conflict(format!(
            "repository {} is {} but {} was requested",
            repo.full_name(),
            visibility.as_str(),
            spec.visibility.as_str()
        ))),
        _ => Ok(()),
    }
}

/// Pick the backend named by the request
pub fn create_provider(
    request: &BootstrapRequest,
    config: &BootstrapConfig,
    token: Option<Zeroizing<String>>,
) -> Result<Arc<dyn GitProvider>> {
    let endpoint = request.endpoint.as_deref();
    let require_token = || {
        token.clone().ok_or_else(|| {
            Error::config(format!("a {} token is required", request.provider))
        })
    };

    let provider: Arc<dyn GitProvider> = match request.provider {
        ProviderKind::Github => Arc::new(GitHubProvider::new(endpoint, require_token()?, config)?),
        ProviderKind::Gitlab => Arc::new(GitLabProvider::new(endpoint, require_token()?, config)?),
        ProviderKind::Gitea => Arc::new(GiteaProvider::new(endpoint, require_token()?, config)?),
        ProviderKind::Server => {
            let url = endpoint.ok_or_else(|| {
                Error::config("a plain Git server requires the repository URL as endpoint")
            })?;
            Arc::new(ServerProvider::with_git_cli(url, token.clone()))
        }
    };

    Ok(provider)
}
