//! # Generic Git Server Provider
//!
//! Any repository reachable with `git` over SSH or HTTPS. There is no
//! management API: the repository must already exist and deploy keys have to
//! be authorised out of band.

use super::{Capabilities, DeployKey, GitProvider, NewDeployKey, RemoteFile, RepositoryRef};
use crate::config::{ProviderKind, RepositorySpec};
use crate::constants::DEFAULT_BRANCH;
use crate::error::{Error, Result};
use crate::git::{GitCli, GitPlumbing};
use crate::manifests::CommitIntent;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use zeroize::Zeroizing;

/// Plain Git server backend
#[derive(Debug)]
pub struct ServerProvider {
    url: String,
    plumbing: Arc<dyn GitPlumbing>,
}

impl ServerProvider {
    #[must_use]
    pub fn new(url: impl Into<String>, plumbing: Arc<dyn GitPlumbing>) -> Self {
        Self {
            url: url.into(),
            plumbing,
        }
    }

    /// Use the `git` binary, with HTTPS basic auth when a token is given
    #[must_use]
    pub fn with_git_cli(url: &str, token: Option<Zeroizing<String>>) -> Self {
        let cli = match token {
            Some(token) => GitCli::with_token("git", &token),
            None => GitCli::new(),
        };
        Self::new(url, Arc::new(cli))
    }

    fn unsupported(operation: &'static str) -> Error {
        Error::Unsupported {
            provider: ProviderKind::Server.as_str(),
            operation,
        }
    }
}

#[async_trait]
impl GitProvider for ServerProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Server
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            deploy_keys: false,
            server_side_commit: false,
            create_repository: false,
        }
    }

    async fn get_repository(&self, owner: &str, name: &str) -> Result<Option<RepositoryRef>> {
        let Some(heads) = self.plumbing.ls_remote(&self.url).await? else {
            return Ok(None);
        };
        debug!(url = %self.url, branches = heads.branches.len(), "Repository reachable");

        Ok(Some(RepositoryRef {
            owner: owner.to_string(),
            name: name.to_string(),
            default_branch: heads
                .default_branch
                .unwrap_or_else(|| DEFAULT_BRANCH.to_string()),
            visibility: None,
            exists: true,
            clone_url: Some(self.url.clone()),
            http_url: Some(self.url.clone()),
        }))
    }

    async fn create_repository(&self, _spec: &RepositorySpec) -> Result<RepositoryRef> {
        Err(Self::unsupported("create_repository"))
    }

    async fn list_deploy_keys(&self, _repo: &RepositoryRef) -> Result<Vec<DeployKey>> {
        Err(Self::unsupported("deploy keys"))
    }

    async fn add_deploy_key(&self, _repo: &RepositoryRef, _key: &NewDeployKey) -> Result<String> {
        Err(Self::unsupported("deploy keys"))
    }

    async fn delete_deploy_key(&self, _repo: &RepositoryRef, _key_id: &str) -> Result<()> {
        Err(Self::unsupported("deploy keys"))
    }

    async fn read_files(
        &self,
        _repo: &RepositoryRef,
        branch: &str,
        paths: &[String],
    ) -> Result<BTreeMap<String, RemoteFile>> {
        self.plumbing.read_files(&self.url, branch, paths).await
    }

    async fn create_commit(&self, repo: &RepositoryRef, intent: &CommitIntent) -> Result<String> {
        self.plumbing
            .commit_and_push(&self.url, intent, &repo.default_branch)
            .await
    }
}
