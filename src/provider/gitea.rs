//! # Gitea Provider
//!
//! Gitea REST API v1. Multi-file commits use the `POST /contents` endpoint
//! (Gitea 1.20+), which needs the current blob sha of every updated file.

use super::common::{decode_content, AuthScheme, ProviderHandle};
use super::{Capabilities, DeployKey, GitProvider, NewDeployKey, RemoteFile, RepositoryRef};
use crate::config::{BootstrapConfig, ProviderKind, RepositorySpec, Visibility};
use crate::error::{Error, Result};
use crate::manifests::{CommitIntent, FileAction};
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{info_span, Instrument};
use zeroize::Zeroizing;

const DEFAULT_API_URL: &str = "https://gitea.com/api/v1";

#[derive(Debug, Deserialize)]
struct GtOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GtRepository {
    name: String,
    owner: GtOwner,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    internal: bool,
    #[serde(default)]
    ssh_url: Option<String>,
    #[serde(default)]
    clone_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GtDeployKey {
    id: u64,
    key: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    read_only: bool,
}

#[derive(Debug, Deserialize)]
struct GtContent {
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct GtCommitRef {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GtFilesResponse {
    commit: GtCommitRef,
}

/// Gitea backend
#[derive(Debug)]
pub struct GiteaProvider {
    handle: ProviderHandle,
}

impl GiteaProvider {
    /// Create a client for `endpoint`, appending `/api/v1` when missing
    pub fn new(
        endpoint: Option<&str>,
        token: Zeroizing<String>,
        config: &BootstrapConfig,
    ) -> Result<Self> {
        let base_url = match endpoint {
            Some(url) => {
                let trimmed = url.trim_end_matches('/');
                if trimmed.ends_with("/api/v1") {
                    trimmed.to_string()
                } else {
                    format!("{trimmed}/api/v1")
                }
            }
            None => DEFAULT_API_URL.to_string(),
        };
        Ok(Self {
            handle: ProviderHandle::new(
                ProviderKind::Gitea,
                &base_url,
                token,
                AuthScheme::Token,
                config,
            )?,
        })
    }

    fn repo_path(repo: &RepositoryRef) -> String {
        format!("/repos/{}/{}", repo.owner, repo.name)
    }

    async fn branch_exists(&self, repo: &RepositoryRef, branch: &str) -> Result<bool> {
        let path = format!("{}/branches/{branch}", Self::repo_path(repo));
        Ok(self
            .handle
            .send_optional("get_branch", self.handle.request(Method::GET, &path))
            .await?
            .is_some())
    }
}

impl From<GtRepository> for RepositoryRef {
    fn from(repo: GtRepository) -> Self {
        let visibility = if repo.internal {
            Visibility::Internal
        } else if repo.private {
            Visibility::Private
        } else {
            Visibility::Public
        };
        RepositoryRef {
            owner: repo.owner.login,
            name: repo.name,
            default_branch: repo
                .default_branch
                .filter(|b| !b.is_empty())
                .unwrap_or_else(|| crate::constants::DEFAULT_BRANCH.to_string()),
            visibility: Some(visibility),
            exists: true,
            clone_url: repo.ssh_url,
            http_url: repo.clone_url,
        }
    }
}

#[async_trait]
impl GitProvider for GiteaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gitea
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            deploy_keys: true,
            server_side_commit: true,
            create_repository: true,
        }
    }

    async fn get_repository(&self, owner: &str, name: &str) -> Result<Option<RepositoryRef>> {
        let path = format!("/repos/{owner}/{name}");
        let repo: Option<GtRepository> = self
            .handle
            .send_optional_json("get_repository", self.handle.request(Method::GET, &path))
            .await?;
        Ok(repo.map(RepositoryRef::from))
    }

    async fn create_repository(&self, spec: &RepositorySpec) -> Result<RepositoryRef> {
        if spec.visibility == Visibility::Internal && spec.personal {
            return Err(Error::config(
                "Gitea only supports internal visibility for organization repositories",
            ));
        }

        let path = if spec.personal {
            "/user/repos".to_string()
        } else {
            format!("/orgs/{}/repos", spec.owner)
        };
        let body = json!({
            "name": spec.name,
            "private": spec.visibility != Visibility::Public,
            "internal": spec.visibility == Visibility::Internal,
            "auto_init": true,
            "default_branch": spec.branch,
        });

        let repo: GtRepository = self
            .handle
            .send_json(
                "create_repository",
                self.handle.request(Method::POST, &path).json(&body),
            )
            .instrument(info_span!("gitea.repository.create", repository.owner = %spec.owner, repository.name = %spec.name))
            .await?;
        Ok(repo.into())
    }

    async fn list_deploy_keys(&self, repo: &RepositoryRef) -> Result<Vec<DeployKey>> {
        let path = format!("{}/keys?limit=50", Self::repo_path(repo));
        let keys: Vec<GtDeployKey> = self
            .handle
            .send_json_paged("list_deploy_keys", &path, |page| {
                self.handle.request(Method::GET, page)
            })
            .await?;
        Ok(keys
            .into_iter()
            .map(|k| DeployKey {
                id: k.id.to_string(),
                title: k.title,
                key: k.key,
                read_only: k.read_only,
            })
            .collect())
    }

    async fn add_deploy_key(&self, repo: &RepositoryRef, key: &NewDeployKey) -> Result<String> {
        let path = format!("{}/keys", Self::repo_path(repo));
        let body = json!({
            "title": key.title,
            "key": key.key,
            "read_only": key.read_only,
        });
        let created: GtDeployKey = self
            .handle
            .send_json(
                "add_deploy_key",
                self.handle.request(Method::POST, &path).json(&body),
            )
            .await?;
        Ok(created.id.to_string())
    }

    async fn delete_deploy_key(&self, repo: &RepositoryRef, key_id: &str) -> Result<()> {
        let path = format!("{}/keys/{key_id}", Self::repo_path(repo));
        self.handle
            .send_optional("delete_deploy_key", self.handle.request(Method::DELETE, &path))
            .await?;
        Ok(())
    }

    async fn read_files(
        &self,
        repo: &RepositoryRef,
        branch: &str,
        paths: &[String],
    ) -> Result<BTreeMap<String, RemoteFile>> {
        let mut files = BTreeMap::new();
        for file_path in paths {
            let path = format!("{}/contents/{file_path}", Self::repo_path(repo));
            let request = self
                .handle
                .request(Method::GET, &path)
                .query(&[("ref", branch)]);
            let Some(content) = self
                .handle
                .send_optional_json::<GtContent>("read_file", request)
                .await?
            else {
                continue;
            };
            if content.kind != "file" {
                continue;
            }
            files.insert(
                file_path.clone(),
                RemoteFile {
                    content: decode_content(content.content.as_deref().unwrap_or_default())?,
                    revision: Some(content.sha),
                },
            );
        }
        Ok(files)
    }

    async fn create_commit(&self, repo: &RepositoryRef, intent: &CommitIntent) -> Result<String> {
        let span = info_span!(
            "gitea.commit.create",
            repository = %repo.full_name(),
            branch = %intent.branch,
            files = intent.changes.len()
        );

        async move {
            let mut files = Vec::with_capacity(intent.changes.len());
            for change in &intent.changes {
                let mut file = json!({
                    "operation": change.action.as_str(),
                    "path": change.path,
                    "content": general_purpose::STANDARD.encode(change.content.as_bytes()),
                });
                if change.action == FileAction::Update {
                    let sha = change.previous_revision.as_deref().ok_or_else(|| {
                        Error::Internal(anyhow::anyhow!(
                            "missing blob sha for updated file {}",
                            change.path
                        ))
                    })?;
                    file["sha"] = json!(sha);
                }
                files.push(file);
            }

            let mut body = json!({
                "branch": intent.branch,
                "message": intent.message,
                "author": { "name": intent.author.name, "email": intent.author.email },
                "files": files,
            });
            if intent.branch != repo.default_branch
                && !self.branch_exists(repo, &intent.branch).await?
            {
                body["branch"] = json!(repo.default_branch);
                body["new_branch"] = json!(intent.branch);
            }

            let response: GtFilesResponse = self
                .handle
                .send_json(
                    "create_commit",
                    self.handle
                        .request(Method::POST, &format!("{}/contents", Self::repo_path(repo)))
                        .json(&body),
                )
                .await?;
            Ok(response.commit.sha)
        }
        .instrument(span)
        .await
    }
}
