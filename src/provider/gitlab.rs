//! # GitLab Provider
//!
//! GitLab REST API v4 (gitlab.com and self-managed instances).
//!
//! Projects are addressed by their URL-encoded full path, so nested groups
//! work without an extra id lookup. The commits API accepts several file
//! actions in one request, which keeps a manifest sync atomic.

use super::common::{decode_content, encode_segment, AuthScheme, ProviderHandle};
use super::{Capabilities, DeployKey, GitProvider, NewDeployKey, RemoteFile, RepositoryRef};
use crate::config::{BootstrapConfig, ProviderKind, RepositorySpec, Visibility};
use crate::error::{Error, Result};
use crate::manifests::CommitIntent;
use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info_span, Instrument};
use zeroize::Zeroizing;

const DEFAULT_API_URL: &str = "https://gitlab.com/api/v4";

#[derive(Debug, Deserialize)]
struct GlNamespace {
    id: u64,
    #[serde(default)]
    full_path: String,
}

#[derive(Debug, Deserialize)]
struct GlProject {
    path: String,
    namespace: GlNamespace,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    visibility: Option<String>,
    #[serde(default)]
    ssh_url_to_repo: Option<String>,
    #[serde(default)]
    http_url_to_repo: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GlDeployKey {
    id: u64,
    #[serde(default)]
    title: String,
    key: String,
    #[serde(default)]
    can_push: bool,
}

#[derive(Debug, Deserialize)]
struct GlFile {
    content: String,
    #[serde(default)]
    blob_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GlCommit {
    id: String,
}

/// GitLab backend
#[derive(Debug)]
pub struct GitLabProvider {
    handle: ProviderHandle,
}

impl GitLabProvider {
    /// Create a client for `endpoint`
    ///
    /// Accepts either the instance URL or the API URL; `/api/v4` is appended
    /// when missing.
    pub fn new(
        endpoint: Option<&str>,
        token: Zeroizing<String>,
        config: &BootstrapConfig,
    ) -> Result<Self> {
        let base_url = match endpoint {
            Some(url) => {
                let trimmed = url.trim_end_matches('/');
                if trimmed.ends_with("/api/v4") {
                    trimmed.to_string()
                } else {
                    format!("{trimmed}/api/v4")
                }
            }
            None => DEFAULT_API_URL.to_string(),
        };
        Ok(Self {
            handle: ProviderHandle::new(
                ProviderKind::Gitlab,
                &base_url,
                token,
                AuthScheme::PrivateToken,
                config,
            )?,
        })
    }

    fn project_path(owner: &str, name: &str) -> String {
        format!("/projects/{}", encode_segment(&format!("{owner}/{name}")))
    }

    async fn branch_exists(&self, project: &str, branch: &str) -> Result<bool> {
        let path = format!("{project}/repository/branches/{}", encode_segment(branch));
        Ok(self
            .handle
            .send_optional("get_branch", self.handle.request(Method::GET, &path))
            .await?
            .is_some())
    }
}

impl From<GlProject> for RepositoryRef {
    fn from(project: GlProject) -> Self {
        let visibility = match project.visibility.as_deref() {
            Some("public") => Visibility::Public,
            Some("internal") => Visibility::Internal,
            _ => Visibility::Private,
        };
        RepositoryRef {
            owner: project.namespace.full_path,
            name: project.path,
            default_branch: project
                .default_branch
                .unwrap_or_else(|| crate::constants::DEFAULT_BRANCH.to_string()),
            visibility: Some(visibility),
            exists: true,
            clone_url: project.ssh_url_to_repo,
            http_url: project.http_url_to_repo,
        }
    }
}

#[async_trait]
impl GitProvider for GitLabProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Gitlab
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            deploy_keys: true,
            server_side_commit: true,
            create_repository: true,
        }
    }

    async fn get_repository(&self, owner: &str, name: &str) -> Result<Option<RepositoryRef>> {
        let path = Self::project_path(owner, name);
        let project: Option<GlProject> = self
            .handle
            .send_optional_json("get_repository", self.handle.request(Method::GET, &path))
            .instrument(info_span!("gitlab.project.get", repository.owner = owner, repository.name = name))
            .await?;
        Ok(project.map(RepositoryRef::from))
    }

    async fn create_repository(&self, spec: &RepositorySpec) -> Result<RepositoryRef> {
        let span = info_span!("gitlab.project.create", repository.owner = %spec.owner, repository.name = %spec.name);

        async move {
            let mut body = json!({
                "name": spec.name,
                "path": spec.name,
                "visibility": spec.visibility.as_str(),
                "initialize_with_readme": true,
            });

            if !spec.personal {
                let path = format!("/namespaces/{}", encode_segment(&spec.owner));
                let namespace: GlNamespace = self
                    .handle
                    .send_optional_json("get_namespace", self.handle.request(Method::GET, &path))
                    .await?
                    .ok_or_else(|| {
                        Error::config(format!("GitLab group '{}' does not exist", spec.owner))
                    })?;
                debug!(namespace_id = namespace.id, "Resolved GitLab namespace");
                body["namespace_id"] = json!(namespace.id);
            }

            let project: GlProject = self
                .handle
                .send_json(
                    "create_repository",
                    self.handle.request(Method::POST, "/projects").json(&body),
                )
                .await?;
            Ok(project.into())
        }
        .instrument(span)
        .await
    }

    async fn list_deploy_keys(&self, repo: &RepositoryRef) -> Result<Vec<DeployKey>> {
        let path = format!(
            "{}/deploy_keys?per_page=100",
            Self::project_path(&repo.owner, &repo.name)
        );
        let keys: Vec<GlDeployKey> = self
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
                read_only: !k.can_push,
            })
            .collect())
    }

    async fn add_deploy_key(&self, repo: &RepositoryRef, key: &NewDeployKey) -> Result<String> {
        let path = format!(
            "{}/deploy_keys",
            Self::project_path(&repo.owner, &repo.name)
        );
        let body = json!({
            "title": key.title,
            "key": key.key,
            "can_push": !key.read_only,
        });
        let created: GlDeployKey = self
            .handle
            .send_json(
                "add_deploy_key",
                self.handle.request(Method::POST, &path).json(&body),
            )
            .await?;
        Ok(created.id.to_string())
    }

    async fn delete_deploy_key(&self, repo: &RepositoryRef, key_id: &str) -> Result<()> {
        let path = format!(
            "{}/deploy_keys/{key_id}",
            Self::project_path(&repo.owner, &repo.name)
        );
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
        let project = Self::project_path(&repo.owner, &repo.name);
        let mut files = BTreeMap::new();
        for file_path in paths {
            let path = format!("{project}/repository/files/{}", encode_segment(file_path));
            let request = self
                .handle
                .request(Method::GET, &path)
                .query(&[("ref", branch)]);
            if let Some(file) = self
                .handle
                .send_optional_json::<GlFile>("read_file", request)
                .await?
            {
                files.insert(
                    file_path.clone(),
                    RemoteFile {
                        content: decode_content(&file.content)?,
                        revision: file.blob_id,
                    },
                );
            }
        }
        Ok(files)
    }

    async fn create_commit(&self, repo: &RepositoryRef, intent: &CommitIntent) -> Result<String> {
        let project = Self::project_path(&repo.owner, &repo.name);
        let span = info_span!(
            "gitlab.commit.create",
            repository = %repo.full_name(),
            branch = %intent.branch,
            files = intent.changes.len()
        );

        async move {
            let actions: Vec<serde_json::Value> = intent
                .changes
                .iter()
                .map(|change| {
                    json!({
                        "action": change.action.as_str(),
                        "file_path": change.path,
                        "content": change.content,
                    })
                })
                .collect();

            let mut body = json!({
                "branch": intent.branch,
                "commit_message": intent.message,
                "author_name": intent.author.name,
                "author_email": intent.author.email,
                "actions": actions,
            });
            if intent.branch != repo.default_branch
                && !self.branch_exists(&project, &intent.branch).await?
            {
                body["start_branch"] = json!(repo.default_branch);
            }

            let commit: GlCommit = self
                .handle
                .send_json(
                    "create_commit",
                    self.handle
                        .request(Method::POST, &format!("{project}/repository/commits"))
                        .json(&body),
                )
                .await?;
            Ok(commit.id)
        }
        .instrument(span)
        .await
    }
}
