//! # GitHub Provider
//!
//! GitHub REST API v3 (github.com and GitHub Enterprise Server).
//!
//! Commits go through the Git data API (ref, tree, commit, ref update) so a
//! multi-file change lands as one commit without a local clone.
//!
//! References:
//! - [Repositories](https://docs.github.com/en/rest/repos/repos)
//! - [Deploy keys](https://docs.github.com/en/rest/deploy-keys/deploy-keys)
//! - [Git database](https://docs.github.com/en/rest/git)

use super::common::{decode_content, AuthScheme, ProviderHandle};
use super::{Capabilities, DeployKey, GitProvider, NewDeployKey, RemoteFile, RepositoryRef};
use crate::config::{BootstrapConfig, ProviderKind, RepositorySpec, Visibility};
use crate::error::{Error, Result};
use crate::manifests::CommitIntent;
use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use tracing::{debug, info_span, Instrument};
use zeroize::Zeroizing;

const DEFAULT_API_URL: &str = "https://api.github.com";

#[derive(Debug, Deserialize)]
struct GhOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GhRepository {
    name: String,
    owner: GhOwner,
    #[serde(default)]
    default_branch: Option<String>,
    #[serde(default)]
    visibility: Option<String>,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    ssh_url: Option<String>,
    #[serde(default)]
    clone_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhDeployKey {
    id: u64,
    key: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    read_only: bool,
}

#[derive(Debug, Deserialize)]
struct GhContent {
    sha: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    encoding: Option<String>,
    #[serde(default)]
    size: u64,
    #[serde(rename = "type")]
    kind: String,
}

impl GhContent {
    /// Files between 1 and 100 MB come back with `encoding: none` and no content
    fn is_inline(&self) -> bool {
        let empty = self.content.as_deref().unwrap_or_default().is_empty();
        self.encoding.as_deref() != Some("none") && !(empty && self.size > 0)
    }
}

#[derive(Debug, Deserialize)]
struct GhBlob {
    content: String,
    #[serde(default)]
    encoding: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GhObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct GhRef {
    object: GhObject,
}

#[derive(Debug, Deserialize)]
struct GhCommit {
    sha: String,
    tree: GhObject,
}

#[derive(Debug, Serialize)]
struct GhTreeEntry<'a> {
    path: &'a str,
    mode: &'static str,
    #[serde(rename = "type")]
    kind: &'static str,
    content: &'a str,
}

/// GitHub backend
#[derive(Debug)]
pub struct GitHubProvider {
    handle: ProviderHandle,
}

impl GitHubProvider {
    /// Create a client for `endpoint` (defaults to api.github.com)
    pub fn new(
        endpoint: Option<&str>,
        token: Zeroizing<String>,
        config: &BootstrapConfig,
    ) -> Result<Self> {
        let base_url = endpoint.unwrap_or(DEFAULT_API_URL);
        Ok(Self {
            handle: ProviderHandle::new(
                ProviderKind::Github,
                base_url,
                token,
                AuthScheme::Bearer,
                config,
            )?,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        self.handle
            .request(method, path)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", "2022-11-28")
    }

    fn repo_path(repo: &RepositoryRef) -> String {
        format!("/repos/{}/{}", repo.owner, repo.name)
    }

    async fn branch_head(&self, repo: &RepositoryRef, branch: &str) -> Result<Option<String>> {
        let path = format!("{}/git/ref/heads/{branch}", Self::repo_path(repo));
        let found: Option<GhRef> = self
            .handle
            .send_optional_json("get_ref", self.request(Method::GET, &path))
            .await?;
        Ok(found.map(|r| r.object.sha))
    }

    async fn read_blob(&self, repo: &RepositoryRef, sha: &str) -> Result<String> {
        let path = format!("{}/git/blobs/{sha}", Self::repo_path(repo));
        let blob: GhBlob = self
            .handle
            .send_json("read_blob", self.request(Method::GET, &path))
            .await?;
        match blob.encoding.as_deref() {
            None | Some("base64") => decode_content(&blob.content),
            Some("utf-8") => Ok(blob.content),
            Some(other) => Err(Error::Internal(anyhow::anyhow!(
                "unexpected blob encoding '{other}' for {sha}"
            ))),
        }
    }
}

impl From<GhRepository> for RepositoryRef {
    fn from(repo: GhRepository) -> Self {
        let visibility = match repo.visibility.as_deref() {
            Some("public") => Visibility::Public,
            Some("internal") => Visibility::Internal,
            Some(_) => Visibility::Private,
            None if repo.private => Visibility::Private,
            None => Visibility::Public,
        };
        RepositoryRef {
            owner: repo.owner.login,
            name: repo.name,
            default_branch: repo
                .default_branch
                .unwrap_or_else(|| crate::constants::DEFAULT_BRANCH.to_string()),
            visibility: Some(visibility),
            exists: true,
            clone_url: repo.ssh_url,
            http_url: repo.clone_url,
        }
    }
}

#[async_trait]
impl GitProvider for GitHubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Github
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
        let repo: Option<GhRepository> = self
            .handle
            .send_optional_json("get_repository", self.request(Method::GET, &path))
            .instrument(info_span!("github.repository.get", repository.owner = owner, repository.name = name))
            .await?;
        Ok(repo.map(RepositoryRef::from))
    }

    async fn create_repository(&self, spec: &RepositorySpec) -> Result<RepositoryRef> {
        let path = if spec.personal {
            "/user/repos".to_string()
        } else {
            format!("/orgs/{}/repos", spec.owner)
        };
        let body = json!({
            "name": spec.name,
            "private": spec.visibility != Visibility::Public,
            "visibility": spec.visibility.as_str(),
            "auto_init": true,
        });

        let repo: GhRepository = self
            .handle
            .send_json("create_repository", self.request(Method::POST, &path).json(&body))
            .instrument(info_span!("github.repository.create", repository.owner = %spec.owner, repository.name = %spec.name))
            .await?;
        Ok(repo.into())
    }

    async fn list_deploy_keys(&self, repo: &RepositoryRef) -> Result<Vec<DeployKey>> {
        let path = format!("{}/keys?per_page=100", Self::repo_path(repo));
        let keys: Vec<GhDeployKey> = self
            .handle
            .send_json_paged("list_deploy_keys", &path, |page| {
                self.request(Method::GET, page)
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
        let created: GhDeployKey = self
            .handle
            .send_json("add_deploy_key", self.request(Method::POST, &path).json(&body))
            .await?;
        Ok(created.id.to_string())
    }

    async fn delete_deploy_key(&self, repo: &RepositoryRef, key_id: &str) -> Result<()> {
        let path = format!("{}/keys/{key_id}", Self::repo_path(repo));
        self.handle
            .send_optional("delete_deploy_key", self.request(Method::DELETE, &path))
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
            let request = self.request(Method::GET, &path).query(&[("ref", branch)]);
            let Some(body) = self
                .handle
                .send_optional_json::<serde_json::Value>("read_file", request)
                .await?
            else {
                continue;
            };
            // A directory answers with a listing of its entries
            if body.is_array() {
                debug!(path = %file_path, "Generated path is a directory");
                continue;
            }
            let content: GhContent = serde_json::from_value(body).map_err(|e| {
                Error::Internal(anyhow::anyhow!("Failed to parse read_file response: {e}"))
            })?;
            if content.kind != "file" {
                debug!(path = %file_path, kind = %content.kind, "Generated path is not a file");
                continue;
            }
            let text = if content.is_inline() {
                decode_content(content.content.as_deref().unwrap_or_default())?
            } else {
                debug!(path = %file_path, size = content.size, "Reading large file as a blob");
                self.read_blob(repo, &content.sha).await?
            };
            files.insert(
                file_path.clone(),
                RemoteFile {
                    content: text,
                    revision: Some(content.sha),
                },
            );
        }
        Ok(files)
    }

    async fn create_commit(&self, repo: &RepositoryRef, intent: &CommitIntent) -> Result<String> {
        let span = info_span!(
            "github.commit.create",
            repository = %repo.full_name(),
            branch = %intent.branch,
            files = intent.changes.len()
        );

        async move {
            let repo_path = Self::repo_path(repo);

            // A new branch starts from the tip of the default branch
            let branch_tip = self.branch_head(repo, &intent.branch).await?;
            let parent = match &branch_tip {
                Some(sha) => Some(sha.clone()),
                None => self.branch_head(repo, &repo.default_branch).await?,
            };

            let base_tree = match &parent {
                Some(sha) => {
                    let commit: GhCommit = self
                        .handle
                        .send_json(
                            "get_commit",
                            self.request(Method::GET, &format!("{repo_path}/git/commits/{sha}")),
                        )
                        .await?;
                    debug!(parent = %commit.sha, "Resolved parent commit");
                    Some(commit.tree.sha)
                }
                None => None,
            };

            let entries: Vec<GhTreeEntry<'_>> = intent
                .changes
                .iter()
                .map(|change| GhTreeEntry {
                    path: &change.path,
                    mode: "100644",
                    kind: "blob",
                    content: &change.content,
                })
                .collect();
            let mut tree_body = json!({ "tree": entries });
            if let Some(base) = &base_tree {
                tree_body["base_tree"] = json!(base);
            }
            let tree: GhObject = self
                .handle
                .send_json(
                    "create_tree",
                    self.request(Method::POST, &format!("{repo_path}/git/trees"))
                        .json(&tree_body),
                )
                .await?;

            let commit_body = json!({
                "message": intent.message,
                "tree": tree.sha,
                "parents": parent.iter().collect::<Vec<_>>(),
                "author": { "name": intent.author.name, "email": intent.author.email },
            });
            let commit: GhObject = self
                .handle
                .send_json(
                    "create_commit",
                    self.request(Method::POST, &format!("{repo_path}/git/commits"))
                        .json(&commit_body),
                )
                .await?;

            if branch_tip.is_some() {
                self.handle
                    .send(
                        "update_ref",
                        self.request(
                            Method::PATCH,
                            &format!("{repo_path}/git/refs/heads/{}", intent.branch),
                        )
                        .json(&json!({ "sha": commit.sha, "force": false })),
                    )
                    .await?;
            } else {
                self.handle
                    .send(
                        "create_ref",
                        self.request(Method::POST, &format!("{repo_path}/git/refs")).json(
                            &json!({ "ref": format!("refs/heads/{}", intent.branch), "sha": commit.sha }),
                        ),
                    )
                    .await?;
            }

            Ok(commit.sha)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gh_repo(visibility: Option<&str>, private: bool) -> GhRepository {
        GhRepository {
            name: "fleet".into(),
            owner: GhOwner {
                login: "acme".into(),
            },
            default_branch: None,
            visibility: visibility.map(str::to_string),
            private,
            ssh_url: Some("git@github.com:acme/fleet.git".into()),
            clone_url: Some("https://github.com/acme/fleet.git".into()),
        }
    }

    #[test]
    fn test_visibility_mapping() {
        let internal: RepositoryRef = gh_repo(Some("internal"), true).into();
        assert_eq!(internal.visibility, Some(Visibility::Internal));

        // Older GitHub Enterprise versions omit `visibility`
        let legacy_private: RepositoryRef = gh_repo(None, true).into();
        assert_eq!(legacy_private.visibility, Some(Visibility::Private));

        let legacy_public: RepositoryRef = gh_repo(None, false).into();
        assert_eq!(legacy_public.visibility, Some(Visibility::Public));
        assert_eq!(legacy_public.default_branch, "main");
    }

    #[test]
    fn test_large_files_are_not_inline() {
        let parse = |body: serde_json::Value| serde_json::from_value::<GhContent>(body).unwrap();

        let small = parse(json!({
            "type": "file", "sha": "a", "size": 5, "encoding": "base64", "content": "aGVsbG8="
        }));
        assert!(small.is_inline());

        let empty = parse(json!({
            "type": "file", "sha": "b", "size": 0, "encoding": "base64", "content": ""
        }));
        assert!(empty.is_inline());

        let large = parse(json!({
            "type": "file", "sha": "c", "size": 1_500_000, "encoding": "none", "content": ""
        }));
        assert!(!large.is_inline());

        let missing_content = parse(json!({ "type": "file", "sha": "d", "size": 42 }));
        assert!(!missing_content.is_inline());
    }
}
