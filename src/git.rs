//! # Git Plumbing
//!
//! Minimal Git operations for repositories without a management API.
//!
//! [`GitCli`] shells out to the `git` binary. Every call works in its own
//! temporary directory which is removed when the call returns.

use crate::error::{Error, Result};
use crate::manifests::CommitIntent;
use crate::provider::RemoteFile;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Debug;
use std::path::Path;
use tokio::process::Command;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Branches advertised by a remote
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteHeads {
    /// Branch `HEAD` points at, if the server advertises it
    pub default_branch: Option<String>,
    pub branches: BTreeSet<String>,
}

#[async_trait]
pub trait GitPlumbing: Send + Sync + Debug {
    /// List the branches of `url`, `None` when the repository does not exist
    async fn ls_remote(&self, url: &str) -> Result<Option<RemoteHeads>>;

    /// Read `paths` at the tip of `branch`; missing paths are omitted
    async fn read_files(
        &self,
        url: &str,
        branch: &str,
        paths: &[String],
    ) -> Result<BTreeMap<String, RemoteFile>>;

    /// Commit the intent on top of `intent.branch` and push it
    ///
    /// A branch that does not exist yet starts from `fallback_branch`, or
    /// from an empty history when that is missing too.
    async fn commit_and_push(
        &self,
        url: &str,
        intent: &CommitIntent,
        fallback_branch: &str,
    ) -> Result<String>;
}

/// [`GitPlumbing`] backed by the `git` command line
pub struct GitCli {
    /// Value of the `Authorization` header for HTTPS remotes
    auth_header: Option<Zeroizing<String>>,
}

impl std::fmt::Debug for GitCli {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitCli")
            .field("authenticated", &self.auth_header.is_some())
            .finish()
    }
}

impl GitCli {
    /// Anonymous or SSH-agent based access
    #[must_use]
    pub fn new() -> Self {
        Self { auth_header: None }
    }

    /// HTTPS basic auth with `username` and `token`
    #[must_use]
    pub fn with_token(username: &str, token: &str) -> Self {
        let encoded = general_purpose::STANDARD.encode(format!("{username}:{token}"));
        Self {
            auth_header: Some(Zeroizing::new(format!("Authorization: Basic {encoded}"))),
        }
    }

    fn command(&self, dir: Option<&Path>) -> Command {
        let mut cmd = Command::new("git");
        if let Some(dir) = dir {
            cmd.arg("-C").arg(dir);
        }
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        // Passed through the environment so the token never shows up in argv
        if let Some(header) = &self.auth_header {
            cmd.env("GIT_CONFIG_COUNT", "1")
                .env("GIT_CONFIG_KEY_0", "http.extraHeader")
                .env("GIT_CONFIG_VALUE_0", header.as_str());
        }
        cmd
    }

    async fn run(&self, dir: Option<&Path>, args: &[&str]) -> Result<String> {
        let output = self
            .command(dir)
            .args(args)
            .output()
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("Failed to execute git: {e}")))?;

        if output.status.success() {
            return Ok(String::from_utf8_lossy(&output.stdout).into_owned());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let subcommand = args.first().copied().unwrap_or("git");
        Err(classify_git_error(subcommand, &stderr))
    }

    /// Fetch `branch` into FETCH_HEAD, `false` when the remote lacks it
    async fn fetch(&self, dir: &Path, url: &str, branch: &str) -> Result<bool> {
        let refspec = format!("refs/heads/{branch}");
        match self
            .run(Some(dir), &["fetch", "--quiet", "--depth", "1", url, &refspec])
            .await
        {
            Ok(_) => Ok(true),
            Err(Error::Internal(e)) if is_missing_ref(&e.to_string()) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn scratch_repository(&self) -> Result<tempfile::TempDir> {
        let dir = tempfile::tempdir()
            .map_err(|e| Error::Internal(anyhow::anyhow!("Failed to create scratch directory: {e}")))?;
        self.run(Some(dir.path()), &["init", "--quiet"]).await?;
        Ok(dir)
    }
}

impl Default for GitCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GitPlumbing for GitCli {
    async fn ls_remote(&self, url: &str) -> Result<Option<RemoteHeads>> {
        match self.run(None, &["ls-remote", "--symref", url]).await {
            Ok(output) => Ok(Some(parse_ls_remote(&output))),
            Err(Error::Internal(e)) if is_missing_repository(&e.to_string()) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn read_files(
        &self,
        url: &str,
        branch: &str,
        paths: &[String],
    ) -> Result<BTreeMap<String, RemoteFile>> {
        let scratch = self.scratch_repository().await?;
        let dir = scratch.path();
        let mut files = BTreeMap::new();

        if !self.fetch(dir, url, branch).await? {
            debug!(%branch, "Branch does not exist yet");
            return Ok(files);
        }

        for path in paths {
            let object = format!("FETCH_HEAD:{path}");
            // A missing path makes `git rev-parse` fail; that only means absent
            let Ok(revision) = self.run(Some(dir), &["rev-parse", "--verify", "--quiet", &object]).await
            else {
                continue;
            };
            let content = self.run(Some(dir), &["cat-file", "blob", &object]).await?;
            files.insert(
                path.clone(),
                RemoteFile {
                    content,
                    revision: Some(revision.trim().to_string()),
                },
            );
        }
        Ok(files)
    }

    async fn commit_and_push(
        &self,
        url: &str,
        intent: &CommitIntent,
        fallback_branch: &str,
    ) -> Result<String> {
        let scratch = self.scratch_repository().await?;
        let dir = scratch.path();

        let has_base = self.fetch(dir, url, &intent.branch).await?
            || (fallback_branch != intent.branch && self.fetch(dir, url, fallback_branch).await?);
        if has_base {
            self.run(Some(dir), &["checkout", "--quiet", "-B", &intent.branch, "FETCH_HEAD"])
                .await?;
        } else {
            self.run(Some(dir), &["checkout", "--quiet", "--orphan", &intent.branch])
                .await?;
        }

        for change in &intent.changes {
            let target = dir.join(&change.path);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent).await.map_err(|e| {
                    Error::Internal(anyhow::anyhow!("Failed to create {}: {e}", parent.display()))
                })?;
            }
            tokio::fs::write(&target, change.content.as_bytes())
                .await
                .map_err(|e| Error::Internal(anyhow::anyhow!("Failed to write {}: {e}", change.path)))?;
            self.run(Some(dir), &["add", "--", &change.path]).await?;
        }

        let name = format!("user.name={}", intent.author.name);
        let email = format!("user.email={}", intent.author.email);
        self.run(
            Some(dir),
            &["-c", &name, "-c", &email, "commit", "--quiet", "-m", &intent.message],
        )
        .await?;

        let refspec = format!("HEAD:refs/heads/{}", intent.branch);
        self.run(Some(dir), &["push", "--quiet", url, &refspec]).await?;

        let sha = self.run(Some(dir), &["rev-parse", "HEAD"]).await?;
        let sha = sha.trim().to_string();
        info!(%sha, branch = %intent.branch, "Pushed commit");
        Ok(sha)
    }
}

/// Parse `git ls-remote --symref` output
#[must_use]
pub fn parse_ls_remote(output: &str) -> RemoteHeads {
    let mut heads = RemoteHeads::default();
    for line in output.lines() {
        let Some((left, right)) = line.split_once('\t') else {
            continue;
        };
        if let Some(target) = left.strip_prefix("ref: ") {
            if right == "HEAD" {
                heads.default_branch = target.strip_prefix("refs/heads/").map(str::to_string);
            }
        } else if let Some(branch) = right.strip_prefix("refs/heads/") {
            heads.branches.insert(branch.to_string());
        }
    }
    heads
}

/// Map git's stderr to a classified error
///
/// Messages that mean "not there" stay `Internal` so callers can match on them.
fn classify_git_error(subcommand: &str, stderr: &str) -> Error {
    let lower = stderr.to_lowercase();
    let message = format!("git {subcommand} failed: {}", stderr.trim());

    if lower.contains("authentication failed")
        || lower.contains("permission denied")
        || lower.contains("could not read username")
        || lower.contains("returned error: 401")
        || lower.contains("returned error: 403")
    {
        return Error::auth("git", message);
    }
    if lower.contains("could not resolve host")
        || lower.contains("connection refused")
        || lower.contains("connection reset")
        || lower.contains("timed out")
        || lower.contains("early eof")
        || lower.contains("returned error: 5")
    {
        return Error::transient(message);
    }
    if lower.contains("[rejected]") || lower.contains("non-fast-forward") || lower.contains("fetch first") {
        return Error::Conflict(message);
    }
    Error::Internal(anyhow::anyhow!(message))
}

fn is_missing_ref(message: &str) -> bool {
    message.to_lowercase().contains("couldn't find remote ref")
}

fn is_missing_repository(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("not found")
        || lower.contains("does not appear to be a git repository")
        || lower.contains("does not exist")
}
