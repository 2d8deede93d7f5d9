//! # Manifest Synchronizer
//!
//! Makes the generated paths of a branch match a [`ManifestSet`] with at most
//! one commit.

use super::{is_generated, CommitIntent, CommitResult, ManifestSet};
use crate::config::CommitAuthor;
use crate::error::{Error, Result};
use crate::observability::metrics;
use crate::provider::{GitProvider, RepositoryRef};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What to do when a generated path holds a file this tool did not write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConflictPolicy {
    /// Stop with [`Error::Conflict`]
    #[default]
    FailOnUnmanaged,
    /// Replace the file
    Overwrite,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// Every generated path already matched; nothing was written
    Unchanged,
    Committed(CommitResult),
    /// Dry run: the commit that would have been made
    Planned(CommitIntent),
}

#[derive(Debug)]
pub struct ManifestSynchronizer {
    provider: Arc<dyn GitProvider>,
    author: CommitAuthor,
    policy: ConflictPolicy,
}

impl ManifestSynchronizer {
    #[must_use]
    pub fn new(provider: Arc<dyn GitProvider>, author: CommitAuthor, policy: ConflictPolicy) -> Self {
        Self {
            provider,
            author,
            policy,
        }
    }

    /// Commit the files of `set` that differ from the tip of `branch`
    ///
    /// Unmanaged files are checked here; the write itself goes through
    /// [`GitProvider::commit_files`].
    pub async fn sync(
        &self,
        repo: &RepositoryRef,
        branch: &str,
        set: &ManifestSet,
        message: &str,
        dry_run: bool,
    ) -> Result<SyncOutcome> {
        let remote = self.provider.read_files(repo, branch, &set.paths()).await?;

        for (path, current) in &remote {
            let Some(file) = set.get(path) else {
                continue;
            };
            if file.hash == super::content_hash(&current.content) || is_generated(&current.content)
            {
                continue;
            }
            match self.policy {
                ConflictPolicy::FailOnUnmanaged => {
                    return Err(Error::Conflict(format!(
                        "{path} on {branch} was not generated by this tool; refusing to overwrite it"
                    )));
                }
                ConflictPolicy::Overwrite => {
                    warn!(%path, %branch, "Overwriting unmanaged file at generated path");
                }
            }
        }

        let intent = CommitIntent::diff(branch, &self.author, message, set.files(), &remote);
        if intent.is_empty() {
            debug!(%branch, files = set.files().len(), "Manifests already up to date");
            metrics::increment_commits("skipped");
            return Ok(SyncOutcome::Unchanged);
        }

        if dry_run {
            info!(%branch, files = ?intent.paths(), "Dry run: would commit manifests");
            return Ok(SyncOutcome::Planned(intent));
        }

        // The provider re-reads the branch, so a concurrent writer that already
        // converged it leaves nothing to commit
        let result = self
            .provider
            .commit_files(repo, branch, set.files(), &self.author, message)
            .await?;
        if result.skipped {
            debug!(%branch, "Branch converged before the commit");
            metrics::increment_commits("skipped");
            return Ok(SyncOutcome::Unchanged);
        }

        info!(sha = ?result.sha, %branch, files = ?result.files, "Committed manifests");
        metrics::increment_commits("committed");
        Ok(SyncOutcome::Committed(result))
    }
}
