//! # Manifests
//!
//! Generated manifest files, the commit intent derived from comparing them
//! with the repository, and the synchronizer that submits it.
//!
//! Files are compared by SHA-256 content hash, path by path. Only generated
//! paths are ever read or written.

use crate::config::CommitAuthor;
use crate::constants::GENERATED_MARKER;
use crate::provider::RemoteFile;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

pub mod flux;
mod generator;
mod sync;

pub use generator::{DefaultGenerator, ManifestConfig, ManifestGenerator, ManifestKind};
pub use sync::{ConflictPolicy, ManifestSynchronizer, SyncOutcome};

/// Hex SHA-256 of file content
#[must_use]
pub fn content_hash(content: &str) -> String {
    format!("{:x}", Sha256::digest(content.as_bytes()))
}

/// Whether `content` was written by this tool
#[must_use]
pub fn is_generated(content: &str) -> bool {
    content.starts_with(GENERATED_MARKER)
}

/// One generated file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestFile {
    /// Path relative to the repository root
    pub path: String,
    pub content: String,
    pub hash: String,
}

impl ManifestFile {
    pub fn new(path: impl Into<String>, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            path: path.into(),
            hash: content_hash(&content),
            content,
        }
    }
}

/// Ordered set of generated files
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestSet {
    files: Vec<ManifestFile>,
}

impl ManifestSet {
    #[must_use]
    pub fn new(files: Vec<ManifestFile>) -> Self {
        Self { files }
    }

    #[must_use]
    pub fn files(&self) -> &[ManifestFile] {
        &self.files
    }

    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.files.iter().map(|f| f.path.clone()).collect()
    }

    #[must_use]
    pub fn get(&self, path: &str) -> Option<&ManifestFile> {
        self.files.iter().find(|f| f.path == path)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    Create,
    Update,
}

impl FileAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            FileAction::Create => "create",
            FileAction::Update => "update",
        }
    }
}

/// A file to write in the next commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub content: String,
    pub action: FileAction,
    /// Blob sha of the file being replaced
    pub previous_revision: Option<String>,
}

/// The changed subset of a manifest set, ready to be committed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIntent {
    pub branch: String,
    pub author: CommitAuthor,
    pub message: String,
    pub changes: Vec<FileChange>,
}

impl CommitIntent {
    /// Keep only the files whose hash differs from the remote content
    #[must_use]
    pub fn diff(
        branch: &str,
        author: &CommitAuthor,
        message: &str,
        files: &[ManifestFile],
        remote: &BTreeMap<String, RemoteFile>,
    ) -> Self {
        let changes = files
            .iter()
            .filter_map(|file| match remote.get(&file.path) {
                Some(current) if content_hash(&current.content) == file.hash => None,
                Some(current) => Some(FileChange {
                    path: file.path.clone(),
                    content: file.content.clone(),
                    action: FileAction::Update,
                    previous_revision: current.revision.clone(),
                }),
                None => Some(FileChange {
                    path: file.path.clone(),
                    content: file.content.clone(),
                    action: FileAction::Create,
                    previous_revision: None,
                }),
            })
            .collect();

        Self {
            branch: branch.to_string(),
            author: author.clone(),
            message: message.to_string(),
            changes,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    #[must_use]
    pub fn paths(&self) -> Vec<String> {
        self.changes.iter().map(|c| c.path.clone()).collect()
    }
}

/// Result of a commit attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitResult {
    pub sha: Option<String>,
    /// Nothing was written because every file matched
    pub skipped: bool,
    /// Paths included in the commit
    pub files: Vec<String>,
}

impl CommitResult {
    #[must_use]
    pub fn skipped() -> Self {
        Self {
            sha: None,
            skipped: true,
            files: Vec::new(),
        }
    }

    #[must_use]
    pub fn committed(sha: String, files: Vec<String>) -> Self {
        Self {
            sha: Some(sha),
            skipped: false,
            files,
        }
    }
}
