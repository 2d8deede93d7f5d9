//! # Bootstrap Request
//!
//! The immutable description of one bootstrap run.
//!
//! A request can be deserialized from YAML (camelCase keys) or assembled by
//! the CLI. [`BootstrapRequest::validate`] must pass before any remote call;
//! every failure is reported as [`Error::Config`].

use crate::config::duration::parse_duration;
use crate::constants::*;
use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::LazyLock;
use std::time::Duration;

static DNS_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("dns label regex is valid")
});

static DNS_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9.]*[a-z0-9])?$").expect("dns subdomain regex is valid")
});

// GitLab owners may be nested groups, hence the slash
static OWNER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/-]*$").expect("owner regex is valid")
});

static REPOSITORY_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("repository regex is valid"));

/// Git hosting backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Github,
    Gitlab,
    Gitea,
    /// Plain Git server reachable over SSH or HTTPS, no management API
    Server,
}

impl ProviderKind {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Github => "github",
            ProviderKind::Gitlab => "gitlab",
            ProviderKind::Gitea => "gitea",
            ProviderKind::Server => "server",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Internal,
    Public,
}

impl Visibility {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Private => "private",
            Visibility::Internal => "internal",
            Visibility::Public => "public",
        }
    }
}

/// How the cluster authenticates when pulling from the repository
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", tag = "policy")]
pub enum CredentialPolicy {
    /// Reuse a valid generated key, otherwise generate and register a new one
    #[default]
    Generate,
    /// Reuse the key already stored in the cluster secret; never generate
    ReuseExisting,
    /// Store the provider token as HTTPS basic auth credentials
    SuppliedToken {
        #[serde(default = "default_token_username")]
        username: String,
    },
}

fn default_token_username() -> String {
    "git".to_string()
}

/// Deploy key algorithm
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAlgorithm {
    #[default]
    Ed25519,
    /// Legacy compatibility
    Rsa,
    Ecdsa,
}

impl KeyAlgorithm {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAlgorithm::Ed25519 => "ed25519",
            KeyAlgorithm::Rsa => "rsa",
            KeyAlgorithm::Ecdsa => "ecdsa",
        }
    }

    /// Key size used when the request leaves it unset
    #[must_use]
    pub fn default_bits(&self) -> Option<u32> {
        match self {
            KeyAlgorithm::Ed25519 => None,
            KeyAlgorithm::Rsa => Some(DEFAULT_RSA_KEY_BITS),
            KeyAlgorithm::Ecdsa => Some(DEFAULT_ECDSA_KEY_BITS),
        }
    }

    fn accepts_bits(&self, bits: u32) -> bool {
        match self {
            KeyAlgorithm::Ed25519 => false,
            KeyAlgorithm::Rsa => matches!(bits, 2048 | 3072 | 4096),
            KeyAlgorithm::Ecdsa => matches!(bits, 256 | 384 | 521),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitAuthor {
    pub name: String,
    pub email: String,
}

impl Default for CommitAuthor {
    fn default() -> Self {
        Self {
            name: DEFAULT_AUTHOR_NAME.to_string(),
            email: DEFAULT_AUTHOR_EMAIL.to_string(),
        }
    }
}

/// Repository coordinates
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    /// User, organization or group owning the repository
    pub owner: String,
    pub name: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Directory holding the cluster manifests, relative to the repository root
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub visibility: Visibility,
    /// Owner is the authenticated user rather than an organization
    #[serde(default)]
    pub personal: bool,
}

fn default_branch() -> String {
    DEFAULT_BRANCH.to_string()
}

fn default_path() -> String {
    DEFAULT_REPOSITORY_PATH.to_string()
}

impl RepositorySpec {
    /// `owner/name`
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Input of one bootstrap run
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BootstrapRequest {
    /// Namespace the controllers and the credential secret live in
    #[serde(default = "default_namespace")]
    pub namespace: String,
    pub provider: ProviderKind,
    /// API base URL (GitHub Enterprise, self-managed GitLab, Gitea)
    /// or the clone URL for a plain Git server
    #[serde(default)]
    pub endpoint: Option<String>,
    pub repository: RepositorySpec,
    #[serde(default)]
    pub credential: CredentialPolicy,
    #[serde(default)]
    pub key_algorithm: KeyAlgorithm,
    #[serde(default)]
    pub key_bits: Option<u32>,
    #[serde(default = "default_components")]
    pub components: Vec<String>,
    #[serde(default = "default_secret_name")]
    pub secret_name: String,
    /// known_hosts entries stored next to the deploy key
    #[serde(default)]
    pub known_hosts: Option<String>,
    #[serde(default)]
    pub author: CommitAuthor,
    /// Readiness timeout per waiting phase, e.g. "5m"
    #[serde(default)]
    pub readiness_timeout: Option<String>,
    /// Aggregate timeout for the whole run, e.g. "15m"
    #[serde(default)]
    pub run_timeout: Option<String>,
    /// Readiness poll interval, e.g. "2s"
    #[serde(default)]
    pub poll_interval: Option<String>,
    /// Replace every mutation with a plan entry
    #[serde(default)]
    pub dry_run: bool,
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_components() -> Vec<String> {
    DEFAULT_COMPONENTS.iter().map(|c| (*c).to_string()).collect()
}

fn default_secret_name() -> String {
    DEFAULT_SECRET_NAME.to_string()
}

impl BootstrapRequest {
    /// Request with defaults for everything but the provider and repository
    #[must_use]
    pub fn new(provider: ProviderKind, repository: RepositorySpec) -> Self {
        Self {
            namespace: default_namespace(),
            provider,
            endpoint: None,
            repository,
            credential: CredentialPolicy::default(),
            key_algorithm: KeyAlgorithm::default(),
            key_bits: None,
            components: default_components(),
            secret_name: default_secret_name(),
            known_hosts: None,
            author: CommitAuthor::default(),
            readiness_timeout: None,
            run_timeout: None,
            poll_interval: None,
            dry_run: false,
        }
    }

    /// Load a request from YAML
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content)
            .map_err(|e| Error::config(format!("failed to parse bootstrap request: {e}")))
    }

    /// Check every field before any remote call is made
    pub fn validate(&self) -> Result<()> {
        if self.namespace.len() > 63 || !DNS_LABEL.is_match(&self.namespace) {
            return Err(Error::config(format!(
                "namespace '{}' is not a valid DNS-1123 label",
                self.namespace
            )));
        }

        let repo = &self.repository;
        if !OWNER.is_match(&repo.owner) || repo.owner.contains("//") || repo.owner.ends_with('/')
        {
            return Err(Error::config(format!(
                "repository owner '{}' is invalid",
                repo.owner
            )));
        }
        if !REPOSITORY_NAME.is_match(&repo.name) || repo.name == "." || repo.name == ".." {
            return Err(Error::config(format!(
                "repository name '{}' is invalid",
                repo.name
            )));
        }
        validate_branch(&repo.branch)?;
        validate_path(&repo.path)?;

        if self.secret_name.len() > 253 || !DNS_SUBDOMAIN.is_match(&self.secret_name) {
            return Err(Error::config(format!(
                "secret name '{}' is invalid",
                self.secret_name
            )));
        }

        if self.components.is_empty() {
            return Err(Error::config("at least one component must be selected"));
        }
        let mut seen = HashSet::new();
        for component in &self.components {
            if !DNS_LABEL.is_match(component) {
                return Err(Error::config(format!(
                    "component '{component}' is not a valid name"
                )));
            }
            if !seen.insert(component.as_str()) {
                return Err(Error::config(format!("component '{component}' listed twice")));
            }
        }

        if let Some(bits) = self.key_bits {
            if !self.key_algorithm.accepts_bits(bits) {
                return Err(Error::config(format!(
                    "key size {bits} is not supported for {}",
                    self.key_algorithm.as_str()
                )));
            }
        }

        if self.provider == ProviderKind::Server && self.endpoint.is_none() {
            return Err(Error::config(
                "a plain Git server requires the repository URL as endpoint",
            ));
        }
        if let Some(endpoint) = &self.endpoint {
            if endpoint.trim().is_empty() {
                return Err(Error::config("endpoint cannot be empty"));
            }
        }

        if self.author.name.trim().is_empty() || !self.author.email.contains('@') {
            return Err(Error::config("commit author needs a name and an email"));
        }

        for value in [&self.readiness_timeout, &self.run_timeout, &self.poll_interval]
            .into_iter()
            .flatten()
        {
            parse_duration(value)?;
        }

        Ok(())
    }

    /// Key size to generate, falling back to the algorithm default
    #[must_use]
    pub fn effective_key_bits(&self) -> Option<u32> {
        self.key_bits.or_else(|| self.key_algorithm.default_bits())
    }

    /// Directory holding the generated manifests, `<path>/<namespace>`
    #[must_use]
    pub fn manifests_dir(&self) -> String {
        let base = self.repository.path.trim_matches('/');
        if base.is_empty() {
            self.namespace.clone()
        } else {
            format!("{base}/{}", self.namespace)
        }
    }

    /// Title under which the deploy key is registered with the provider
    #[must_use]
    pub fn deploy_key_title(&self) -> String {
        format!("gitops-{}-{}", self.repository.name, self.namespace)
    }

    pub fn readiness_timeout_or(&self, default: Duration) -> Result<Duration> {
        duration_or(self.readiness_timeout.as_deref(), default)
    }

    pub fn run_timeout_or(&self, default: Duration) -> Result<Duration> {
        duration_or(self.run_timeout.as_deref(), default)
    }

    pub fn poll_interval_or(&self, default: Duration) -> Result<Duration> {
        duration_or(self.poll_interval.as_deref(), default)
    }
}

fn duration_or(value: Option<&str>, default: Duration) -> Result<Duration> {
    value.map_or(Ok(default), parse_duration)
}

fn validate_branch(branch: &str) -> Result<()> {
    let invalid = branch.is_empty()
        || branch.starts_with('-')
        || branch.starts_with('/')
        || branch.ends_with('/')
        || branch.ends_with(".lock")
        || branch.contains("..")
        || branch
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '~' | '^' | ':' | '?' | '*' | '[' | '\\'));
    if invalid {
        return Err(Error::config(format!("branch '{branch}' is invalid")));
    }
    Ok(())
}

fn validate_path(path: &str) -> Result<()> {
    if path.starts_with('/') {
        return Err(Error::config(format!(
            "path '{path}' must be relative to the repository root"
        )));
    }
    if path.split('/').any(|segment| segment == "..") {
        return Err(Error::config(format!(
            "path '{path}' must not leave the repository"
        )));
    }
    Ok(())
}
