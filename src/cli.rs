//! # Command Line
//!
//! Flag parsing for the `gitops-bootstrap` binary.
//!
//! ## Usage
//!
//! ```bash
//! # Bootstrap from a GitHub organization repository
//! gitops-bootstrap github --owner acme --repository fleet --path clusters/prod
//!
//! # Personal GitLab project, HTTPS token stored in the cluster
//! gitops-bootstrap gitlab --owner jane --repository fleet --personal --token-auth
//!
//! # Self-hosted Gitea
//! gitops-bootstrap gitea --hostname https://git.example.com --owner infra --repository fleet
//!
//! # Plain Git server, the key must be authorised out of band
//! gitops-bootstrap git --url ssh://git@git.example.com/infra/fleet.git
//!
//! # Show what would change without writing anything
//! gitops-bootstrap --dry-run github --owner acme --repository fleet
//!
//! # Everything from a request file
//! gitops-bootstrap --config bootstrap.yaml
//! ```

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use gitops_bootstrap::config::{
    BootstrapRequest, CredentialPolicy, KeyAlgorithm, ProviderKind, RepositorySpec, Visibility,
};
use gitops_bootstrap::constants::{DEFAULT_BRANCH, DEFAULT_REPOSITORY_PATH};
use std::path::PathBuf;
use zeroize::Zeroizing;

/// Bootstrap GitOps controllers onto a cluster and wire them to a Git repository
#[derive(Parser, Debug)]
#[command(name = "gitops-bootstrap", version)]
#[command(
    about = "Bootstrap GitOps controllers onto a Kubernetes cluster",
    long_about = None,
    after_help = "\
Examples:
  gitops-bootstrap github --owner acme --repository fleet --path clusters/prod
  gitops-bootstrap --dry-run gitlab --owner platform/infra --repository fleet
  gitops-bootstrap --config bootstrap.yaml
"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Bootstrap request file (YAML); flags given on the command line win
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Report planned changes without writing to the provider or the cluster
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Write Prometheus metrics in text format to this file when the run ends
    #[arg(long, global = true, value_name = "PATH")]
    pub metrics_file: Option<PathBuf>,

    /// Log format
    #[arg(long, global = true, value_enum, env = "LOG_FORMAT")]
    pub log_format: Option<LogFormatArg>,

    /// Report output format
    #[arg(long, short, global = true, value_enum, default_value = "yaml")]
    pub output: OutputFormat,

    /// Kubernetes context to use (defaults to the current context)
    #[arg(long, global = true)]
    pub context: Option<String>,

    /// Replace files at generated paths that were not written by this tool
    #[arg(long, global = true)]
    pub overwrite_unmanaged: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bootstrap using a GitHub repository
    Github(HostedArgs),
    /// Bootstrap using a GitLab project
    Gitlab(HostedArgs),
    /// Bootstrap using a Gitea repository
    Gitea(HostedArgs),
    /// Bootstrap using a plain Git server (SSH or HTTPS)
    Git(ServerArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum LogFormatArg {
    Text,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum VisibilityArg {
    Private,
    Internal,
    Public,
}

impl From<VisibilityArg> for Visibility {
    fn from(value: VisibilityArg) -> Self {
        match value {
            VisibilityArg::Private => Visibility::Private,
            VisibilityArg::Internal => Visibility::Internal,
            VisibilityArg::Public => Visibility::Public,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum KeyAlgorithmArg {
    Ed25519,
    Rsa,
    Ecdsa,
}

impl From<KeyAlgorithmArg> for KeyAlgorithm {
    fn from(value: KeyAlgorithmArg) -> Self {
        match value {
            KeyAlgorithmArg::Ed25519 => KeyAlgorithm::Ed25519,
            KeyAlgorithmArg::Rsa => KeyAlgorithm::Rsa,
            KeyAlgorithmArg::Ecdsa => KeyAlgorithm::Ecdsa,
        }
    }
}

/// Flags of the hosted providers (GitHub, GitLab, Gitea)
#[derive(Args, Debug)]
pub struct HostedArgs {
    /// User, organization or (GitLab) group owning the repository
    #[arg(long)]
    pub owner: Option<String>,

    /// Repository name
    #[arg(long)]
    pub repository: Option<String>,

    /// The owner is the authenticated user, not an organization
    #[arg(long)]
    pub personal: bool,

    /// Visibility of a repository created by the bootstrap
    #[arg(long, value_enum)]
    pub visibility: Option<VisibilityArg>,

    /// API base URL for self-hosted instances
    #[arg(long)]
    pub hostname: Option<String>,

    /// Provider token (falls back to GITHUB_TOKEN, GITLAB_TOKEN or GITEA_TOKEN)
    #[arg(long, env = "GITOPS_TOKEN", hide_env_values = true)]
    pub token: Option<String>,

    /// Store the token in the cluster and clone over HTTPS instead of a deploy key
    #[arg(long)]
    pub token_auth: bool,

    #[command(flatten)]
    pub common: CommonArgs,
}

/// Flags of the plain Git server
#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Repository URL, e.g. ssh://git@host/owner/repo.git
    #[arg(long)]
    pub url: Option<String>,

    /// Basic auth username for HTTPS URLs
    #[arg(long, default_value = "git")]
    pub username: String,

    /// Basic auth password for HTTPS URLs; stored in the cluster when given
    #[arg(long, env = "GIT_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[command(flatten)]
    pub common: CommonArgs,
}

/// Flags shared by every provider
#[derive(Args, Debug, Default)]
pub struct CommonArgs {
    /// Branch the manifests are committed to
    #[arg(long)]
    pub branch: Option<String>,

    /// Directory of the cluster manifests, relative to the repository root
    #[arg(long)]
    pub path: Option<String>,

    /// Namespace of the controllers and the credential secret
    #[arg(long, short)]
    pub namespace: Option<String>,

    /// Controllers to install
    #[arg(long, value_delimiter = ',')]
    pub components: Option<Vec<String>>,

    /// Directory holding `<component>.yaml` install manifests
    #[arg(long, env = "GITOPS_COMPONENTS_DIR", default_value = "manifests")]
    pub components_dir: PathBuf,

    #[arg(long, value_enum)]
    pub key_algorithm: Option<KeyAlgorithmArg>,

    /// RSA modulus size or ECDSA curve size
    #[arg(long)]
    pub key_bits: Option<u32>,

    /// Name of the credential secret
    #[arg(long)]
    pub secret_name: Option<String>,

    /// known_hosts file stored next to the deploy key
    #[arg(long, value_name = "FILE")]
    pub known_hosts_file: Option<PathBuf>,

    /// Use the key already stored in the credential secret; never generate one
    #[arg(long)]
    pub reuse_existing_key: bool,

    #[arg(long)]
    pub author_name: Option<String>,

    #[arg(long)]
    pub author_email: Option<String>,

    /// Readiness timeout per waiting phase, e.g. 5m
    #[arg(long)]
    pub readiness_timeout: Option<String>,

    /// Timeout of the whole run, e.g. 15m
    #[arg(long)]
    pub timeout: Option<String>,

    /// Readiness poll interval, e.g. 2s
    #[arg(long)]
    pub interval: Option<String>,
}

/// Request, token and components directory assembled from the command line
#[derive(Debug)]
pub struct Invocation {
    pub request: BootstrapRequest,
    pub token: Option<Zeroizing<String>>,
    pub components_dir: PathBuf,
}

impl Cli {
    /// Merge the request file (if any) with the flags
    pub fn invocation(&self) -> Result<Invocation> {
        let base = match &self.config {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                Some(BootstrapRequest::from_yaml(&content)?)
            }
            None => None,
        };

        let mut invocation = match (&self.command, base) {
            (Some(Commands::Github(args)), base) => hosted(ProviderKind::Github, args, base)?,
            (Some(Commands::Gitlab(args)), base) => hosted(ProviderKind::Gitlab, args, base)?,
            (Some(Commands::Gitea(args)), base) => hosted(ProviderKind::Gitea, args, base)?,
            (Some(Commands::Git(args)), base) => server(args, base)?,
            (None, Some(request)) => Invocation {
                token: provider_token(request.provider, None),
                request,
                components_dir: CommonArgs::default_components_dir(),
            },
            (None, None) => bail!("either a provider subcommand or --config is required"),
        };

        invocation.request.dry_run |= self.dry_run;
        Ok(invocation)
    }
}

impl CommonArgs {
    fn default_components_dir() -> PathBuf {
        std::env::var("GITOPS_COMPONENTS_DIR")
            .map_or_else(|_| PathBuf::from("manifests"), PathBuf::from)
    }

    fn apply(&self, request: &mut BootstrapRequest) -> Result<()> {
        if let Some(branch) = &self.branch {
            request.repository.branch.clone_from(branch);
        }
        if let Some(path) = &self.path {
            request.repository.path.clone_from(path);
        }
        if let Some(namespace) = &self.namespace {
            request.namespace.clone_from(namespace);
        }
        if let Some(components) = &self.components {
            request.components.clone_from(components);
        }
        if let Some(algorithm) = self.key_algorithm {
            request.key_algorithm = algorithm.into();
        }
        if self.key_bits.is_some() {
            request.key_bits = self.key_bits;
        }
        if let Some(secret_name) = &self.secret_name {
            request.secret_name.clone_from(secret_name);
        }
        if let Some(path) = &self.known_hosts_file {
            let known_hosts = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            request.known_hosts = Some(known_hosts);
        }
        if self.reuse_existing_key {
            request.credential = CredentialPolicy::ReuseExisting;
        }
        if let Some(name) = &self.author_name {
            request.author.name.clone_from(name);
        }
        if let Some(email) = &self.author_email {
            request.author.email.clone_from(email);
        }
        if self.readiness_timeout.is_some() {
            request.readiness_timeout.clone_from(&self.readiness_timeout);
        }
        if self.timeout.is_some() {
            request.run_timeout.clone_from(&self.timeout);
        }
        if self.interval.is_some() {
            request.poll_interval.clone_from(&self.interval);
        }
        Ok(())
    }
}

fn hosted(
    provider: ProviderKind,
    args: &HostedArgs,
    base: Option<BootstrapRequest>,
) -> Result<Invocation> {
    let mut request = match base {
        Some(mut request) => {
            request.provider = provider;
            if let Some(owner) = &args.owner {
                request.repository.owner.clone_from(owner);
            }
            if let Some(name) = &args.repository {
                request.repository.name.clone_from(name);
            }
            request
        }
        None => {
            let (Some(owner), Some(name)) = (&args.owner, &args.repository) else {
                bail!("--owner and --repository are required");
            };
            BootstrapRequest::new(provider, repository_spec(owner, name))
        }
    };

    if args.personal {
        request.repository.personal = true;
    }
    if let Some(visibility) = args.visibility {
        request.repository.visibility = visibility.into();
    }
    if args.hostname.is_some() {
        request.endpoint.clone_from(&args.hostname);
    }
    if args.token_auth {
        request.credential = CredentialPolicy::SuppliedToken {
            username: "git".to_string(),
        };
    }
    args.common.apply(&mut request)?;

    Ok(Invocation {
        token: provider_token(provider, args.token.as_deref()),
        request,
        components_dir: args.common.components_dir.clone(),
    })
}

fn server(args: &ServerArgs, base: Option<BootstrapRequest>) -> Result<Invocation> {
    let url = args
        .url
        .clone()
        .or_else(|| base.as_ref().and_then(|r| r.endpoint.clone()))
        .context("--url is required")?;
    let (owner, name) = split_repository_url(&url)?;

    let mut request = match base {
        Some(mut request) => {
            request.provider = ProviderKind::Server;
            request
        }
        None => BootstrapRequest::new(ProviderKind::Server, repository_spec(&owner, &name)),
    };
    request.endpoint = Some(url);
    if args.password.is_some() {
        request.credential = CredentialPolicy::SuppliedToken {
            username: args.username.clone(),
        };
    }
    args.common.apply(&mut request)?;

    Ok(Invocation {
        token: args.password.clone().map(Zeroizing::new),
        request,
        components_dir: args.common.components_dir.clone(),
    })
}

fn repository_spec(owner: &str, name: &str) -> RepositorySpec {
    RepositorySpec {
        owner: owner.to_string(),
        name: name.to_string(),
        branch: DEFAULT_BRANCH.to_string(),
        path: DEFAULT_REPOSITORY_PATH.to_string(),
        visibility: Visibility::default(),
        personal: false,
    }
}

/// `(owner, name)` from the last two path segments of a Git URL
pub fn split_repository_url(url: &str) -> Result<(String, String)> {
    let path = match url.split_once("://") {
        Some((_, rest)) => rest.split_once('/').map_or("", |(_, path)| path),
        None => url.split_once(':').map_or(url, |(_, path)| path),
    };
    let mut segments = path
        .trim_end_matches('/')
        .trim_end_matches(".git")
        .rsplit('/')
        .filter(|s| !s.is_empty());
    let Some(name) = segments.next() else {
        bail!("cannot derive a repository name from {url}");
    };
    let owner = segments.next().unwrap_or("git");
    Ok((owner.to_string(), name.to_string()))
}

/// Token from the flag, then `GITOPS_TOKEN` (handled by clap), then the provider variable
fn provider_token(provider: ProviderKind, flag: Option<&str>) -> Option<Zeroizing<String>> {
    let fallback = match provider {
        ProviderKind::Github => "GITHUB_TOKEN",
        ProviderKind::Gitlab => "GITLAB_TOKEN",
        ProviderKind::Gitea => "GITEA_TOKEN",
        ProviderKind::Server => "GIT_PASSWORD",
    };
    flag.map(str::to_string)
        .or_else(|| std::env::var("GITOPS_TOKEN").ok())
        .or_else(|| std::env::var(fallback).ok())
        .filter(|t| !t.is_empty())
        .map(Zeroizing::new)
}
