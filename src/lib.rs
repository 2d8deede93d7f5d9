//! # gitops-bootstrap
//!
//! Library behind the `gitops-bootstrap` binary: drives a Kubernetes cluster
//! and a Git repository into a state where the GitOps controllers are
//! installed and reconcile from that repository.
//!
//! ## Modules
//!
//! - [`reconciler`]: the bootstrap state machine, retry policy and run report
//! - [`provider`]: GitHub, GitLab, Gitea and plain Git server backends
//! - [`credentials`]: deploy key / token provisioning
//! - [`manifests`]: manifest generation, diffing and commits
//! - [`cluster`]: server-side apply, status reads and the credential secret
//! - [`readiness`]: polling of convergence targets
//! - [`git`]: `git` CLI plumbing for the plain server backend
//! - [`config`], [`error`], [`observability`], [`constants`]
//!
//! ## Example
//!
//! ```no_run
//! use gitops_bootstrap::prelude::*;
//! use std::sync::Arc;
//!
//! # async fn run() -> gitops_bootstrap::error::Result<()> {
//! let config = BootstrapConfig::from_env();
//! let request = BootstrapRequest::from_yaml(&std::fs::read_to_string("bootstrap.yaml").unwrap())?;
//! let provider = create_provider(&request, &config, None)?;
//! let cluster = Arc::new(KubeCluster::try_default(config.field_manager.as_str()).await?);
//! let generator = Arc::new(DefaultGenerator::new("manifests"));
//!
//! let report = BootstrapReconciler::with_cluster(provider, cluster, generator, config)
//!     .run(&request)
//!     .await?;
//! assert!(report.succeeded());
//! # Ok(())
//! # }
//! ```

pub mod cluster;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod error;
pub mod git;
pub mod manifests;
pub mod observability;
pub mod prelude;
pub mod provider;
pub mod readiness;
pub mod reconciler;

pub use error::{Error, Result};
