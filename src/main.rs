//! # gitops-bootstrap
//!
//! Installs the GitOps controller suite on a Kubernetes cluster and wires it
//! to a Git repository on GitHub, GitLab, Gitea or a plain Git server.
//!
//! A run is idempotent: re-running against a bootstrapped cluster changes
//! nothing, and re-running after a failure resumes where it stopped.
//!
//! The run report is printed to stdout; logs go to stderr. The exit code is
//! non-zero when the run fails.

use anyhow::{Context, Result};
use clap::Parser;
use gitops_bootstrap::cluster::KubeCluster;
use gitops_bootstrap::config::BootstrapConfig;
use gitops_bootstrap::manifests::{ConflictPolicy, DefaultGenerator};
use gitops_bootstrap::observability::{init_logging, metrics, LogFormat};
use gitops_bootstrap::provider::create_provider;
use gitops_bootstrap::reconciler::{BootstrapReconciler, BootstrapReport};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{info, warn};

mod cli;

use cli::{Cli, LogFormatArg, OutputFormat};

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // Configure rustls crypto provider FIRST, before any other operations
    // Required for rustls 0.23+ when no default provider is set via features
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("Failed to install rustls crypto provider");
    }

    let cli = Cli::parse();
    let config = BootstrapConfig::from_env();

    let log_format = match cli.log_format {
        Some(LogFormatArg::Json) => LogFormat::Json,
        Some(LogFormatArg::Text) => LogFormat::Text,
        None => LogFormat::parse(&config.log_format),
    };
    init_logging(&config.log_level, log_format)?;
    metrics::register_metrics()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("BUILD_GIT_HASH"),
        build_time = env!("BUILD_DATETIME"),
        "gitops-bootstrap starting"
    );

    let invocation = cli.invocation()?;
    let request = invocation.request;

    let provider = create_provider(&request, &config, invocation.token.clone())?;
    let cluster = match &cli.context {
        Some(context) => KubeCluster::for_context(context, config.field_manager.as_str()).await,
        None => KubeCluster::try_default(config.field_manager.as_str()).await,
    }
    .context("Failed to create Kubernetes client. Ensure kubeconfig is configured.")?;
    let generator = Arc::new(DefaultGenerator::new(invocation.components_dir));

    let policy = if cli.overwrite_unmanaged {
        ConflictPolicy::Overwrite
    } else {
        ConflictPolicy::FailOnUnmanaged
    };
    let reconciler =
        BootstrapReconciler::with_cluster(provider, Arc::new(cluster), generator, config)
            .with_token(invocation.token)
            .with_conflict_policy(policy);

    // Ctrl-C stops the run at the next step boundary or poll interval
    let cancel = reconciler.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling bootstrap");
            cancel.cancel();
        }
    });

    let report = reconciler.run(&request).await?;

    if let Some(path) = &cli.metrics_file {
        metrics::write_metrics_file(path)?;
    }
    print_report(&report, cli.output)?;

    Ok(if report.failure.is_some() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_report(report: &BootstrapReport, format: OutputFormat) -> Result<()> {
    let rendered = match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(report).context("Failed to render report")?
        }
        OutputFormat::Yaml => serde_yaml::to_string(report).context("Failed to render report")?,
    };
    println!("{rendered}");
    Ok(())
}
