//! # Bootstrap Reconciler
//!
//! Drives a cluster and a repository through the bootstrap states:
//!
//! ```text
//! Init -> RepoEnsured -> CredentialEnsured -> InstallCommitted -> InstallApplied
//!      -> ControllersReady -> SyncCommitted -> SourceReady -> Done
//! ```
//!
//! Steps run strictly in order. Each one re-reads remote state and only
//! mutates what differs, so a re-run of a converged bootstrap is a no-op and a
//! re-run after a failure picks up where the previous run stopped. Any error
//! that survives the retry policy ends the run in `Failed`.

use super::report::{BootstrapReport, CommitReport, FailureReport, StepOutcome, StepReport};
use super::retry::RetryPolicy;
use super::state::BootstrapState;
use crate::cluster::{ClusterApplier, ObjectRef, SecretStore, StatusReader};
use crate::config::{deadline_after, BootstrapConfig, BootstrapRequest};
use crate::credentials::SecretProvisioner;
use crate::error::{Error, Result};
use crate::manifests::{
    CommitResult, ConflictPolicy, ManifestConfig, ManifestGenerator, ManifestKind, ManifestSet,
    ManifestSynchronizer, SyncOutcome,
};
use crate::observability::metrics;
use crate::provider::{check_visibility, GitProvider, RepositoryRef};
use crate::readiness::{ConvergenceTarget, ReadinessPoller};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use zeroize::Zeroizing;

const INSTALL_COMMIT_MESSAGE: &str = "Add GitOps controller manifests";
const SYNC_COMMIT_MESSAGE: &str = "Add GitOps sync manifests";

/// Per-run state threaded through the steps
struct Run<'a> {
    request: &'a BootstrapRequest,
    cancel: CancellationToken,
    deadline: Instant,
    readiness_timeout: Duration,
    poll_interval: Duration,
    report: BootstrapReport,
    repo: Option<RepositoryRef>,
    manifests: Option<ManifestConfig>,
    install: Option<ManifestSet>,
}

impl Run<'_> {
    fn repo(&self) -> Result<&RepositoryRef> {
        self.repo
            .as_ref()
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("repository step has not run")))
    }

    fn manifests(&self) -> Result<&ManifestConfig> {
        self.manifests
            .as_ref()
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("repository step has not run")))
    }

    /// Stop before the next step when cancelled or out of time
    fn check_continue(&self) -> Result<()> {
        if Instant::now() >= self.deadline {
            return Err(Error::Cancelled("run deadline elapsed".into()));
        }
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled("run was cancelled".into()));
        }
        Ok(())
    }
}

/// Result of one step
struct Step {
    outcome: StepOutcome,
    detail: String,
}

impl Step {
    fn new(outcome: StepOutcome, detail: impl Into<String>) -> Self {
        Self {
            outcome,
            detail: detail.into(),
        }
    }

    /// Satisfied when nothing changed, otherwise mutated or planned
    fn changed(changed: bool, dry_run: bool, detail: impl Into<String>) -> Self {
        let outcome = match (changed, dry_run) {
            (false, _) => StepOutcome::Satisfied,
            (true, true) => StepOutcome::Planned,
            (true, false) => StepOutcome::Mutated,
        };
        Self::new(outcome, detail)
    }
}

/// Orchestrates one bootstrap run at a time
///
/// Concurrent runs against the same cluster and repository are not
/// coordinated; callers must not start them.
pub struct BootstrapReconciler {
    provider: Arc<dyn GitProvider>,
    secrets: Arc<dyn SecretStore>,
    applier: Arc<dyn ClusterApplier>,
    status: Arc<dyn StatusReader>,
    generator: Arc<dyn ManifestGenerator>,
    config: BootstrapConfig,
    retry: RetryPolicy,
    token: Option<Zeroizing<String>>,
    conflict_policy: ConflictPolicy,
    cancel: CancellationToken,
}

impl fmt::Debug for BootstrapReconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapReconciler")
            .field("provider", &self.provider.kind())
            .field("config", &self.config)
            .field("retry", &self.retry)
            .field("conflict_policy", &self.conflict_policy)
            .finish_non_exhaustive()
    }
}

impl BootstrapReconciler {
    pub fn new(
        provider: Arc<dyn GitProvider>,
        secrets: Arc<dyn SecretStore>,
        applier: Arc<dyn ClusterApplier>,
        status: Arc<dyn StatusReader>,
        generator: Arc<dyn ManifestGenerator>,
        config: BootstrapConfig,
    ) -> Self {
        Self {
            provider,
            secrets,
            applier,
            status,
            generator,
            retry: RetryPolicy::from_config(&config),
            config,
            token: None,
            conflict_policy: ConflictPolicy::default(),
            cancel: CancellationToken::new(),
        }
    }

    /// Use one cluster handle for applies, status reads and the secret
    pub fn with_cluster<C>(
        provider: Arc<dyn GitProvider>,
        cluster: Arc<C>,
        generator: Arc<dyn ManifestGenerator>,
        config: BootstrapConfig,
    ) -> Self
    where
        C: ClusterApplier + SecretStore + StatusReader + 'static,
    {
        let secrets: Arc<dyn SecretStore> = Arc::clone(&cluster) as Arc<dyn SecretStore>;
        let applier: Arc<dyn ClusterApplier> = Arc::clone(&cluster) as Arc<dyn ClusterApplier>;
        Self::new(provider, secrets, applier, cluster, generator, config)
    }

    /// Token stored in the cluster under the supplied-token credential policy
    #[must_use]
    pub fn with_token(mut self, token: Option<Zeroizing<String>>) -> Self {
        self.token = token;
        self
    }

    #[must_use]
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Cancelling this token stops the run at the next step or poll interval
    #[must_use]
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run the bootstrap
    ///
    /// An invalid request is rejected before any remote call. Every other
    /// failure is recorded in the report's `failure` field.
    pub async fn run(&self, request: &BootstrapRequest) -> Result<BootstrapReport> {
        request.validate()?;

        let run_timeout = request.run_timeout_or(self.config.run_timeout())?;
        let readiness_timeout = request.readiness_timeout_or(self.config.readiness_timeout())?;
        let poll_interval = request.poll_interval_or(self.config.poll_interval())?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let span = info_span!(
            "bootstrap",
            run_id = %run_id,
            provider = %request.provider,
            repository = %request.repository.full_name(),
            namespace = %request.namespace,
            dry_run = request.dry_run
        );

        // The run token fires on explicit cancellation and at the run deadline
        let cancel = self.cancel.child_token();
        let deadline = deadline_after(run_timeout);
        let deadline_timer = {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                cancel.cancel();
            })
        };

        let mut run = Run {
            request,
            cancel,
            deadline,
            readiness_timeout,
            poll_interval,
            report: BootstrapReport::new(run_id, request.dry_run),
            repo: None,
            manifests: None,
            install: None,
        };

        self.execute(&mut run).instrument(span).await;
        deadline_timer.abort();

        let outcome = match &run.report.failure {
            None if request.dry_run => "planned",
            None => "succeeded",
            Some(failure) if failure.error_kind == "cancelled" => "cancelled",
            Some(_) => "failed",
        };
        metrics::increment_runs(outcome);

        Ok(run.report)
    }

    async fn execute(&self, run: &mut Run<'_>) {
        info!("Starting bootstrap");

        for state in BootstrapState::STEPS {
            if state == BootstrapState::Done {
                run.report.states.push(state);
                break;
            }

            let started = Instant::now();
            let result = match run.check_continue() {
                Ok(()) => {
                    self.step(state, run)
                        .instrument(info_span!("step", step = %state))
                        .await
                }
                Err(err) => Err(err),
            };
            let elapsed = started.elapsed();
            metrics::observe_step_duration(state.as_str(), elapsed.as_secs_f64());

            match result {
                Ok(step) => {
                    info!(step = %state, outcome = ?step.outcome, detail = %step.detail, "Step complete");
                    run.report.states.push(state);
                    run.report.steps.push(StepReport {
                        state,
                        outcome: step.outcome,
                        detail: step.detail,
                        duration_ms: u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                    });
                }
                Err(err) => {
                    // A deadline that fired mid-step surfaces as cancellation
                    let err = match err {
                        Error::Cancelled(_) if Instant::now() >= run.deadline => {
                            Error::Cancelled("run deadline elapsed".into())
                        }
                        other => other,
                    };
                    let last_completed = run.report.last_completed();
                    error!(
                        step = %state,
                        %last_completed,
                        error_kind = err.kind(),
                        error = %err,
                        "Bootstrap failed"
                    );
                    run.report.failure = Some(FailureReport::new(state, last_completed, &err));
                    run.report.states.push(BootstrapState::Failed);
                    return;
                }
            }
        }

        info!(
            mutations = run.report.mutations(),
            commits = run.report.commits.iter().filter(|c| c.sha.is_some()).count(),
            "Bootstrap complete"
        );
    }

    async fn step(&self, state: BootstrapState, run: &mut Run<'_>) -> Result<Step> {
        match state {
            BootstrapState::RepoEnsured => self.ensure_repository(run).await,
            BootstrapState::CredentialEnsured => self.ensure_credential(run).await,
            BootstrapState::InstallCommitted => self.commit_install(run).await,
            BootstrapState::InstallApplied => self.apply_install(run).await,
            BootstrapState::ControllersReady => self.wait_controllers(run).await,
            BootstrapState::SyncCommitted => self.commit_and_apply_sync(run).await,
            BootstrapState::SourceReady => self.wait_source(run).await,
            BootstrapState::Init | BootstrapState::Done | BootstrapState::Failed => {
                Ok(Step::new(StepOutcome::Skipped, "no action"))
            }
        }
    }

    async fn ensure_repository(&self, run: &mut Run<'_>) -> Result<Step> {
        let spec = &run.request.repository;
        let step = BootstrapState::RepoEnsured.as_str();

        let (repo, step_result) = if run.request.dry_run {
            let existing = self
                .retry
                .run(step, &run.cancel, || {
                    self.provider.get_repository(&spec.owner, &spec.name)
                })
                .await?;
            match existing {
                Some(repo) => {
                    check_visibility(&repo, spec)?;
                    let detail = format!("repository {} exists", repo.full_name());
                    (repo, Step::new(StepOutcome::Satisfied, detail))
                }
                None if self.provider.capabilities().create_repository => {
                    let detail = format!(
                        "would create {} repository {}",
                        spec.visibility.as_str(),
                        spec.full_name()
                    );
                    info!(%detail, "Dry run");
                    (RepositoryRef::planned(spec), Step::new(StepOutcome::Planned, detail))
                }
                None => {
                    return Err(Error::config(format!(
                        "repository {} does not exist and {} cannot create it",
                        spec.full_name(),
                        self.provider.kind()
                    )))
                }
            }
        } else {
            let (repo, created) = self
                .retry
                .run(step, &run.cancel, || self.provider.ensure_repository(spec))
                .await?;
            let detail = if created {
                format!("created repository {}", repo.full_name())
            } else {
                format!("repository {} exists", repo.full_name())
            };
            (repo, Step::changed(created, false, detail))
        };

        run.manifests = Some(ManifestConfig::new(run.request, &repo)?);
        run.repo = Some(repo);
        Ok(step_result)
    }

    async fn ensure_credential(&self, run: &mut Run<'_>) -> Result<Step> {
        let provisioner = SecretProvisioner::new(
            Arc::clone(&self.provider),
            Arc::clone(&self.secrets),
            self.token.clone(),
        );
        let repo = run.repo()?;
        let credential = self
            .retry
            .run(BootstrapState::CredentialEnsured.as_str(), &run.cancel, || {
                provisioner.ensure_credential(run.request, repo)
            })
            .await?;

        let detail = if credential.is_satisfied() {
            format!(
                "credential {}/{} in place",
                credential.namespace, credential.secret_name
            )
        } else {
            credential.changes.join("; ")
        };
        let step = Step::changed(!credential.is_satisfied(), run.request.dry_run, detail);
        run.report.credential = Some(credential);
        Ok(step)
    }

    async fn commit_install(&self, run: &mut Run<'_>) -> Result<Step> {
        let set = self
            .generator
            .generate(ManifestKind::Install, run.manifests()?)?;
        let step = self
            .commit(run, BootstrapState::InstallCommitted, &set, INSTALL_COMMIT_MESSAGE)
            .await?;
        run.install = Some(set);
        Ok(step)
    }

    async fn apply_install(&self, run: &mut Run<'_>) -> Result<Step> {
        let set = run
            .install
            .clone()
            .ok_or_else(|| Error::Internal(anyhow::anyhow!("install manifests were not generated")))?;
        self.apply(run, BootstrapState::InstallApplied, &set).await
    }

    async fn wait_controllers(&self, run: &mut Run<'_>) -> Result<Step> {
        if run.request.dry_run {
            return Ok(Step::new(StepOutcome::Skipped, "dry run: controllers not awaited"));
        }
        let namespace = &run.request.namespace;
        let targets: Vec<ConvergenceTarget> = run
            .request
            .components
            .iter()
            .map(|component| ConvergenceTarget::deployment(namespace, component))
            .collect();

        self.poller(run)
            .wait_ready(&targets, run.readiness_timeout, &run.cancel)
            .await?;
        Ok(Step::new(
            StepOutcome::Satisfied,
            format!("{} controller deployments ready", targets.len()),
        ))
    }

    async fn commit_and_apply_sync(&self, run: &mut Run<'_>) -> Result<Step> {
        let set = self.generator.generate(ManifestKind::Sync, run.manifests()?)?;
        let commit = self
            .commit(run, BootstrapState::SyncCommitted, &set, SYNC_COMMIT_MESSAGE)
            .await?;
        let apply = self.apply(run, BootstrapState::SyncCommitted, &set).await?;

        let outcome = match (commit.outcome, apply.outcome) {
            (StepOutcome::Mutated, _) | (_, StepOutcome::Mutated) => StepOutcome::Mutated,
            (StepOutcome::Planned, _) | (_, StepOutcome::Planned) => StepOutcome::Planned,
            _ => StepOutcome::Satisfied,
        };
        Ok(Step::new(outcome, format!("{}; {}", commit.detail, apply.detail)))
    }

    async fn wait_source(&self, run: &mut Run<'_>) -> Result<Step> {
        if run.request.dry_run {
            return Ok(Step::new(StepOutcome::Skipped, "dry run: source not awaited"));
        }
        let namespace = &run.request.namespace;
        let source = ObjectRef::new(
            "source.toolkit.fluxcd.io/v1",
            "GitRepository",
            Some(namespace),
            namespace.as_str(),
        );
        let targets = [ConvergenceTarget::ready(source.clone())];

        self.poller(run)
            .wait_ready(&targets, run.readiness_timeout, &run.cancel)
            .await?;
        Ok(Step::new(StepOutcome::Satisfied, format!("{source} ready")))
    }

    /// Commit the changed files of `set`, recording the commit in the report
    async fn commit(
        &self,
        run: &mut Run<'_>,
        state: BootstrapState,
        set: &ManifestSet,
        message: &str,
    ) -> Result<Step> {
        let repo = run.repo()?;
        let branch = &run.request.repository.branch;

        if !repo.exists {
            let paths = set.paths();
            let result = CommitResult {
                sha: None,
                skipped: false,
                files: paths.clone(),
            };
            run.report.commits.push(CommitReport::new(state, &result));
            return Ok(Step::new(
                StepOutcome::Planned,
                format!("would commit {} to the new repository", paths.join(", ")),
            ));
        }

        let synchronizer = ManifestSynchronizer::new(
            Arc::clone(&self.provider),
            run.request.author.clone(),
            self.conflict_policy,
        );
        let outcome = self
            .retry
            .run(state.as_str(), &run.cancel, || {
                synchronizer.sync(repo, branch, set, message, run.request.dry_run)
            })
            .await?;

        let (result, step) = match outcome {
            SyncOutcome::Unchanged => (
                CommitResult::skipped(),
                Step::new(StepOutcome::Satisfied, "manifests up to date"),
            ),
            SyncOutcome::Committed(result) => {
                let detail = format!(
                    "committed {} as {}",
                    result.files.join(", "),
                    result.sha.as_deref().unwrap_or_default()
                );
                (result, Step::new(StepOutcome::Mutated, detail))
            }
            SyncOutcome::Planned(intent) => {
                let paths = intent.paths();
                let detail = format!("would commit {}", paths.join(", "));
                (
                    CommitResult {
                        sha: None,
                        skipped: false,
                        files: paths,
                    },
                    Step::new(StepOutcome::Planned, detail),
                )
            }
        };
        run.report.commits.push(CommitReport::new(state, &result));
        Ok(step)
    }

    /// Apply the objects of `set` that are missing or drifted
    async fn apply(&self, run: &Run<'_>, state: BootstrapState, set: &ManifestSet) -> Result<Step> {
        let step = state.as_str();
        let pending = self
            .retry
            .run(step, &run.cancel, || self.applier.pending(set))
            .await?;
        if pending.is_empty() {
            return Ok(Step::new(StepOutcome::Satisfied, "cluster objects up to date"));
        }

        let names: Vec<String> = pending.iter().map(ToString::to_string).collect();
        if run.request.dry_run {
            return Ok(Step::new(
                StepOutcome::Planned,
                format!("would apply {}", names.join(", ")),
            ));
        }

        let applied = self
            .retry
            .run(step, &run.cancel, || self.applier.apply(set))
            .await?;
        Ok(Step::new(
            StepOutcome::Mutated,
            format!("applied {} objects ({} drifted)", applied.len(), names.len()),
        ))
    }

    fn poller(&self, run: &Run<'_>) -> ReadinessPoller {
        ReadinessPoller::new(
            Arc::clone(&self.status),
            run.poll_interval,
            self.config.max_parallel_polls,
        )
    }
}
