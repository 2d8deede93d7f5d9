//! End-to-end bootstrap runs against in-memory fakes
//!
//! Every test drives a full `BootstrapReconciler::run` through the
//! in-memory provider and cluster from `common`, then checks both the
//! returned report and the remote state left behind.

mod common;

use common::{status_with, Failure, FakeCluster, Harness, InMemoryProvider};
use gitops_bootstrap::cluster::ObjectRef;
use gitops_bootstrap::config::{BootstrapConfig, CredentialPolicy, ProviderKind};
use gitops_bootstrap::constants::GENERATED_MARKER;
use gitops_bootstrap::credentials::{
    public_key_fingerprint, IDENTITY_KEY, IDENTITY_PUB_KEY, KNOWN_HOSTS_KEY, PASSWORD_KEY,
    USERNAME_KEY,
};
use gitops_bootstrap::error::Error;
use gitops_bootstrap::manifests::ConflictPolicy;
use gitops_bootstrap::reconciler::{BootstrapState, StepOutcome};
use std::time::{Duration, Instant};
use zeroize::Zeroizing;

const COMPONENTS_PATH: &str = "clusters/prod/flux-system/gotk-components.yaml";
const SYNC_PATH: &str = "clusters/prod/flux-system/gotk-sync.yaml";
const KUSTOMIZATION_PATH: &str = "clusters/prod/flux-system/kustomization.yaml";

fn deployment(name: &str) -> ObjectRef {
    ObjectRef::new("apps/v1", "Deployment", Some("flux-system"), name)
}

#[tokio::test]
async fn test_fresh_bootstrap_reaches_done() {
    let harness = Harness::new();
    let report = harness.reconciler().run(&common::request()).await.unwrap();

    assert!(report.succeeded(), "{:?}", report.failure);
    assert_eq!(
        report.states,
        vec![
            BootstrapState::Init,
            BootstrapState::RepoEnsured,
            BootstrapState::CredentialEnsured,
            BootstrapState::InstallCommitted,
            BootstrapState::InstallApplied,
            BootstrapState::ControllersReady,
            BootstrapState::SyncCommitted,
            BootstrapState::SourceReady,
            BootstrapState::Done,
        ]
    );

    let state = harness.provider.state();
    let repo = state.repository.as_ref().unwrap();
    assert_eq!(repo.full_name(), "acme/fleet");
    assert_eq!(state.commits.len(), 2);
    assert_eq!(state.keys.len(), 1);
    assert!(state.keys[0].read_only);
    assert_eq!(state.keys[0].title, "gitops-fleet-flux-system");
    drop(state);

    let secret = harness.cluster.secret("flux-system", "flux-system").unwrap();
    assert!(secret.get(IDENTITY_KEY).unwrap().contains("OPENSSH PRIVATE KEY"));
    assert!(secret.get(KNOWN_HOSTS_KEY).unwrap().starts_with("example.com "));
    let fingerprint = public_key_fingerprint(secret.get(IDENTITY_PUB_KEY).unwrap()).unwrap();
    let credential = report.credential.as_ref().unwrap();
    assert_eq!(credential.fingerprint.as_deref(), Some(fingerprint.as_str()));
    assert!(credential.created);

    for path in [COMPONENTS_PATH, SYNC_PATH, KUSTOMIZATION_PATH] {
        let content = harness.provider.file("main", path).unwrap();
        assert!(content.starts_with(GENERATED_MARKER), "{path}");
    }
    // The sync source points at the SSH clone URL
    let sync = harness.provider.file("main", SYNC_PATH).unwrap();
    assert!(sync.contains("url: ssh://git@example.com/acme/fleet.git"));
    assert!(sync.contains("path: ./clusters/prod"));
}

#[tokio::test]
async fn test_converged_rerun_changes_nothing() {
    let harness = Harness::new();
    let request = common::request();
    harness.reconciler().run(&request).await.unwrap();
    let writes = harness.mutations();
    let commits = harness.provider.state().commits.len();

    let report = harness.reconciler().run(&request).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(report.mutations(), 0);
    assert_eq!(harness.mutations(), writes);
    assert_eq!(harness.provider.state().commits.len(), commits);
    for step in &report.steps {
        assert_eq!(step.outcome, StepOutcome::Satisfied, "{:?}", step.state);
    }
    assert!(report.commits.iter().all(|c| c.skipped && c.sha.is_none()));
    assert!(!report.credential.unwrap().created);
}

#[tokio::test]
async fn test_rerun_after_failure_resumes() {
    let harness = Harness::new();
    let request = common::request();
    harness.provider.fail("create_commit", Failure::Permanent);

    let report = harness.reconciler().run(&request).await.unwrap();

    assert!(!report.succeeded());
    assert_eq!(report.final_state(), BootstrapState::Failed);
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.step, BootstrapState::InstallCommitted);
    assert_eq!(failure.last_completed, BootstrapState::CredentialEnsured);
    assert_eq!(failure.error_kind, "auth");
    assert!(harness.cluster.state().objects.is_empty());

    harness.provider.clear_failures();
    let report = harness.reconciler().run(&request).await.unwrap();

    assert!(report.succeeded(), "{:?}", report.failure);
    assert_eq!(
        report.step(BootstrapState::RepoEnsured).unwrap().outcome,
        StepOutcome::Satisfied
    );
    assert_eq!(
        report.step(BootstrapState::CredentialEnsured).unwrap().outcome,
        StepOutcome::Satisfied
    );
    assert_eq!(
        report.step(BootstrapState::InstallCommitted).unwrap().outcome,
        StepOutcome::Mutated
    );
    assert_eq!(harness.provider.state().keys.len(), 1);
    assert_eq!(harness.cluster.state().secret_writes, 1);
}

#[tokio::test]
async fn test_rerun_after_apply_failure_resumes() {
    let harness = Harness::new();
    let request = common::request();
    harness.cluster.fail("apply", Failure::Transient(100));

    let report = harness.reconciler().run(&request).await.unwrap();

    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.step, BootstrapState::InstallApplied);
    assert_eq!(failure.last_completed, BootstrapState::InstallCommitted);
    assert_eq!(failure.error_kind, "transient");
    assert_eq!(harness.provider.state().commits.len(), 1);

    harness.cluster.clear_failures();
    let report = harness.reconciler().run(&request).await.unwrap();

    assert!(report.succeeded(), "{:?}", report.failure);
    for state in [
        BootstrapState::RepoEnsured,
        BootstrapState::CredentialEnsured,
        BootstrapState::InstallCommitted,
    ] {
        assert_eq!(
            report.step(state).unwrap().outcome,
            StepOutcome::Satisfied,
            "{state:?}"
        );
    }
    assert_eq!(
        report.step(BootstrapState::InstallApplied).unwrap().outcome,
        StepOutcome::Mutated
    );

    let commits = harness.provider.state().commits.clone();
    assert_eq!(commits.len(), 2);
    let paths: Vec<&str> = commits[1].changes.iter().map(|c| c.path.as_str()).collect();
    assert!(!paths.contains(&COMPONENTS_PATH), "{paths:?}");
    assert!(paths.contains(&SYNC_PATH), "{paths:?}");
    assert_eq!(harness.cluster.state().secret_writes, 1);
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let harness = Harness::new();
    harness.provider.fail("create_commit", Failure::Transient(2));
    harness.cluster.fail("apply", Failure::Transient(1));

    let report = harness.reconciler().run(&common::request()).await.unwrap();

    assert!(report.succeeded(), "{:?}", report.failure);
    assert_eq!(harness.provider.state().commits.len(), 2);
}

#[tokio::test]
async fn test_retries_give_up_after_max_attempts() {
    let harness = Harness::new();
    harness.provider.fail("get_repository", Failure::Transient(10));

    let report = harness.reconciler().run(&common::request()).await.unwrap();

    let failure = report.failure.unwrap();
    assert_eq!(failure.step, BootstrapState::RepoEnsured);
    assert_eq!(failure.last_completed, BootstrapState::Init);
    assert_eq!(failure.error_kind, "transient");
    assert_eq!(harness.mutations(), 0);
}

#[tokio::test]
async fn test_dry_run_reports_plan_without_writes() {
    let harness = Harness::new();
    let mut request = common::request();
    request.dry_run = true;

    let report = harness.reconciler().run(&request).await.unwrap();

    assert!(report.succeeded(), "{:?}", report.failure);
    assert!(report.dry_run);
    assert_eq!(harness.mutations(), 0);
    assert!(harness.provider.state().repository.is_none());
    assert!(harness.cluster.secret("flux-system", "flux-system").is_none());

    let outcome = |state| report.step(state).unwrap().outcome;
    assert_eq!(outcome(BootstrapState::RepoEnsured), StepOutcome::Planned);
    assert_eq!(outcome(BootstrapState::CredentialEnsured), StepOutcome::Planned);
    assert_eq!(outcome(BootstrapState::InstallCommitted), StepOutcome::Planned);
    assert_eq!(outcome(BootstrapState::InstallApplied), StepOutcome::Planned);
    assert_eq!(outcome(BootstrapState::ControllersReady), StepOutcome::Skipped);
    assert_eq!(outcome(BootstrapState::SyncCommitted), StepOutcome::Planned);
    assert_eq!(outcome(BootstrapState::SourceReady), StepOutcome::Skipped);

    let install = &report.commits[0];
    assert_eq!(install.step, BootstrapState::InstallCommitted);
    assert_eq!(install.files, vec![COMPONENTS_PATH.to_string()]);
    assert!(install.sha.is_none());
    assert!(!report.credential.unwrap().changes.is_empty());
}

#[tokio::test]
async fn test_dry_run_on_bootstrapped_cluster_is_satisfied() {
    let harness = Harness::new();
    let mut request = common::request();
    harness.reconciler().run(&request).await.unwrap();
    let writes = harness.mutations();

    request.dry_run = true;
    let report = harness.reconciler().run(&request).await.unwrap();

    assert_eq!(harness.mutations(), writes);
    assert!(report
        .steps
        .iter()
        .all(|s| matches!(s.outcome, StepOutcome::Satisfied | StepOutcome::Skipped)));
}

#[tokio::test]
async fn test_only_changed_files_are_committed() {
    let harness = Harness::new();
    let request = common::request();
    harness.reconciler().run(&request).await.unwrap();

    harness.generator.bump_revision();
    let report = harness.reconciler().run(&request).await.unwrap();

    assert!(report.succeeded());
    let state = harness.provider.state();
    assert_eq!(state.commits.len(), 3);
    let last = state.commits.last().unwrap();
    assert_eq!(last.paths(), vec![COMPONENTS_PATH.to_string()]);
    drop(state);

    assert_eq!(
        report.step(BootstrapState::InstallApplied).unwrap().outcome,
        StepOutcome::Mutated
    );
    assert_eq!(
        report.step(BootstrapState::SyncCommitted).unwrap().outcome,
        StepOutcome::Satisfied
    );
    assert!(report.commits[1].skipped);
}

#[tokio::test]
async fn test_unregistered_key_is_rotated() {
    let harness = Harness::new();
    let request = common::request();
    harness.reconciler().run(&request).await.unwrap();
    let old = harness.cluster.secret("flux-system", "flux-system").unwrap();
    let old_public = old.get(IDENTITY_PUB_KEY).unwrap().to_string();

    // Someone removed the deploy key from the repository settings
    harness.provider.state().keys.clear();
    let report = harness.reconciler().run(&request).await.unwrap();

    assert!(report.succeeded());
    let credential = report.credential.unwrap();
    assert!(credential.created);
    let secret = harness.cluster.secret("flux-system", "flux-system").unwrap();
    assert_ne!(secret.get(IDENTITY_PUB_KEY).unwrap(), old_public);
    let keys = harness.provider.state().keys.clone();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].fingerprint(), credential.fingerprint);
}

#[tokio::test]
async fn test_rotation_removes_superseded_key() {
    let harness = Harness::new();
    let request = common::request();
    harness.reconciler().run(&request).await.unwrap();

    // A secret without a usable key forces a new one under the same title
    harness.cluster.state().secrets.clear();
    let report = harness.reconciler().run(&request).await.unwrap();

    assert!(report.succeeded());
    let keys = harness.provider.state().keys.clone();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0].id, "2");
}

#[tokio::test]
async fn test_stale_known_hosts_is_rewritten() {
    let harness = Harness::new();
    let mut request = common::request();
    harness.reconciler().run(&request).await.unwrap();

    request.known_hosts = Some("example.com ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQ".into());
    let report = harness.reconciler().run(&request).await.unwrap();

    assert!(report.succeeded());
    assert_eq!(harness.provider.state().keys.len(), 1);
    assert_eq!(harness.cluster.state().secret_writes, 2);
    let secret = harness.cluster.secret("flux-system", "flux-system").unwrap();
    assert!(secret.get(KNOWN_HOSTS_KEY).unwrap().contains("ssh-rsa"));
}

#[tokio::test]
async fn test_reuse_existing_without_secret_fails() {
    let harness = Harness::new();
    let mut request = common::request();
    request.credential = CredentialPolicy::ReuseExisting;

    let report = harness.reconciler().run(&request).await.unwrap();

    let failure = report.failure.unwrap();
    assert_eq!(failure.step, BootstrapState::CredentialEnsured);
    assert_eq!(failure.error_kind, "config");
    assert!(harness.provider.state().keys.is_empty());
}

#[tokio::test]
async fn test_supplied_token_is_stored_once() {
    let harness = Harness::new();
    let mut request = common::request();
    request.credential = CredentialPolicy::SuppliedToken {
        username: "git".into(),
    };
    let token = Some(Zeroizing::new("glpat-secret".to_string()));

    let report = harness
        .reconciler()
        .with_token(token.clone())
        .run(&request)
        .await
        .unwrap();

    assert!(report.succeeded(), "{:?}", report.failure);
    let secret = harness.cluster.secret("flux-system", "flux-system").unwrap();
    assert_eq!(secret.get(USERNAME_KEY), Some("git"));
    assert_eq!(secret.get(PASSWORD_KEY), Some("glpat-secret"));
    assert!(harness.provider.state().keys.is_empty());
    let sync = harness.provider.file("main", SYNC_PATH).unwrap();
    assert!(sync.contains("url: https://example.com/acme/fleet.git"));

    let report = harness
        .reconciler()
        .with_token(token)
        .run(&request)
        .await
        .unwrap();
    assert_eq!(
        report.step(BootstrapState::CredentialEnsured).unwrap().outcome,
        StepOutcome::Satisfied
    );
    assert_eq!(harness.cluster.state().secret_writes, 1);
}

#[tokio::test]
async fn test_supplied_token_policy_requires_token() {
    let harness = Harness::new();
    let mut request = common::request();
    request.credential = CredentialPolicy::SuppliedToken {
        username: "git".into(),
    };

    let report = harness.reconciler().run(&request).await.unwrap();

    let failure = report.failure.unwrap();
    assert_eq!(failure.step, BootstrapState::CredentialEnsured);
    assert_eq!(failure.error_kind, "config");
    assert!(harness.cluster.secret("flux-system", "flux-system").is_none());
}

#[tokio::test]
async fn test_plain_server_without_deploy_key_api() {
    let harness = Harness::with(InMemoryProvider::server(), FakeCluster::new());
    let mut request = common::request();
    request.provider = ProviderKind::Server;
    request.endpoint = Some("ssh://git@git.example.com/infra/fleet.git".into());
    request.repository.owner = "infra".into();

    let report = harness.reconciler().run(&request).await.unwrap();

    assert!(report.succeeded(), "{:?}", report.failure);
    let credential = report.credential.unwrap();
    assert!(credential.key_id.is_none());
    assert!(credential.fingerprint.is_some());
    assert!(harness.provider.state().keys.is_empty());
    assert!(harness.cluster.secret("flux-system", "flux-system").is_some());
}

#[tokio::test]
async fn test_readiness_timeout_names_pending_targets() {
    let harness = Harness::with(InMemoryProvider::new(), FakeCluster::never_ready());
    harness
        .cluster
        .set_status(deployment("source-controller"), status_with(&[("Available", "True")]));
    let mut request = common::request();
    request.readiness_timeout = Some("300ms".into());

    let report = harness.reconciler().run(&request).await.unwrap();

    let failure = report.failure.unwrap();
    assert_eq!(failure.step, BootstrapState::ControllersReady);
    assert_eq!(failure.last_completed, BootstrapState::InstallApplied);
    assert_eq!(failure.error_kind, "timeout");
    assert_eq!(
        failure.targets,
        vec!["Deployment/flux-system/kustomize-controller".to_string()]
    );
}

#[tokio::test]
async fn test_stalled_controller_fails_fast() {
    let harness = Harness::with(InMemoryProvider::new(), FakeCluster::never_ready());
    harness.cluster.set_status(
        deployment("kustomize-controller"),
        status_with(&[("Stalled", "True")]),
    );
    let started = Instant::now();

    let report = harness.reconciler().run(&common::request()).await.unwrap();

    let failure = report.failure.unwrap();
    assert_eq!(failure.error_kind, "fatal-condition");
    assert!(failure.message.contains("Stalled=True"));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_unmanaged_file_is_a_conflict() {
    let harness = Harness::new();
    harness
        .provider
        .put_file("main", COMPONENTS_PATH, "# hand written\nkind: ConfigMap\n");

    let report = harness.reconciler().run(&common::request()).await.unwrap();

    let failure = report.failure.unwrap();
    assert_eq!(failure.step, BootstrapState::InstallCommitted);
    assert_eq!(failure.error_kind, "conflict");
    assert!(harness.provider.state().commits.is_empty());
    assert_eq!(
        harness.provider.file("main", COMPONENTS_PATH).unwrap(),
        "# hand written\nkind: ConfigMap\n"
    );
}

#[tokio::test]
async fn test_overwrite_policy_replaces_unmanaged_file() {
    let harness = Harness::new();
    harness
        .provider
        .put_file("main", COMPONENTS_PATH, "# hand written\nkind: ConfigMap\n");

    let report = harness
        .reconciler()
        .with_conflict_policy(ConflictPolicy::Overwrite)
        .run(&common::request())
        .await
        .unwrap();

    assert!(report.succeeded(), "{:?}", report.failure);
    let content = harness.provider.file("main", COMPONENTS_PATH).unwrap();
    assert!(content.starts_with(GENERATED_MARKER));
}

#[tokio::test]
async fn test_cancellation_stops_the_run() {
    let harness = Harness::with(InMemoryProvider::new(), FakeCluster::never_ready());
    let mut request = common::request();
    request.readiness_timeout = Some("30s".into());
    let reconciler = harness.reconciler();
    let cancel = reconciler.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        cancel.cancel();
    });
    let started = Instant::now();

    let report = reconciler.run(&request).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    let failure = report.failure.as_ref().unwrap();
    assert_eq!(failure.step, BootstrapState::ControllersReady);
    assert_eq!(failure.error_kind, "cancelled");
    assert_eq!(report.final_state(), BootstrapState::Failed);
}

#[tokio::test]
async fn test_run_deadline_cancels_the_run() {
    let harness = Harness::with(InMemoryProvider::new(), FakeCluster::never_ready());
    let mut request = common::request();
    request.readiness_timeout = Some("30s".into());
    request.run_timeout = Some("300ms".into());

    let report = harness.reconciler().run(&request).await.unwrap();

    let failure = report.failure.unwrap();
    assert_eq!(failure.error_kind, "cancelled");
    assert!(failure.message.contains("deadline"), "{}", failure.message);
}

#[tokio::test]
async fn test_invalid_request_is_rejected_before_any_call() {
    let harness = Harness::new();
    let mut request = common::request();
    request.namespace = "Not_A_Namespace".into();

    let err = harness.reconciler().run(&request).await.unwrap_err();

    assert!(matches!(err, Error::Config(_)));
    assert_eq!(harness.mutations(), 0);
    assert!(harness.provider.state().repository.is_none());
    assert_eq!(harness.cluster.state().status_reads, 0);
}

#[tokio::test]
async fn test_oversized_run_timeout_is_a_config_error() {
    let harness = Harness::new();
    let mut request = common::request();
    request.run_timeout = Some("18446744073709551615s".into());

    let err = harness.reconciler().run(&request).await.unwrap_err();

    assert!(matches!(err, Error::Config(_)), "{err:?}");
    assert_eq!(harness.mutations(), 0);
}

#[tokio::test]
async fn test_huge_configured_timeouts_are_clamped() {
    let harness = Harness::new();
    let mut request = common::request();
    request.readiness_timeout = None;
    request.run_timeout = None;
    let config = BootstrapConfig {
        run_timeout_secs: u64::MAX,
        readiness_timeout_secs: u64::MAX,
        ..BootstrapConfig::default()
    };

    let report = harness
        .reconciler_with_config(config)
        .run(&request)
        .await
        .unwrap();

    assert!(report.succeeded(), "{:?}", report.failure);
}

#[tokio::test]
async fn test_visibility_mismatch_is_a_conflict() {
    let harness = Harness::new();
    let request = common::request();
    harness.reconciler().run(&request).await.unwrap();

    let mut request = request;
    request.repository.visibility = gitops_bootstrap::config::Visibility::Public;
    let report = harness.reconciler().run(&request).await.unwrap();

    let failure = report.failure.unwrap();
    assert_eq!(failure.step, BootstrapState::RepoEnsured);
    assert_eq!(failure.error_kind, "conflict");
}
