//! Common test utilities
//!
//! Provides the rustls crypto provider setup for Pact tests and in-memory
//! fakes of the provider, the cluster and the manifest generator for the
//! bootstrap scenario tests.

#![allow(dead_code, reason = "each test binary uses a different subset")]

use async_trait::async_trait;
use gitops_bootstrap::cluster::{
    object_hash, parse_objects, ClusterApplier, ObjectCondition, ObjectRef, ObjectStatus,
    SecretData, SecretStore, StatusReader,
};
use gitops_bootstrap::config::{
    BootstrapConfig, BootstrapRequest, ProviderKind, RepositorySpec, Visibility,
};
use gitops_bootstrap::constants::GENERATED_MARKER;
use gitops_bootstrap::error::{Error, Result};
use gitops_bootstrap::manifests::{
    CommitIntent, ManifestConfig, ManifestFile, ManifestGenerator, ManifestKind, ManifestSet,
};
use gitops_bootstrap::provider::{
    Capabilities, DeployKey, GitProvider, NewDeployKey, RemoteFile, RepositoryRef,
};
use gitops_bootstrap::reconciler::{BootstrapReconciler, RetryPolicy};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

static RUSTLS_INIT: Once = Once::new();

/// Initialize rustls crypto provider for tests
///
/// This must be called before any async operations that use rustls.
/// Uses a `Once` to ensure it's only called once across all tests.
pub fn init_rustls() {
    RUSTLS_INIT.call_once(|| {
        // Ignore the error if another test binary thread installed it first
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// Injected failure for a named operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Failure {
    /// Fail transiently this many times, then succeed
    Transient(u32),
    /// Fail with an authentication error on every call
    Permanent,
}

#[derive(Debug, Default)]
struct Failures(BTreeMap<&'static str, Failure>);

impl Failures {
    fn check(&mut self, operation: &'static str) -> Result<()> {
        match self.0.get_mut(operation) {
            Some(Failure::Transient(0)) | None => Ok(()),
            Some(Failure::Transient(remaining)) => {
                *remaining -= 1;
                Err(Error::transient(format!("{operation}: 503 service unavailable")))
            }
            Some(Failure::Permanent) => Err(Error::auth("fake", format!("{operation} denied"))),
        }
    }
}

#[derive(Debug, Default)]
pub struct ProviderState {
    pub repository: Option<RepositoryRef>,
    /// branch -> path -> content
    pub files: BTreeMap<String, BTreeMap<String, String>>,
    pub keys: Vec<DeployKey>,
    pub next_key_id: u64,
    pub commits: Vec<CommitIntent>,
    /// Writes of any kind (repository, keys, commits)
    pub mutations: usize,
    failures: Failures,
}

/// Provider keeping the repository in memory
#[derive(Debug)]
pub struct InMemoryProvider {
    kind: ProviderKind,
    capabilities: Capabilities,
    state: Mutex<ProviderState>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::with_capabilities(
            ProviderKind::Github,
            Capabilities {
                deploy_keys: true,
                server_side_commit: true,
                create_repository: true,
            },
        )
    }

    /// A plain Git server: no keys, no repository creation
    pub fn server() -> Self {
        let provider = Self::with_capabilities(
            ProviderKind::Server,
            Capabilities {
                deploy_keys: false,
                server_side_commit: false,
                create_repository: false,
            },
        );
        provider.state().repository = Some(RepositoryRef {
            owner: "infra".into(),
            name: "fleet".into(),
            default_branch: "main".into(),
            visibility: None,
            exists: true,
            clone_url: Some("ssh://git@git.example.com/infra/fleet.git".into()),
            http_url: None,
        });
        provider
    }

    pub fn with_capabilities(kind: ProviderKind, capabilities: Capabilities) -> Self {
        Self {
            kind,
            capabilities,
            state: Mutex::new(ProviderState::default()),
        }
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap()
    }

    pub fn fail(&self, operation: &'static str, failure: Failure) {
        self.state().failures.0.insert(operation, failure);
    }

    pub fn clear_failures(&self) {
        self.state().failures.0.clear();
    }

    pub fn mutations(&self) -> usize {
        self.state().mutations
    }

    pub fn file(&self, branch: &str, path: &str) -> Option<String> {
        self.state().files.get(branch)?.get(path).cloned()
    }

    /// Write a file directly, as a user pushing to the repository would
    pub fn put_file(&self, branch: &str, path: &str, content: &str) {
        self.state()
            .files
            .entry(branch.to_string())
            .or_default()
            .insert(path.to_string(), content.to_string());
    }
}

#[async_trait]
impl GitProvider for InMemoryProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    async fn get_repository(&self, owner: &str, name: &str) -> Result<Option<RepositoryRef>> {
        let mut state = self.state();
        state.failures.check("get_repository")?;
        Ok(state
            .repository
            .clone()
            .filter(|r| r.owner == owner && r.name == name))
    }

    async fn create_repository(&self, spec: &RepositorySpec) -> Result<RepositoryRef> {
        let mut state = self.state();
        state.failures.check("create_repository")?;
        let repo = RepositoryRef {
            owner: spec.owner.clone(),
            name: spec.name.clone(),
            default_branch: spec.branch.clone(),
            visibility: Some(spec.visibility),
            exists: true,
            clone_url: Some(format!("git@example.com:{}.git", spec.full_name())),
            http_url: Some(format!("https://example.com/{}.git", spec.full_name())),
        };
        state.repository = Some(repo.clone());
        state.mutations += 1;
        Ok(repo)
    }

    async fn list_deploy_keys(&self, _repo: &RepositoryRef) -> Result<Vec<DeployKey>> {
        let mut state = self.state();
        state.failures.check("list_deploy_keys")?;
        Ok(state.keys.clone())
    }

    async fn add_deploy_key(&self, _repo: &RepositoryRef, key: &NewDeployKey) -> Result<String> {
        let mut state = self.state();
        state.failures.check("add_deploy_key")?;
        state.next_key_id += 1;
        let id = state.next_key_id.to_string();
        state.keys.push(DeployKey {
            id: id.clone(),
            title: key.title.clone(),
            key: key.key.clone(),
            read_only: key.read_only,
        });
        state.mutations += 1;
        Ok(id)
    }

    async fn delete_deploy_key(&self, _repo: &RepositoryRef, key_id: &str) -> Result<()> {
        let mut state = self.state();
        state.failures.check("delete_deploy_key")?;
        state.keys.retain(|k| k.id != key_id);
        state.mutations += 1;
        Ok(())
    }

    async fn read_files(
        &self,
        _repo: &RepositoryRef,
        branch: &str,
        paths: &[String],
    ) -> Result<BTreeMap<String, RemoteFile>> {
        let mut state = self.state();
        state.failures.check("read_files")?;
        let Some(files) = state.files.get(branch) else {
            return Ok(BTreeMap::new());
        };
        Ok(paths
            .iter()
            .filter_map(|path| {
                files.get(path).map(|content| {
                    (
                        path.clone(),
                        RemoteFile {
                            content: content.clone(),
                            revision: Some(format!("blob-{}", content.len())),
                        },
                    )
                })
            })
            .collect())
    }

    async fn create_commit(&self, _repo: &RepositoryRef, intent: &CommitIntent) -> Result<String> {
        let mut state = self.state();
        state.failures.check("create_commit")?;
        let branch = state.files.entry(intent.branch.clone()).or_default();
        for change in &intent.changes {
            branch.insert(change.path.clone(), change.content.clone());
        }
        state.commits.push(intent.clone());
        state.mutations += 1;
        Ok(format!("sha-{}", state.commits.len()))
    }
}

#[derive(Debug, Default)]
pub struct ClusterState {
    /// Applied objects and their content hash
    pub objects: BTreeMap<ObjectRef, String>,
    pub secrets: BTreeMap<(String, String), SecretData>,
    pub statuses: BTreeMap<ObjectRef, ObjectStatus>,
    /// Objects applied, counted per object
    pub applies: usize,
    pub secret_writes: usize,
    pub status_reads: usize,
    failures: Failures,
}

/// Cluster keeping objects and secrets in memory
///
/// With `auto_ready`, applied deployments become Available and applied
/// GitRepositories become Ready immediately.
#[derive(Debug)]
pub struct FakeCluster {
    auto_ready: bool,
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self {
            auto_ready: true,
            state: Mutex::new(ClusterState::default()),
        }
    }

    /// Applied objects never report readiness on their own
    pub fn never_ready() -> Self {
        Self {
            auto_ready: false,
            state: Mutex::new(ClusterState::default()),
        }
    }

    pub fn state(&self) -> std::sync::MutexGuard<'_, ClusterState> {
        self.state.lock().unwrap()
    }

    pub fn fail(&self, operation: &'static str, failure: Failure) {
        self.state().failures.0.insert(operation, failure);
    }

    pub fn clear_failures(&self) {
        self.state().failures.0.clear();
    }

    /// Object and secret writes
    pub fn mutations(&self) -> usize {
        let state = self.state();
        state.applies + state.secret_writes
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<SecretData> {
        self.state()
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn set_status(&self, object: ObjectRef, status: ObjectStatus) {
        self.state().statuses.insert(object, status);
    }
}

/// Status with the given conditions at generation 1
pub fn status_with(conditions: &[(&str, &str)]) -> ObjectStatus {
    ObjectStatus {
        generation: Some(1),
        observed_generation: Some(1),
        conditions: conditions
            .iter()
            .map(|(type_, status)| ObjectCondition {
                type_: (*type_).to_string(),
                status: (*status).to_string(),
                reason: None,
                message: Some(format!("{type_} is {status}")),
            })
            .collect(),
    }
}

#[async_trait]
impl ClusterApplier for FakeCluster {
    async fn pending(&self, set: &ManifestSet) -> Result<Vec<ObjectRef>> {
        let mut state = self.state();
        state.failures.check("pending")?;
        let mut pending = Vec::new();
        for object in parse_objects(set)? {
            let reference = ObjectRef::from_object(&object)?;
            let hash = object_hash(&object)?;
            if state.objects.get(&reference) != Some(&hash) {
                pending.push(reference);
            }
        }
        Ok(pending)
    }

    async fn apply(&self, set: &ManifestSet) -> Result<Vec<ObjectRef>> {
        let mut state = self.state();
        state.failures.check("apply")?;
        let mut applied = Vec::new();
        for object in parse_objects(set)? {
            let reference = ObjectRef::from_object(&object)?;
            let hash = object_hash(&object)?;
            if self.auto_ready {
                let condition = match reference.kind.as_str() {
                    "Deployment" => Some("Available"),
                    "GitRepository" => Some("Ready"),
                    _ => None,
                };
                if let Some(condition) = condition {
                    state
                        .statuses
                        .insert(reference.clone(), status_with(&[(condition, "True")]));
                }
            }
            state.objects.insert(reference.clone(), hash);
            state.applies += 1;
            applied.push(reference);
        }
        Ok(applied)
    }
}

#[async_trait]
impl SecretStore for FakeCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        let mut state = self.state();
        state.failures.check("get_secret")?;
        Ok(state
            .secrets
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }

    async fn put_secret(&self, namespace: &str, name: &str, data: &SecretData) -> Result<()> {
        let mut state = self.state();
        state.failures.check("put_secret")?;
        state
            .secrets
            .insert((namespace.to_string(), name.to_string()), data.clone());
        state.secret_writes += 1;
        Ok(())
    }
}

#[async_trait]
impl StatusReader for FakeCluster {
    async fn read_status(&self, object: &ObjectRef) -> Result<Option<ObjectStatus>> {
        let mut state = self.state();
        state.failures.check("read_status")?;
        state.status_reads += 1;
        Ok(state.statuses.get(object).cloned())
    }
}

/// Generator rendering small, deterministic manifests
///
/// Bumping the revision changes the install manifests only.
#[derive(Debug, Default)]
pub struct FixedGenerator {
    revision: AtomicU32,
}

impl FixedGenerator {
    pub fn bump_revision(&self) {
        self.revision.fetch_add(1, Ordering::SeqCst);
    }
}

impl ManifestGenerator for FixedGenerator {
    fn generate(&self, kind: ManifestKind, config: &ManifestConfig) -> Result<ManifestSet> {
        let ns = &config.namespace;
        let dir = &config.manifests_dir;
        match kind {
            ManifestKind::Install => {
                let revision = self.revision.load(Ordering::SeqCst);
                let mut content = format!(
                    "{GENERATED_MARKER}\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: {ns}\n"
                );
                for component in &config.components {
                    content.push_str(&format!(
                        "---\napiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {component}\n  namespace: {ns}\n  labels:\n    revision: \"{revision}\"\n"
                    ));
                }
                Ok(ManifestSet::new(vec![ManifestFile::new(
                    format!("{dir}/gotk-components.yaml"),
                    content,
                )]))
            }
            ManifestKind::Sync => {
                let sync = format!(
                    "{GENERATED_MARKER}\n---\napiVersion: source.toolkit.fluxcd.io/v1\nkind: GitRepository\nmetadata:\n  name: {ns}\n  namespace: {ns}\nspec:\n  url: {url}\n  ref:\n    branch: {branch}\n---\napiVersion: kustomize.toolkit.fluxcd.io/v1\nkind: Kustomization\nmetadata:\n  name: {ns}\n  namespace: {ns}\nspec:\n  path: {path}\n",
                    url = config.url,
                    branch = config.branch,
                    path = config.sync_path,
                );
                let kustomization = format!(
                    "{GENERATED_MARKER}\napiVersion: kustomize.config.k8s.io/v1beta1\nkind: Kustomization\nresources:\n- gotk-components.yaml\n- gotk-sync.yaml\n"
                );
                Ok(ManifestSet::new(vec![
                    ManifestFile::new(format!("{dir}/gotk-sync.yaml"), sync),
                    ManifestFile::new(format!("{dir}/kustomization.yaml"), kustomization),
                ]))
            }
        }
    }
}

/// Request for `acme/fleet` on the in-memory provider
pub fn request() -> BootstrapRequest {
    let mut request = BootstrapRequest::new(
        ProviderKind::Github,
        RepositorySpec {
            owner: "acme".into(),
            name: "fleet".into(),
            branch: "main".into(),
            path: "clusters/prod".into(),
            visibility: Visibility::Private,
            personal: false,
        },
    );
    request.components = vec!["source-controller".into(), "kustomize-controller".into()];
    request.known_hosts = Some("example.com ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl".into());
    request.poll_interval = Some("10ms".into());
    request.readiness_timeout = Some("2s".into());
    request
}

/// Everything a scenario test needs, sharing one provider and cluster across runs
#[derive(Debug)]
pub struct Harness {
    pub provider: Arc<InMemoryProvider>,
    pub cluster: Arc<FakeCluster>,
    pub generator: Arc<FixedGenerator>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(InMemoryProvider::new(), FakeCluster::new())
    }

    pub fn with(provider: InMemoryProvider, cluster: FakeCluster) -> Self {
        Self {
            provider: Arc::new(provider),
            cluster: Arc::new(cluster),
            generator: Arc::new(FixedGenerator::default()),
        }
    }

    /// A reconciler with millisecond backoff
    pub fn reconciler(&self) -> BootstrapReconciler {
        self.reconciler_with_config(BootstrapConfig::default())
    }

    pub fn reconciler_with_config(&self, config: BootstrapConfig) -> BootstrapReconciler {
        let provider: Arc<dyn GitProvider> = Arc::clone(&self.provider) as Arc<dyn GitProvider>;
        let generator: Arc<dyn ManifestGenerator> =
            Arc::clone(&self.generator) as Arc<dyn ManifestGenerator>;
        BootstrapReconciler::with_cluster(
            provider,
            Arc::clone(&self.cluster),
            generator,
            config,
        )
        .with_retry_policy(RetryPolicy {
            max_attempts: 4,
            start: Duration::from_millis(1),
            max: Duration::from_millis(5),
        })
    }

    /// Writes to the provider and the cluster so far
    pub fn mutations(&self) -> usize {
        self.provider.mutations() + self.cluster.mutations()
    }
}
