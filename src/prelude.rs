//! Commonly used types, for `use gitops_bootstrap::prelude::*`.

pub use crate::cluster::{
    ClusterApplier, KubeCluster, ObjectRef, ObjectStatus, SecretData, SecretStore, StatusReader,
};
pub use crate::config::{
    BootstrapConfig, BootstrapRequest, CommitAuthor, CredentialPolicy, KeyAlgorithm, ProviderKind,
    RepositorySpec, Visibility,
};
pub use crate::credentials::{DeployCredential, SecretProvisioner};
pub use crate::error::{Error, Result};
pub use crate::manifests::{
    CommitIntent, CommitResult, ConflictPolicy, DefaultGenerator, ManifestConfig, ManifestFile,
    ManifestGenerator, ManifestKind, ManifestSet, ManifestSynchronizer, SyncOutcome,
};
pub use crate::provider::{create_provider, GitProvider, RepositoryRef};
pub use crate::readiness::{ConvergenceTarget, ReadinessPoller, ReadinessPredicate};
pub use crate::reconciler::{
    BootstrapReconciler, BootstrapReport, BootstrapState, RetryPolicy, StepOutcome,
};
