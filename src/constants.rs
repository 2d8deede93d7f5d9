//! # Constants
//!
//! Shared constants used throughout the bootstrap.
//!
//! These values represent reasonable defaults and can be overridden via
//! configuration or environment variables where applicable.

/// Default namespace the controllers are installed into
pub const DEFAULT_NAMESPACE: &str = "flux-system";

/// Default branch committed to when the request does not name one
pub const DEFAULT_BRANCH: &str = "main";

/// Default repository path holding the cluster manifests
pub const DEFAULT_REPOSITORY_PATH: &str = "clusters/default";

/// Default name of the cluster secret holding the deploy credential
pub const DEFAULT_SECRET_NAME: &str = "flux-system";

/// Default controller components installed on the cluster
pub const DEFAULT_COMPONENTS: &[&str] = &[
    "source-controller",
    "kustomize-controller",
    "helm-controller",
    "notification-controller",
];

/// Default readiness poll interval (seconds)
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 2;

/// Default readiness timeout (seconds)
pub const DEFAULT_READINESS_TIMEOUT_SECS: u64 = 300;

/// Default aggregate run timeout (seconds)
/// Must be larger than the readiness timeout since a run waits twice
pub const DEFAULT_RUN_TIMEOUT_SECS: u64 = 900;

/// Upper bound for any configured timeout or interval (30 days)
/// Deadlines further out than this are clamped to it
pub const MAX_DURATION_SECS: u64 = 30 * 24 * 3600;

/// Default number of attempts for a transiently failing remote mutation
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 4;

/// Default exponential backoff starting value (milliseconds)
pub const DEFAULT_BACKOFF_START_MS: u64 = 500;

/// Default exponential backoff maximum value (milliseconds)
pub const DEFAULT_BACKOFF_MAX_MS: u64 = 10_000;

/// Default number of convergence targets polled at the same time
pub const DEFAULT_MAX_PARALLEL_POLLS: usize = 8;

/// Default HTTP request timeout against hosting providers (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Field manager used for server-side apply
pub const DEFAULT_FIELD_MANAGER: &str = "gitops-bootstrap";

/// Annotation recording the content hash of an applied object
pub const CONTENT_HASH_ANNOTATION: &str = "bootstrap.gitops.io/content-hash";

/// First line of every generated manifest
/// A file at a generated path without this marker is treated as unmanaged
pub const GENERATED_MARKER: &str = "# Generated by gitops-bootstrap. DO NOT EDIT.";

/// File names of the generated manifests, relative to `<path>/<namespace>`
pub const INSTALL_MANIFEST_FILE: &str = "gotk-components.yaml";
pub const SYNC_MANIFEST_FILE: &str = "gotk-sync.yaml";
pub const KUSTOMIZATION_FILE: &str = "kustomization.yaml";

/// Default RSA key size (bits)
pub const DEFAULT_RSA_KEY_BITS: u32 = 4096;

/// Default ECDSA curve size (bits)
pub const DEFAULT_ECDSA_KEY_BITS: u32 = 256;

/// Default commit author
pub const DEFAULT_AUTHOR_NAME: &str = "gitops-bootstrap";
pub const DEFAULT_AUTHOR_EMAIL: &str = "gitops-bootstrap@users.noreply.local";

/// Condition types reported by the controllers
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_AVAILABLE: &str = "Available";
pub const CONDITION_STALLED: &str = "Stalled";
pub const STATUS_TRUE: &str = "True";
