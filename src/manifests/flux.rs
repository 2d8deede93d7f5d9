//! # Flux Custom Resources
//!
//! The two objects that wire the controllers to the repository.
//!
//! # Example
//!
//! ```yaml
//! apiVersion: source.toolkit.fluxcd.io/v1
//! kind: GitRepository
//! metadata:
//!   name: flux-system
//!   namespace: flux-system
//! spec:
//!   interval: 1m0s
//!   ref:
//!     branch: main
//!   secretRef:
//!     name: flux-system
//!   url: ssh://git@github.com/acme/fleet
//! ```

use serde::{Deserialize, Serialize};

#[derive(kube::CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "GitRepository",
    group = "source.toolkit.fluxcd.io",
    version = "v1",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct GitRepositorySpec {
    pub interval: String,
    #[serde(rename = "ref")]
    pub reference: GitRepositoryRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct GitRepositoryRef {
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct LocalObjectReference {
    pub name: String,
}

#[derive(kube::CustomResource, Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
#[kube(
    kind = "Kustomization",
    group = "kustomize.toolkit.fluxcd.io",
    version = "v1",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct KustomizationSpec {
    pub interval: String,
    pub path: String,
    pub prune: bool,
    pub source_ref: CrossNamespaceSourceReference,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, schemars::JsonSchema)]
pub struct CrossNamespaceSourceReference {
    pub kind: String,
    pub name: String,
}
