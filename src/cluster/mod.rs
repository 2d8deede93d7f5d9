//! # Cluster Adapter
//!
//! Contracts for everything the bootstrap needs from the Kubernetes API:
//!
//! - [`ClusterApplier`]: server-side apply of a [`ManifestSet`] plus the
//!   drift check used to skip a satisfied apply step
//! - [`SecretStore`]: the credential secret
//! - [`StatusReader`]: generation and conditions of any object
//!
//! [`KubeCluster`] implements all three on a `kube::Client`.

use crate::constants::CONTENT_HASH_ANNOTATION;
use crate::error::{Error, Result};
use crate::manifests::ManifestSet;
use async_trait::async_trait;
use kube::api::DynamicObject;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt::{self, Debug};
use zeroize::Zeroizing;

mod kube_cluster;

pub use kube_cluster::KubeCluster;

/// Reference to a Kubernetes object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub api_version: String,
    pub kind: String,
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectRef {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Build a reference from a parsed manifest object
    pub fn from_object(obj: &DynamicObject) -> Result<Self> {
        let types = obj.types.as_ref().ok_or_else(|| {
            Error::Internal(anyhow::anyhow!("manifest object is missing apiVersion/kind"))
        })?;
        let name = obj.metadata.name.clone().ok_or_else(|| {
            Error::Internal(anyhow::anyhow!(
                "{} manifest is missing metadata.name",
                types.kind
            ))
        })?;
        Ok(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            namespace: obj.metadata.namespace.clone(),
            name,
        })
    }

    /// `(group, version)` split of the apiVersion
    #[must_use]
    pub fn group_version(&self) -> (&str, &str) {
        self.api_version
            .split_once('/')
            .unwrap_or(("", self.api_version.as_str()))
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}/{}", self.kind, ns, self.name),
            None => write!(f, "{}/{}", self.kind, self.name),
        }
    }
}

/// Status condition as reported by controllers
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

/// The parts of an object's state the readiness poller looks at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectStatus {
    pub generation: Option<i64>,
    pub observed_generation: Option<i64>,
    pub conditions: Vec<ObjectCondition>,
}

impl ObjectStatus {
    /// Extract generation and status fields from a raw object
    #[must_use]
    pub fn from_object(obj: &DynamicObject) -> Self {
        let status = obj.data.get("status");
        let observed_generation = status
            .and_then(|s| s.get("observedGeneration"))
            .and_then(serde_json::Value::as_i64);
        let conditions = status
            .and_then(|s| s.get("conditions"))
            .and_then(|c| serde_json::from_value::<Vec<ObjectCondition>>(c.clone()).ok())
            .unwrap_or_default();

        Self {
            generation: obj.metadata.generation,
            observed_generation,
            conditions,
        }
    }

    #[must_use]
    pub fn condition(&self, type_: &str) -> Option<&ObjectCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }
}

/// Data of the credential secret
///
/// Values are wiped on drop and never printed by `Debug`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SecretData(BTreeMap<String, Zeroizing<String>>);

impl SecretData {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), Zeroizing::new(value.into()));
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(|v| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Debug for SecretData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.keys()).finish()
    }
}

/// Server-side apply of manifest sets
#[async_trait]
pub trait ClusterApplier: Send + Sync + Debug {
    /// Objects of `set` that are missing or whose content hash differs
    async fn pending(&self, set: &ManifestSet) -> Result<Vec<ObjectRef>>;

    /// Apply every object of `set`, returning the applied references
    async fn apply(&self, set: &ManifestSet) -> Result<Vec<ObjectRef>>;
}

/// Storage of the deploy credential
#[async_trait]
pub trait SecretStore: Send + Sync + Debug {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>>;

    /// Create or replace the secret, creating the namespace when needed
    async fn put_secret(&self, namespace: &str, name: &str, data: &SecretData) -> Result<()>;
}

#[async_trait]
pub trait StatusReader: Send + Sync + Debug {
    /// Current status of `object`, `None` when it does not exist (yet)
    async fn read_status(&self, object: &ObjectRef) -> Result<Option<ObjectStatus>>;
}

/// Parse every YAML document of a manifest set into objects
///
/// Empty documents and non-object documents (comments only) are skipped.
pub fn parse_objects(set: &ManifestSet) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for file in set.files() {
        for document in serde_yaml::Deserializer::from_str(&file.content) {
            let value = serde_yaml::Value::deserialize(document).map_err(|e| {
                Error::Internal(anyhow::anyhow!("Invalid YAML in {}: {e}", file.path))
            })?;
            if !value.is_mapping() {
                continue;
            }
            // kustomization.yaml is a build file, not a cluster object
            if value.get("kind").and_then(serde_yaml::Value::as_str) == Some("Kustomization")
                && value
                    .get("apiVersion")
                    .and_then(serde_yaml::Value::as_str)
                    .is_some_and(|v| v.starts_with("kustomize.config.k8s.io"))
            {
                continue;
            }
            let object: DynamicObject = serde_yaml::from_value(value).map_err(|e| {
                Error::Internal(anyhow::anyhow!(
                    "Invalid Kubernetes object in {}: {e}",
                    file.path
                ))
            })?;
            objects.push(object);
        }
    }
    Ok(objects)
}

/// Deterministic hash of an object's content
///
/// Computed before the hash annotation is added; `serde_json` maps are
/// ordered, so equal content always yields the same hash.
pub fn object_hash(obj: &DynamicObject) -> Result<String> {
    let mut unannotated = obj.clone();
    if let Some(annotations) = unannotated.metadata.annotations.as_mut() {
        annotations.remove(CONTENT_HASH_ANNOTATION);
    }
    let value = serde_json::to_value(&unannotated)
        .map_err(|e| Error::Internal(anyhow::anyhow!("Failed to serialize object: {e}")))?;
    let canonical = serde_json::to_string(&value)
        .map_err(|e| Error::Internal(anyhow::anyhow!("Failed to serialize object: {e}")))?;
    Ok(format!("{:x}", Sha256::digest(canonical.as_bytes())))
}

/// Copy of `obj` carrying its content hash annotation
pub fn annotate_with_hash(obj: &DynamicObject) -> Result<(DynamicObject, String)> {
    let hash = object_hash(obj)?;
    let mut annotated = obj.clone();
    annotated
        .metadata
        .annotations
        .get_or_insert_with(BTreeMap::new)
        .insert(CONTENT_HASH_ANNOTATION.to_string(), hash.clone());
    Ok((annotated, hash))
}

/// Application order: namespaces and CRDs first, workloads after their config
#[must_use]
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "Service" => 6,
        "Deployment" | "DaemonSet" | "StatefulSet" => 7,
        _ => 10,
    }
}
