//! Kubernetes implementation of the cluster contracts.

use super::{
    annotate_with_hash, kind_priority, parse_objects, ClusterApplier, ObjectRef, ObjectStatus,
    SecretData, SecretStore, StatusReader,
};
use crate::constants::CONTENT_HASH_ANNOTATION;
use crate::error::{Error, Result};
use crate::manifests::ManifestSet;
use crate::observability::metrics;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::discovery::{pinned_kind, ApiCapabilities, ApiResource, Discovery, Scope};
use kube::config::KubeConfigOptions;
use kube::Client;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Cluster adapter backed by a `kube::Client`
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    field_manager: String,
}

impl std::fmt::Debug for KubeCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeCluster")
            .field("field_manager", &self.field_manager)
            .finish_non_exhaustive()
    }
}

impl KubeCluster {
    #[must_use]
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
        }
    }

    /// Connect using the ambient kubeconfig or in-cluster configuration
    pub async fn try_default(field_manager: impl Into<String>) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, field_manager))
    }

    /// Connect using a named kubeconfig context
    pub async fn for_context(context: &str, field_manager: impl Into<String>) -> Result<Self> {
        let options = KubeConfigOptions {
            context: Some(context.to_string()),
            ..KubeConfigOptions::default()
        };
        let config = kube::Config::from_kubeconfig(&options)
            .await
            .map_err(|e| Error::config(format!("failed to load kubeconfig context '{context}': {e}")))?;
        let client = Client::try_from(config)?;
        Ok(Self::new(client, field_manager))
    }

    fn apply_params(&self) -> PatchParams {
        PatchParams::apply(&self.field_manager).force()
    }

    async fn discover(&self) -> Result<Discovery> {
        Ok(Discovery::new(self.client.clone()).run().await?)
    }

    /// Dynamic API for `object`, `None` when the cluster does not serve its kind
    fn api_for(&self, discovery: &Discovery, object: &ObjectRef) -> Option<Api<DynamicObject>> {
        let (group, version) = object.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &object.kind);
        let (resource, capabilities) = discovery.resolve_gvk(&gvk)?;
        Some(self.dynamic_api(&resource, &capabilities, object))
    }

    fn dynamic_api(
        &self,
        resource: &ApiResource,
        capabilities: &ApiCapabilities,
        object: &ObjectRef,
    ) -> Api<DynamicObject> {
        match (&capabilities.scope, &object.namespace) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, resource),
            (Scope::Namespaced, None) => Api::default_namespaced_with(self.client.clone(), resource),
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), resource),
        }
    }

    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if api.get_opt(namespace).await?.is_some() {
            return Ok(());
        }

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        api.patch(namespace, &self.apply_params(), &Patch::Apply(&ns))
            .await?;
        info!(%namespace, "Created namespace");
        Ok(())
    }
}

#[async_trait]
impl ClusterApplier for KubeCluster {
    async fn pending(&self, set: &ManifestSet) -> Result<Vec<ObjectRef>> {
        let discovery = self.discover().await?;
        let mut pending = Vec::new();

        for object in parse_objects(set)? {
            let object_ref = ObjectRef::from_object(&object)?;
            let (_, hash) = annotate_with_hash(&object)?;

            // Kinds the cluster does not serve yet (CRDs not installed) are pending
            let Some(api) = self.api_for(&discovery, &object_ref) else {
                pending.push(object_ref);
                continue;
            };

            let current = api.get_opt(&object_ref.name).await?;
            let current_hash = current.as_ref().and_then(|o| {
                o.metadata
                    .annotations
                    .as_ref()
                    .and_then(|a| a.get(CONTENT_HASH_ANNOTATION))
            });
            if current_hash != Some(&hash) {
                debug!(object = %object_ref, "Object is missing or drifted");
                pending.push(object_ref);
            }
        }

        Ok(pending)
    }

    async fn apply(&self, set: &ManifestSet) -> Result<Vec<ObjectRef>> {
        let mut objects = parse_objects(set)?;
        objects.sort_by_key(|o| {
            o.types
                .as_ref()
                .map_or(u8::MAX, |t| kind_priority(&t.kind))
        });

        let (foundational, rest): (Vec<_>, Vec<_>) = objects.into_iter().partition(|o| {
            o.types
                .as_ref()
                .is_some_and(|t| t.kind == "Namespace" || t.kind == "CustomResourceDefinition")
        });

        let params = self.apply_params();
        let mut applied = Vec::new();

        // Discovery is refreshed after the CRDs so their kinds can be resolved
        for batch in [foundational, rest] {
            if batch.is_empty() {
                continue;
            }
            let discovery = self.discover().await?;
            for object in batch {
                let object_ref = ObjectRef::from_object(&object)?;
                let api = self.api_for(&discovery, &object_ref).ok_or_else(|| {
                    Error::transient(format!(
                        "{} {} is not served by the cluster yet",
                        object_ref.api_version, object_ref.kind
                    ))
                })?;
                let (annotated, _) = annotate_with_hash(&object)?;
                api.patch(&object_ref.name, &params, &Patch::Apply(&annotated))
                    .await?;
                debug!(object = %object_ref, "Applied object");
                applied.push(object_ref);
            }
        }

        metrics::increment_objects_applied(applied.len() as u64);
        info!(count = applied.len(), "Applied manifests");
        Ok(applied)
    }
}

#[async_trait]
impl SecretStore for KubeCluster {
    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Option<SecretData>> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let Some(secret) = api.get_opt(name).await? else {
            return Ok(None);
        };

        let mut data = SecretData::new();
        for (key, value) in secret.data.unwrap_or_default() {
            data.insert(key, String::from_utf8_lossy(&value.0).into_owned());
        }
        Ok(Some(data))
    }

    async fn put_secret(&self, namespace: &str, name: &str, data: &SecretData) -> Result<()> {
        self.ensure_namespace(namespace).await?;

        let encoded: BTreeMap<String, ByteString> = data
            .iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.as_bytes().to_vec())))
            .collect();
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            data: Some(encoded),
            ..Default::default()
        };

        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &self.apply_params(), &Patch::Apply(&secret))
            .await?;
        info!(%namespace, secret = %name, "Wrote credential secret");
        Ok(())
    }
}

#[async_trait]
impl StatusReader for KubeCluster {
    async fn read_status(&self, object: &ObjectRef) -> Result<Option<ObjectStatus>> {
        let (group, version) = object.group_version();
        let gvk = GroupVersionKind::gvk(group, version, &object.kind);

        // Only the one API group is queried, polls stay cheap
        let (resource, capabilities) = match pinned_kind(&self.client, &gvk).await {
            Ok(found) => found,
            Err(kube::Error::Discovery(_)) => return Ok(None),
            Err(kube::Error::Api(status)) if status.code == 404 => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        Ok(self
            .dynamic_api(&resource, &capabilities, object)
            .get_opt(&object.name)
            .await?
            .map(|o| ObjectStatus::from_object(&o)))
    }
}
