//! # Manifest Generator
//!
//! Produces the install and sync manifest sets. Output is deterministic:
//! identical configuration always yields byte-identical files, which is what
//! makes hash comparison a valid drift check.

use super::flux::{
    CrossNamespaceSourceReference, GitRepository, GitRepositoryRef, GitRepositorySpec,
    Kustomization, KustomizationSpec, LocalObjectReference,
};
use super::{ManifestFile, ManifestSet};
use crate::config::{BootstrapRequest, CredentialPolicy};
use crate::constants::{
    GENERATED_MARKER, INSTALL_MANIFEST_FILE, KUSTOMIZATION_FILE, SYNC_MANIFEST_FILE,
};
use crate::error::{Error, Result};
use crate::provider::RepositoryRef;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::BTreeSet;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestKind {
    /// Controller deployments, CRDs and RBAC
    Install,
    /// Source and Kustomization objects pointing the controllers at the repository
    Sync,
}

/// Everything the generator needs to know about a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestConfig {
    pub namespace: String,
    pub components: Vec<String>,
    /// Directory the generated files are committed to
    pub manifests_dir: String,
    /// Directory the Kustomization reconciles
    pub sync_path: String,
    pub branch: String,
    /// URL the source controller clones from
    pub url: String,
    pub secret_name: String,
}

impl ManifestConfig {
    /// Derive the configuration from a validated request and its repository
    ///
    /// Token credentials clone over HTTPS, deploy keys over SSH. The URL of a
    /// repository that does not exist yet (dry run) is left empty.
    pub fn new(request: &BootstrapRequest, repo: &RepositoryRef) -> Result<Self> {
        let url = match request.credential {
            CredentialPolicy::SuppliedToken { .. } => repo.http_url.clone(),
            _ => repo.clone_url.as_deref().map(normalize_ssh_url),
        };
        let url = match url {
            Some(url) => url,
            None if !repo.exists => String::new(),
            None => {
                return Err(Error::config(format!(
                    "cannot determine a clone URL for {}",
                    repo.full_name()
                )))
            }
        };

        let path = request.repository.path.trim_matches('/');
        Ok(Self {
            namespace: request.namespace.clone(),
            components: request.components.clone(),
            manifests_dir: request.manifests_dir(),
            sync_path: if path.is_empty() {
                "./".to_string()
            } else {
                format!("./{path}")
            },
            branch: request.repository.branch.clone(),
            url,
            secret_name: request.secret_name.clone(),
        })
    }

    fn file_path(&self, name: &str) -> String {
        format!("{}/{name}", self.manifests_dir)
    }
}

/// Turn `git@host:owner/repo.git` into `ssh://git@host/owner/repo.git`
#[must_use]
pub fn normalize_ssh_url(url: &str) -> String {
    if url.contains("://") {
        return url.to_string();
    }
    match url.split_once(':') {
        Some((host, path)) => format!("ssh://{host}/{}", path.trim_start_matches('/')),
        None => url.to_string(),
    }
}

/// Source of manifest sets
pub trait ManifestGenerator: Send + Sync + Debug {
    fn generate(&self, kind: ManifestKind, config: &ManifestConfig) -> Result<ManifestSet>;
}

/// Generator reading component manifests from a directory
///
/// The install set concatenates `<dir>/<component>.yaml` in component order,
/// after a Namespace object. The sync set is rendered from typed resources.
#[derive(Debug, Clone)]
pub struct DefaultGenerator {
    components_dir: PathBuf,
}

impl DefaultGenerator {
    pub fn new(components_dir: impl Into<PathBuf>) -> Self {
        Self {
            components_dir: components_dir.into(),
        }
    }

    /// Component names available in the components directory
    fn available_components(&self) -> Result<BTreeSet<String>> {
        if !self.components_dir.is_dir() {
            return Err(Error::config(format!(
                "components directory {} does not exist",
                self.components_dir.display()
            )));
        }

        let mut names = BTreeSet::new();
        for entry in WalkDir::new(&self.components_dir)
            .min_depth(1)
            .max_depth(1)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                Error::config(format!(
                    "failed to read components directory {}: {e}",
                    self.components_dir.display()
                ))
            })?;
            let path = entry.path();
            if entry.file_type().is_file() && has_yaml_extension(path) {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    names.insert(stem.to_string());
                }
            }
        }
        Ok(names)
    }

    fn component_file(&self, component: &str) -> PathBuf {
        let yaml = self.components_dir.join(format!("{component}.yaml"));
        if yaml.is_file() {
            yaml
        } else {
            self.components_dir.join(format!("{component}.yml"))
        }
    }

    fn install(&self, config: &ManifestConfig) -> Result<ManifestSet> {
        let available = self.available_components()?;
        let missing: Vec<&str> = config
            .components
            .iter()
            .filter(|c| !available.contains(c.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(Error::config(format!(
                "unknown components: {} (available: {})",
                missing.join(", "),
                available.into_iter().collect::<Vec<_>>().join(", ")
            )));
        }

        let mut content = format!(
            "{GENERATED_MARKER}\n# Components: {}\n---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: {}\n",
            config.components.join(","),
            config.namespace
        );
        for component in &config.components {
            let path = self.component_file(component);
            let body = std::fs::read_to_string(&path).map_err(|e| {
                Error::config(format!("failed to read {}: {e}", path.display()))
            })?;
            let body = body.trim();
            let body = body.strip_prefix("---").unwrap_or(body).trim_start();
            content.push_str("---\n");
            content.push_str(body);
            content.push('\n');
        }

        Ok(ManifestSet::new(vec![ManifestFile::new(
            config.file_path(INSTALL_MANIFEST_FILE),
            content,
        )]))
    }

    fn sync(&self, config: &ManifestConfig) -> Result<ManifestSet> {
        let metadata = ObjectMeta {
            name: Some(config.namespace.clone()),
            namespace: Some(config.namespace.clone()),
            ..Default::default()
        };

        let source = GitRepository {
            metadata: metadata.clone(),
            spec: GitRepositorySpec {
                interval: "1m0s".to_string(),
                reference: GitRepositoryRef {
                    branch: config.branch.clone(),
                },
                secret_ref: Some(LocalObjectReference {
                    name: config.secret_name.clone(),
                }),
                url: config.url.clone(),
            },
        };
        let kustomization = Kustomization {
            metadata,
            spec: KustomizationSpec {
                interval: "10m0s".to_string(),
                path: config.sync_path.clone(),
                prune: true,
                source_ref: CrossNamespaceSourceReference {
                    kind: "GitRepository".to_string(),
                    name: config.namespace.clone(),
                },
            },
        };

        let sync = format!(
            "{GENERATED_MARKER}\n---\n{}---\n{}",
            to_yaml(&source)?,
            to_yaml(&kustomization)?
        );
        let kustomize = format!(
            "{GENERATED_MARKER}\napiVersion: kustomize.config.k8s.io/v1beta1\nkind: Kustomization\nresources:\n- {INSTALL_MANIFEST_FILE}\n- {SYNC_MANIFEST_FILE}\n"
        );

        Ok(ManifestSet::new(vec![
            ManifestFile::new(config.file_path(SYNC_MANIFEST_FILE), sync),
            ManifestFile::new(config.file_path(KUSTOMIZATION_FILE), kustomize),
        ]))
    }
}

impl ManifestGenerator for DefaultGenerator {
    fn generate(&self, kind: ManifestKind, config: &ManifestConfig) -> Result<ManifestSet> {
        match kind {
            ManifestKind::Install => self.install(config),
            ManifestKind::Sync => self.sync(config),
        }
    }
}

fn has_yaml_extension(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yaml" | "yml")
    )
}

fn to_yaml<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_yaml::to_string(value)
        .map_err(|e| Error::Internal(anyhow::anyhow!("Failed to render manifest: {e}")))
}
