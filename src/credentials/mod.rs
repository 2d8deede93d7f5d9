//! # Secret Provisioner
//!
//! Makes sure the cluster holds a credential the source controller can pull
//! the repository with, and that the provider accepts it.
//!
//! The secret is the only durable record: a stored key whose fingerprint is
//! still registered with the provider is reused as is, so a converged re-run
//! performs no writes. Rotation registers the new key first, removes the keys
//! it supersedes (same title) and only then overwrites the secret.

use crate::cluster::{SecretData, SecretStore};
use crate::config::{BootstrapRequest, CredentialPolicy};
use crate::error::{Error, Result};
use crate::provider::{DeployKey, GitProvider, NewDeployKey, RepositoryRef};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

pub mod keys;

pub use keys::{generate_key, public_key_fingerprint, token_fingerprint, GeneratedKey};

/// Secret keys of an SSH credential
pub const IDENTITY_KEY: &str = "identity";
pub const IDENTITY_PUB_KEY: &str = "identity.pub";
pub const KNOWN_HOSTS_KEY: &str = "known_hosts";
/// Secret keys of a token credential
pub const USERNAME_KEY: &str = "username";
pub const PASSWORD_KEY: &str = "password";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub enum CredentialKind {
    SshKey,
    Token,
}

/// Summary of the credential in place after [`SecretProvisioner::ensure_credential`]
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployCredential {
    pub kind: CredentialKind,
    /// Public key or token fingerprint, `None` for a planned key
    pub fingerprint: Option<String>,
    pub secret_name: String,
    pub namespace: String,
    /// Provider registration id of the deploy key
    pub key_id: Option<String>,
    /// A new credential was generated or stored
    pub created: bool,
    /// Mutations made (or planned, in dry-run); empty when already satisfied
    pub changes: Vec<String>,
}

impl DeployCredential {
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        self.changes.is_empty()
    }
}

pub struct SecretProvisioner {
    provider: Arc<dyn GitProvider>,
    secrets: Arc<dyn SecretStore>,
    token: Option<Zeroizing<String>>,
}

impl fmt::Debug for SecretProvisioner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretProvisioner")
            .field("provider", &self.provider.kind())
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

/// Outcome of a single plan-or-apply decision
struct Plan {
    dry_run: bool,
    changes: Vec<String>,
}

impl Plan {
    fn new(dry_run: bool) -> Self {
        Self {
            dry_run,
            changes: Vec::new(),
        }
    }

    fn record(&mut self, change: impl Into<String>) {
        let change = change.into();
        if self.dry_run {
            info!(%change, "Dry run: planned credential change");
        }
        self.changes.push(change);
    }
}

impl SecretProvisioner {
    pub fn new(
        provider: Arc<dyn GitProvider>,
        secrets: Arc<dyn SecretStore>,
        token: Option<Zeroizing<String>>,
    ) -> Self {
        Self {
            provider,
            secrets,
            token,
        }
    }

    /// Ensure the credential named by the request exists and is usable
    pub async fn ensure_credential(
        &self,
        request: &BootstrapRequest,
        repo: &RepositoryRef,
    ) -> Result<DeployCredential> {
        let existing = self
            .secrets
            .get_secret(&request.namespace, &request.secret_name)
            .await?;

        match &request.credential {
            CredentialPolicy::Generate => self.ensure_generated(request, repo, existing).await,
            CredentialPolicy::ReuseExisting => {
                self.ensure_existing(request, repo, existing).await
            }
            CredentialPolicy::SuppliedToken { username } => {
                self.ensure_token(request, username, existing).await
            }
        }
    }

    async fn registered_keys(&self, repo: &RepositoryRef) -> Result<Vec<DeployKey>> {
        // A repository planned for creation in dry-run has no keys yet
        if !repo.exists || !self.provider.capabilities().deploy_keys {
            return Ok(Vec::new());
        }
        self.provider.list_deploy_keys(repo).await
    }

    async fn ensure_generated(
        &self,
        request: &BootstrapRequest,
        repo: &RepositoryRef,
        existing: Option<SecretData>,
    ) -> Result<DeployCredential> {
        let deploy_keys = self.provider.capabilities().deploy_keys;
        let registered = self.registered_keys(repo).await?;
        let mut plan = Plan::new(request.dry_run);

        if let Some(secret) = &existing {
            match stored_fingerprint(secret) {
                Some(fingerprint) if !deploy_keys => {
                    warn!(
                        provider = %self.provider.kind(),
                        %fingerprint,
                        "Provider cannot manage deploy keys; the stored key must be authorised out of band"
                    );
                    return Ok(self.credential(request, CredentialKind::SshKey, Some(fingerprint), None, false, plan));
                }
                Some(fingerprint) => {
                    if let Some(key) = find_key(&registered, &fingerprint) {
                        let key_id = key.id.clone();
                        if let Some(known_hosts) = stale_known_hosts(request, secret) {
                            let mut data = secret.clone();
                            data.insert(KNOWN_HOSTS_KEY, known_hosts);
                            self.write_secret(request, &data, &mut plan).await?;
                        }
                        debug!(%fingerprint, %key_id, "Reusing registered deploy key");
                        return Ok(self.credential(
                            request,
                            CredentialKind::SshKey,
                            Some(fingerprint),
                            Some(key_id),
                            false,
                            plan,
                        ));
                    }
                    info!(%fingerprint, "Stored deploy key is no longer registered; rotating");
                }
                None => warn!(
                    secret = %request.secret_name,
                    "Secret does not hold a usable SSH key; replacing it"
                ),
            }
        }

        let title = request.deploy_key_title();
        if request.dry_run {
            plan.record(format!(
                "generate {} deploy key",
                request.key_algorithm.as_str()
            ));
            if deploy_keys {
                plan.record(format!("register deploy key '{title}' on {}", repo.full_name()));
            }
            plan.record(format!(
                "write secret {}/{}",
                request.namespace, request.secret_name
            ));
            return Ok(self.credential(request, CredentialKind::SshKey, None, None, true, plan));
        }

        let key = generate_key(request.key_algorithm, request.effective_key_bits(), &title)?;
        plan.record(format!(
            "generated {} deploy key {}",
            request.key_algorithm.as_str(),
            key.fingerprint
        ));

        let key_id = if deploy_keys {
            let id = self
                .provider
                .register_deploy_key(
                    repo,
                    &NewDeployKey {
                        title: title.clone(),
                        key: key.public_openssh.clone(),
                        read_only: true,
                    },
                )
                .await?;
            plan.record(format!("registered deploy key '{title}' ({id})"));
            let removed = self.provider.remove_superseded_keys(repo, &title, &id).await?;
            if removed > 0 {
                plan.record(format!("removed {removed} superseded deploy key(s)"));
            }
            Some(id)
        } else {
            warn!(
                provider = %self.provider.kind(),
                fingerprint = %key.fingerprint,
                public_key = %key.public_openssh,
                "Provider cannot manage deploy keys; authorise this public key on the Git server out of band"
            );
            None
        };

        let mut data = SecretData::new();
        data.insert(IDENTITY_KEY, key.private_openssh.as_str());
        data.insert(IDENTITY_PUB_KEY, key.public_openssh.as_str());
        if let Some(known_hosts) = &request.known_hosts {
            data.insert(KNOWN_HOSTS_KEY, known_hosts.as_str());
        } else {
            warn!("No known_hosts supplied; the source controller will refuse unknown SSH hosts");
        }
        self.write_secret(request, &data, &mut plan).await?;

        Ok(self.credential(
            request,
            CredentialKind::SshKey,
            Some(key.fingerprint.clone()),
            key_id,
            true,
            plan,
        ))
    }

    async fn ensure_existing(
        &self,
        request: &BootstrapRequest,
        repo: &RepositoryRef,
        existing: Option<SecretData>,
    ) -> Result<DeployCredential> {
        let secret = existing.ok_or_else(|| {
            Error::config(format!(
                "secret {}/{} does not exist and the credential policy forbids generating one",
                request.namespace, request.secret_name
            ))
        })?;
        let public = stored_public_key(&secret).ok_or_else(|| {
            Error::config(format!(
                "secret {}/{} does not hold an SSH identity",
                request.namespace, request.secret_name
            ))
        })?;
        let fingerprint = public_key_fingerprint(&public)?;
        let mut plan = Plan::new(request.dry_run);

        if !self.provider.capabilities().deploy_keys {
            warn!(
                provider = %self.provider.kind(),
                %fingerprint,
                "Provider cannot manage deploy keys; the stored key must be authorised out of band"
            );
            return Ok(self.credential(request, CredentialKind::SshKey, Some(fingerprint), None, false, plan));
        }

        let registered = self.registered_keys(repo).await?;
        if let Some(key) = find_key(&registered, &fingerprint) {
            let key_id = key.id.clone();
            return Ok(self.credential(
                request,
                CredentialKind::SshKey,
                Some(fingerprint),
                Some(key_id),
                false,
                plan,
            ));
        }

        let title = request.deploy_key_title();
        if request.dry_run {
            plan.record(format!("register deploy key '{title}' on {}", repo.full_name()));
            return Ok(self.credential(request, CredentialKind::SshKey, Some(fingerprint), None, false, plan));
        }

        let id = self
            .provider
            .register_deploy_key(
                repo,
                &NewDeployKey {
                    title: title.clone(),
                    key: public,
                    read_only: true,
                },
            )
            .await?;
        plan.record(format!("registered deploy key '{title}' ({id})"));
        let removed = self.provider.remove_superseded_keys(repo, &title, &id).await?;
        if removed > 0 {
            plan.record(format!("removed {removed} superseded deploy key(s)"));
        }

        Ok(self.credential(request, CredentialKind::SshKey, Some(fingerprint), Some(id), false, plan))
    }

    async fn ensure_token(
        &self,
        request: &BootstrapRequest,
        username: &str,
        existing: Option<SecretData>,
    ) -> Result<DeployCredential> {
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| Error::config("the supplied-token credential policy requires a token"))?;
        let fingerprint = token_fingerprint(token);
        let mut plan = Plan::new(request.dry_run);

        let current = existing.as_ref().and_then(|secret| {
            Some((
                secret.get(USERNAME_KEY)?.to_string(),
                token_fingerprint(secret.get(PASSWORD_KEY)?),
            ))
        });
        if current.as_ref().map(|(u, f)| (u.as_str(), f.as_str()))
            == Some((username, fingerprint.as_str()))
        {
            debug!(%fingerprint, "Token credential already stored");
            return Ok(self.credential(request, CredentialKind::Token, Some(fingerprint), None, false, plan));
        }

        let mut data = SecretData::new();
        data.insert(USERNAME_KEY, username);
        data.insert(PASSWORD_KEY, token.as_str());
        self.write_secret(request, &data, &mut plan).await?;

        Ok(self.credential(request, CredentialKind::Token, Some(fingerprint), None, true, plan))
    }

    async fn write_secret(
        &self,
        request: &BootstrapRequest,
        data: &SecretData,
        plan: &mut Plan,
    ) -> Result<()> {
        if !request.dry_run {
            self.secrets
                .put_secret(&request.namespace, &request.secret_name, data)
                .await?;
            info!(namespace = %request.namespace, secret = %request.secret_name, "Wrote credential secret");
        }
        plan.record(format!(
            "write secret {}/{}",
            request.namespace, request.secret_name
        ));
        Ok(())
    }

    fn credential(
        &self,
        request: &BootstrapRequest,
        kind: CredentialKind,
        fingerprint: Option<String>,
        key_id: Option<String>,
        created: bool,
        plan: Plan,
    ) -> DeployCredential {
        DeployCredential {
            kind,
            fingerprint,
            secret_name: request.secret_name.clone(),
            namespace: request.namespace.clone(),
            key_id,
            created,
            changes: plan.changes,
        }
    }
}

/// Public key line stored in the secret, derived from the identity when absent
fn stored_public_key(secret: &SecretData) -> Option<String> {
    if let Some(public) = secret.get(IDENTITY_PUB_KEY) {
        if public_key_fingerprint(public).is_ok() {
            return Some(public.trim().to_string());
        }
    }
    let identity = secret.get(IDENTITY_KEY)?;
    keys::public_key_from_private(identity).ok()
}

fn stored_fingerprint(secret: &SecretData) -> Option<String> {
    stored_public_key(secret).and_then(|public| public_key_fingerprint(&public).ok())
}

fn find_key<'a>(keys: &'a [DeployKey], fingerprint: &str) -> Option<&'a DeployKey> {
    keys.iter()
        .find(|k| k.fingerprint().as_deref() == Some(fingerprint))
}

/// Requested known_hosts when it differs from the stored one
fn stale_known_hosts<'a>(request: &'a BootstrapRequest, secret: &SecretData) -> Option<&'a str> {
    let wanted = request.known_hosts.as_deref()?;
    (secret.get(KNOWN_HOSTS_KEY) != Some(wanted)).then_some(wanted)
}
