//! # Deploy Keys
//!
//! SSH key pair generation and fingerprinting.
//!
//! Private keys are returned in OpenSSH format inside [`Zeroizing`] buffers
//! and never logged. Fingerprints use the `SHA256:<base64>` form printed by
//! `ssh-keygen -l`, which is also what providers display.

use crate::config::KeyAlgorithm;
use crate::error::{Error, Result};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};
use ssh_key::private::{KeypairData, RsaKeypair};
use ssh_key::{Algorithm, EcdsaCurve, HashAlg, LineEnding, PrivateKey, PublicKey};
use std::fmt;
use zeroize::Zeroizing;

/// A freshly generated key pair
pub struct GeneratedKey {
    pub private_openssh: Zeroizing<String>,
    /// `<algorithm> <base64> <comment>`
    pub public_openssh: String,
    pub fingerprint: String,
}

impl fmt::Debug for GeneratedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratedKey")
            .field("public_openssh", &self.public_openssh)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

/// Generate a key pair
///
/// `bits` selects the RSA modulus size or the ECDSA curve and is ignored for
/// ed25519. Sizes are validated with the request, so an unexpected value here
/// is an internal error.
pub fn generate_key(algorithm: KeyAlgorithm, bits: Option<u32>, comment: &str) -> Result<GeneratedKey> {
    let mut rng = OsRng;
    let mut key = match algorithm {
        KeyAlgorithm::Ed25519 => PrivateKey::random(&mut rng, Algorithm::Ed25519).map_err(key_error)?,
        KeyAlgorithm::Ecdsa => {
            let curve = match bits.unwrap_or(256) {
                256 => EcdsaCurve::NistP256,
                384 => EcdsaCurve::NistP384,
                521 => EcdsaCurve::NistP521,
                other => {
                    return Err(Error::Internal(anyhow::anyhow!(
                        "unsupported ECDSA key size {other}"
                    )))
                }
            };
            PrivateKey::random(&mut rng, Algorithm::Ecdsa { curve }).map_err(key_error)?
        }
        KeyAlgorithm::Rsa => {
            let bits = bits.unwrap_or(crate::constants::DEFAULT_RSA_KEY_BITS);
            let keypair = RsaKeypair::random(&mut rng, bits as usize).map_err(key_error)?;
            PrivateKey::new(KeypairData::from(keypair), comment).map_err(key_error)?
        }
    };
    key.set_comment(comment);

    let private_openssh = key.to_openssh(LineEnding::LF).map_err(key_error)?;
    let public = key.public_key();
    let public_openssh = public.to_openssh().map_err(key_error)?;

    Ok(GeneratedKey {
        private_openssh,
        fingerprint: public.fingerprint(HashAlg::Sha256).to_string(),
        public_openssh,
    })
}

/// `SHA256:<base64>` fingerprint of an OpenSSH public key line
pub fn public_key_fingerprint(public_openssh: &str) -> Result<String> {
    let key = PublicKey::from_openssh(public_openssh.trim()).map_err(key_error)?;
    Ok(key.fingerprint(HashAlg::Sha256).to_string())
}

/// Derive the OpenSSH public key line from a stored private key
pub fn public_key_from_private(private_openssh: &str) -> Result<String> {
    let key = PrivateKey::from_openssh(private_openssh.trim()).map_err(key_error)?;
    key.public_key().to_openssh().map_err(key_error)
}

/// Fingerprint of a token, safe to log and compare
#[must_use]
pub fn token_fingerprint(token: &str) -> String {
    format!("sha256:{:x}", Sha256::digest(token.as_bytes()))
}

fn key_error(err: ssh_key::Error) -> Error {
    Error::Internal(anyhow::anyhow!("SSH key error: {err}"))
}
