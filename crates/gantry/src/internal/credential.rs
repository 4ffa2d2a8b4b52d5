use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use orion::auth::{SecretKey, Tag};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::internal::common::Map;
use crate::internal::common::ids::{JobId, StepId, StepKey, Uid};
use crate::internal::server::config::DEFAULT_CREDENTIAL_LIFETIME;

/// Length of a credential signature (keyed BLAKE2b-256 tag).
pub const SIG_LEN: usize = 32;

pub type Signature = [u8; SIG_LEN];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential signature is invalid")]
    InvalidSignature,
    #[error("credential for step {0} expired")]
    Expired(StepKey),
    #[error("credential for step {0} was revoked")]
    Revoked(StepKey),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialBody {
    pub job_id: JobId,
    pub step_id: StepId,
    pub uid: Uid,
    pub node_list: String,
    pub expiration: DateTime<Utc>,
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    body: CredentialBody,
    #[serde(with = "serde_bytes")]
    signature: Vec<u8>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("step", &self.step_key())
            .field("uid", &self.body.uid)
            .field("nodes", &self.body.node_list)
            .field("signature", &hex::encode(&self.signature))
            .finish()
    }
}

impl Credential {
    pub fn body(&self) -> &CredentialBody {
        &self.body
    }

    pub fn step_key(&self) -> StepKey {
        StepKey::new(self.body.job_id, self.body.step_id)
    }

    /// Signature bytes, as matched against stream headers.
    pub fn signature(&self) -> Signature {
        let mut signature = [0; SIG_LEN];
        let len = self.signature.len().min(SIG_LEN);
        signature[..len].copy_from_slice(&self.signature[..len]);
        signature
    }
}

/// Signs and verifies step credentials with the controller key.
#[derive(Clone)]
pub struct CredentialSigner {
    key: Arc<SecretKey>,
    lifetime: Duration,
}

impl CredentialSigner {
    pub fn new(key: Arc<SecretKey>, lifetime: Duration) -> Self {
        CredentialSigner { key, lifetime }
    }

    pub fn generate(lifetime: Duration) -> Self {
        Self::new(Arc::new(SecretKey::default()), lifetime)
    }

    pub fn from_key_bytes(bytes: &[u8], lifetime: Duration) -> crate::Result<Self> {
        let key = SecretKey::from_slice(bytes)
            .map_err(|_| "Credential key must be between 32 and 64 bytes long")?;
        Ok(Self::new(Arc::new(key), lifetime))
    }

    pub fn sign(
        &self,
        job_id: JobId,
        step_id: StepId,
        uid: Uid,
        node_list: String,
        now: DateTime<Utc>,
    ) -> crate::Result<Credential> {
        let expiration = now
            + chrono::Duration::from_std(self.lifetime)
                .map_err(|_| "Credential lifetime out of range")?;
        let body = CredentialBody {
            job_id,
            step_id,
            uid,
            node_list,
            expiration,
        };
        let data = bincode::serialize(&body)?;
        let tag = orion::auth::authenticate(&self.key, &data)?;
        Ok(Credential {
            body,
            signature: tag.unprotected_as_bytes().to_vec(),
        })
    }

    pub fn verify(&self, credential: &Credential, now: DateTime<Utc>) -> Result<(), CredentialError> {
        let data =
            bincode::serialize(&credential.body).map_err(|_| CredentialError::InvalidSignature)?;
        let tag =
            Tag::from_slice(&credential.signature).map_err(|_| CredentialError::InvalidSignature)?;
        orion::auth::authenticate_verify(&tag, &self.key, &data)
            .map_err(|_| CredentialError::InvalidSignature)?;
        if credential.body.expiration < now {
            return Err(CredentialError::Expired(credential.step_key()));
        }
        Ok(())
    }
}

/// Node-side record of credentials, consulted before launching tasks.
///
/// Revoking an unknown credential is accepted and remembered, so a launch
/// racing with the revoke is refused. A revocation is kept until the
/// credential it names can no longer be valid.
#[derive(Debug)]
pub struct CredentialCache {
    lifetime: Duration,
    known: Map<StepKey, DateTime<Utc>>,
    // Time after which the revoked credential is expired anyway
    revoked: Map<StepKey, DateTime<Utc>>,
}

impl Default for CredentialCache {
    fn default() -> Self {
        Self::new(DEFAULT_CREDENTIAL_LIFETIME)
    }
}

impl CredentialCache {
    /// `lifetime` is the validity of credentials issued by the controller.
    pub fn new(lifetime: Duration) -> Self {
        CredentialCache {
            lifetime,
            known: Default::default(),
            revoked: Default::default(),
        }
    }

    pub fn insert(&mut self, credential: &Credential) -> Result<(), CredentialError> {
        let key = credential.step_key();
        if self.revoked.contains_key(&key) {
            return Err(CredentialError::Revoked(key));
        }
        self.known.insert(key, credential.body.expiration);
        Ok(())
    }

    /// Returns `true` if the credential was not revoked before.
    pub fn revoke(&mut self, key: StepKey, now: DateTime<Utc>) -> bool {
        let horizon = match self.known.get(&key) {
            Some(expiration) => *expiration,
            None => {
                log::debug!("Revoking unknown credential {key}");
                chrono::Duration::from_std(self.lifetime)
                    .ok()
                    .and_then(|lifetime| now.checked_add_signed(lifetime))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC)
            }
        };
        match self.revoked.get_mut(&key) {
            Some(current) => {
                *current = (*current).max(horizon);
                false
            }
            None => {
                self.revoked.insert(key, horizon);
                true
            }
        }
    }

    pub fn is_revoked(&self, key: StepKey) -> bool {
        self.revoked.contains_key(&key)
    }

    /// Forgets credentials that expired before `now` and revocations of
    /// credentials that cannot be valid any more.
    pub fn purge_expired(&mut self, now: DateTime<Utc>) {
        self.known.retain(|_, expiration| *expiration >= now);
        self.revoked.retain(|_, horizon| *horizon >= now);
    }

    pub fn len(&self) -> usize {
        self.known.len() + self.revoked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.known.is_empty() && self.revoked.is_empty()
    }
}
