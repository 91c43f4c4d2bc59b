//! Host password check with first-login bootstrap.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use secrecy::{ExposeSecret, SecretString};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

use crate::error::StoreError;
use crate::kv::{KvStore, Namespace};
use crate::locks::HostLocks;

const DIGEST_PREFIX: &str = "sha256:";

/// Outcome of a host login attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verdict {
    /// No password supplied; the check is skipped entirely.
    Anonymous,
    /// First login for this host; the password is now stored.
    Bootstrapped,
    /// Supplied password matches the stored one.
    Accepted,
    /// Supplied password differs from the stored one.
    Rejected,
}

impl Verdict {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

pub struct CredentialVerifier {
    kv: Arc<dyn KvStore>,
    locks: HostLocks,
}

impl CredentialVerifier {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            locks: HostLocks::new(),
        }
    }

    /// Check `supplied` against the host's stored credential, storing it when
    /// none exists yet. Once set, a credential never changes.
    #[instrument(skip(self, supplied))]
    pub async fn verify(
        &self,
        host_id: &str,
        supplied: Option<&SecretString>,
    ) -> Result<Verdict, StoreError> {
        let Some(supplied) = supplied else {
            return Ok(Verdict::Anonymous);
        };

        // Two racing first logins must not both bootstrap.
        let _guard = self.locks.lock(host_id).await;

        match self.kv.get(Namespace::Credential, host_id).await? {
            None => {
                self.kv
                    .put(Namespace::Credential, host_id, digest(supplied))
                    .await?;
                info!(host_id, "host credential initialised");
                Ok(Verdict::Bootstrapped)
            }
            Some(stored) if credential_matches(&stored, supplied) => Ok(Verdict::Accepted),
            Some(_) => {
                warn!(host_id, "host password mismatch");
                Ok(Verdict::Rejected)
            }
        }
    }
}

fn digest(password: &SecretString) -> String {
    let hash = Sha256::digest(password.expose_secret().as_bytes());
    format!("{DIGEST_PREFIX}{}", STANDARD.encode(hash))
}

// Values without the digest prefix were written as plaintext and compare exactly.
fn credential_matches(stored: &str, supplied: &SecretString) -> bool {
    if stored.starts_with(DIGEST_PREFIX) {
        stored == digest(supplied)
    } else {
        stored == supplied.expose_secret()
    }
}
