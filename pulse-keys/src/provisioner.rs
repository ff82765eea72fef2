//! Identity key provisioning on sign-in.
//!
//! On first sign-in for a user id the provisioner generates an ECDH P-256 key pair,
//! persists both halves locally and publishes the public half to the key directory.
//! On later sign-ins it republishes the stored public key so a directory that lost
//! the record gets repaired. The private key is never regenerated or overwritten by
//! `initialize`.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::{Config, RetryPolicy, StoreBackend};
use crate::crypto::{CryptoKey, Jwk, KeyKind, KeyPair, KeyProvider, P256Provider};
use crate::directory::{HttpDirectory, KeyDirectory, PublishKeysRequest};
use crate::error::{DirectoryError, KeyError, ProvisionError, StoreError};
use crate::models::{User, UserId};
use crate::store::{
    private_key_name, public_key_name, KeyStore, KeyringKeyStore, MemoryKeyStore,
    SqliteKeyStore,
};

/// Outcome of a single publish to the directory.
pub type PublishResult = Result<(), DirectoryError>;

/// Per-user, per-device provisioning state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyState {
    NoKey,
    Provisioned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionAction {
    /// First run: a new key pair was generated and stored.
    Generated,
    /// Keys existed: the stored public key was republished unchanged.
    Republished,
    /// The private key existed but its public half was missing and got rebuilt.
    Restored,
}

#[derive(Debug)]
pub struct ProvisionReport {
    pub user_id: UserId,
    pub action: ProvisionAction,
    /// Fingerprint of the published key, when the stored key could be parsed.
    pub fingerprint: Option<String>,
    pub publish: PublishResult,
}

impl ProvisionReport {
    pub fn is_published(&self) -> bool {
        self.publish.is_ok()
    }
}

pub struct Provisioner {
    provider: Arc<dyn KeyProvider>,
    store: Arc<dyn KeyStore>,
    directory: Arc<dyn KeyDirectory>,
    /// Serializes initialize so the existence check and the branch it picks run together.
    provision_lock: Mutex<()>,
}

impl Provisioner {
    pub fn new(
        provider: Arc<dyn KeyProvider>,
        store: Arc<dyn KeyStore>,
        directory: Arc<dyn KeyDirectory>,
    ) -> Self {
        Self {
            provider,
            store,
            directory,
            provision_lock: Mutex::new(()),
        }
    }

    /// P-256 provider, the configured local store and the HTTP directory.
    pub fn from_config(config: &Config) -> Result<Self, ProvisionError> {
        let store: Arc<dyn KeyStore> = match config.store {
            StoreBackend::Sqlite => Arc::new(SqliteKeyStore::open(&config.database_path()?)?),
            StoreBackend::Keyring => Arc::new(KeyringKeyStore::default()),
            StoreBackend::Memory => Arc::new(MemoryKeyStore::new()),
        };
        let directory = HttpDirectory::new(&config.api_url, config.http_timeout())?;

        Ok(Self::new(
            Arc::new(P256Provider::new()),
            store,
            Arc::new(directory),
        ))
    }

    pub fn state(&self, user_id: UserId) -> Result<KeyState, StoreError> {
        Ok(match self.store.get(&private_key_name(user_id))? {
            Some(_) => KeyState::Provisioned,
            None => KeyState::NoKey,
        })
    }

    /// Ensure the user has a local identity key and that the directory knows its
    /// public half. Returns `Ok(None)` without touching storage or the network when
    /// there is no user or the user has no id.
    pub async fn initialize(
        &self,
        user: Option<&User>,
    ) -> Result<Option<ProvisionReport>, ProvisionError> {
        let Some(user_id) = user.and_then(User::identity) else {
            debug!("No user id, skipping key provisioning");
            return Ok(None);
        };

        let _guard = self.provision_lock.lock().await;

        let report = match self.store.get(&private_key_name(user_id))? {
            None => {
                info!(user_id = %user_id, "Generating new identity keys");
                let key_pair = self.provider.generate_key_pair()?;
                let publish = self.upload_keys(user_id, &key_pair).await?;
                ProvisionReport {
                    user_id,
                    action: ProvisionAction::Generated,
                    fingerprint: Some(key_pair.public_key.fingerprint()),
                    publish,
                }
            }
            Some(private_json) => match self.store.get(&public_key_name(user_id))? {
                Some(public_json) => {
                    info!(user_id = %user_id, "Identity keys already exist, republishing");
                    let fingerprint = self.fingerprint_of(&public_json);
                    let publish = self.publish(user_id, public_json).await;
                    ProvisionReport {
                        user_id,
                        action: ProvisionAction::Republished,
                        fingerprint,
                        publish,
                    }
                }
                None => {
                    warn!(
                        user_id = %user_id,
                        "Public key missing locally, rebuilding from private key"
                    );
                    let private = self.import_stored(&private_json, KeyKind::Private)?;
                    let public = private.to_public();
                    let public_json = self.provider.export_key(&public)?.to_json()?;
                    self.store.set(&public_key_name(user_id), &public_json)?;
                    let publish = self.publish(user_id, public_json).await;
                    ProvisionReport {
                        user_id,
                        action: ProvisionAction::Restored,
                        fingerprint: Some(public.fingerprint()),
                        publish,
                    }
                }
            },
        };

        match &report.publish {
            Ok(()) => info!(
                user_id = %user_id,
                action = ?report.action,
                fingerprint = report.fingerprint.as_deref().unwrap_or("unknown"),
                "Identity key published"
            ),
            Err(e) => warn!(
                user_id = %user_id,
                error = %e,
                "Failed to publish identity key, local keys kept"
            ),
        }

        Ok(Some(report))
    }

    pub fn generate_key_pair(&self) -> Result<KeyPair, KeyError> {
        self.provider.generate_key_pair()
    }

    /// Persist both halves of `key_pair` under `user_id`, replacing any stored keys,
    /// then publish the public half. Storage errors abort before anything is sent.
    pub async fn upload_keys(
        &self,
        user_id: UserId,
        key_pair: &KeyPair,
    ) -> Result<PublishResult, ProvisionError> {
        let public_json = self.provider.export_key(&key_pair.public_key)?.to_json()?;
        let private_json = self.provider.export_key(&key_pair.private_key)?.to_json()?;

        self.store.set(&private_key_name(user_id), &private_json)?;
        self.store.set(&public_key_name(user_id), &public_json)?;

        Ok(self.publish(user_id, public_json).await)
    }

    /// Publish the stored public key again.
    pub async fn republish(&self, user_id: UserId) -> Result<(), ProvisionError> {
        let public_json = self
            .store
            .get(&public_key_name(user_id))?
            .ok_or(ProvisionError::NotProvisioned(user_id))?;
        self.publish(user_id, public_json).await?;
        Ok(())
    }

    /// Republish until the directory accepts the key or `policy` runs out of attempts.
    /// Returns the number of attempts used. Only directory failures are retried.
    pub async fn republish_with_retry(
        &self,
        user_id: UserId,
        policy: RetryPolicy,
    ) -> Result<u32, ProvisionError> {
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.republish(user_id).await {
                Ok(()) => return Ok(attempt),
                Err(ProvisionError::Directory(e)) if attempt < max_attempts => {
                    warn!(user_id = %user_id, attempt, error = %e, "Publish failed, retrying");
                    tokio::time::sleep(policy.backoff).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// This device's stored key pair for `user_id`.
    pub fn local_key_pair(&self, user_id: UserId) -> Result<Option<KeyPair>, ProvisionError> {
        let Some(private_json) = self.store.get(&private_key_name(user_id))? else {
            return Ok(None);
        };
        let private_key = self.import_stored(&private_json, KeyKind::Private)?;

        Ok(Some(KeyPair {
            public_key: private_key.to_public(),
            private_key,
        }))
    }

    /// Look up a peer's identity key in the directory.
    pub async fn peer_public_key(
        &self,
        peer_id: UserId,
    ) -> Result<Option<CryptoKey>, ProvisionError> {
        let Some(record) = self.directory.fetch(peer_id).await? else {
            debug!(peer_id = %peer_id, "No identity key published for peer");
            return Ok(None);
        };
        Ok(Some(self.import_stored(&record.public_key, KeyKind::Public)?))
    }

    async fn publish(&self, user_id: UserId, public_json: String) -> PublishResult {
        let request = PublishKeysRequest::new(user_id, public_json);
        self.directory.publish(&request).await
    }

    fn import_stored(&self, json: &str, kind: KeyKind) -> Result<CryptoKey, KeyError> {
        let jwk = Jwk::from_json(json)?;
        self.provider.import_key(&jwk, kind)
    }

    fn fingerprint_of(&self, public_json: &str) -> Option<String> {
        self.import_stored(public_json, KeyKind::Public)
            .map(|key| key.fingerprint())
            .ok()
    }
}
