//! Provisioning flow tests against an in-memory store and a recording directory.

use async_trait::async_trait;
use pulse_keys::crypto::{CryptoKey, Jwk, KeyKind, KeyPair, KeyProvider, P256Provider};
use pulse_keys::directory::{DirectoryRecord, KeyDirectory, PublishKeysRequest};
use pulse_keys::store::{KeyStore, MemoryKeyStore};
use pulse_keys::{
    DirectoryError, KeyError, KeyState, ProvisionAction, ProvisionError, Provisioner,
    RetryPolicy, User, UserId,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Directory that records every publish and can be told to fail the first N.
#[derive(Default)]
struct RecordingDirectory {
    requests: Mutex<Vec<PublishKeysRequest>>,
    records: Mutex<HashMap<UserId, DirectoryRecord>>,
    failures_remaining: AtomicU32,
}

impl RecordingDirectory {
    fn failing(times: u32) -> Self {
        Self {
            failures_remaining: AtomicU32::new(times),
            ..Self::default()
        }
    }

    fn requests(&self) -> Vec<PublishKeysRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl KeyDirectory for RecordingDirectory {
    async fn publish(&self, request: &PublishKeysRequest) -> Result<(), DirectoryError> {
        self.requests.lock().unwrap().push(request.clone());

        let failed = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(DirectoryError::Rejected { status: 503 });
        }

        self.records.lock().unwrap().insert(
            request.user_id,
            DirectoryRecord {
                user_id: request.user_id,
                public_key: request.public_key.clone(),
                pre_key_bundle: None,
                timestamp: None,
            },
        );
        Ok(())
    }

    async fn fetch(&self, user_id: UserId) -> Result<Option<DirectoryRecord>, DirectoryError> {
        Ok(self.records.lock().unwrap().get(&user_id).cloned())
    }
}

/// Provider whose entropy source is gone.
struct UnavailableProvider;

impl KeyProvider for UnavailableProvider {
    fn generate_key_pair(&self) -> Result<KeyPair, KeyError> {
        Err(KeyError::Generation("entropy source unavailable".into()))
    }

    fn export_key(&self, key: &CryptoKey) -> Result<Jwk, KeyError> {
        P256Provider::new().export_key(key)
    }

    fn import_key(&self, jwk: &Jwk, kind: KeyKind) -> Result<CryptoKey, KeyError> {
        P256Provider::new().import_key(jwk, kind)
    }
}

fn setup(
    directory: RecordingDirectory,
) -> (Provisioner, Arc<MemoryKeyStore>, Arc<RecordingDirectory>) {
    let store = Arc::new(MemoryKeyStore::new());
    let directory = Arc::new(directory);
    let provisioner = Provisioner::new(
        Arc::new(P256Provider::new()),
        store.clone(),
        directory.clone(),
    );
    (provisioner, store, directory)
}

fn id(raw: i64) -> UserId {
    UserId::new(raw).unwrap()
}

fn no_backoff(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        backoff: Duration::ZERO,
    }
}

#[tokio::test]
async fn test_first_sign_in_generates_stores_and_publishes() {
    let (provisioner, store, directory) = setup(RecordingDirectory::default());
    assert_eq!(provisioner.state(id(42)).unwrap(), KeyState::NoKey);

    let report = provisioner
        .initialize(Some(&User::with_id(42)))
        .await
        .unwrap()
        .expect("user with id should be provisioned");

    assert_eq!(report.action, ProvisionAction::Generated);
    assert!(report.is_published());
    assert_eq!(provisioner.state(id(42)).unwrap(), KeyState::Provisioned);

    let private_json = store.get("priv_key_42").unwrap().expect("private key stored");
    let public_json = store.get("pub_key_42").unwrap().expect("public key stored");
    assert_eq!(store.len().unwrap(), 2);

    let requests = directory.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].user_id, id(42));
    assert_eq!(requests[0].public_key, public_json);
    assert!(requests[0].pre_key_bundle.is_none());

    let published: serde_json::Value = serde_json::from_str(&requests[0].public_key).unwrap();
    assert_eq!(published["crv"], "P-256");
    assert_eq!(published["kty"], "EC");
    assert!(published.get("d").is_none(), "private scalar must not be published");

    let private: serde_json::Value = serde_json::from_str(&private_json).unwrap();
    assert!(private["d"].is_string());
    assert_eq!(private["x"], published["x"]);
}

#[tokio::test]
async fn test_existing_keys_are_republished_unchanged() {
    let (provisioner, store, directory) = setup(RecordingDirectory::default());
    let stored = r#"{"kty":"EC","crv":"P-256","x":"stored-x","y":"stored-y"}"#;
    store.set("priv_key_42", stored).unwrap();
    store.set("pub_key_42", stored).unwrap();

    let report = provisioner
        .initialize(Some(&User::with_id(42)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.action, ProvisionAction::Republished);
    assert!(report.fingerprint.is_none());
    assert_eq!(store.get("priv_key_42").unwrap().as_deref(), Some(stored));
    assert_eq!(store.get("pub_key_42").unwrap().as_deref(), Some(stored));
    assert_eq!(store.len().unwrap(), 2);

    let requests = directory.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].user_id, id(42));
    assert_eq!(requests[0].public_key, stored);
}

#[tokio::test]
async fn test_initialize_twice_keeps_private_key() {
    let (provisioner, store, directory) = setup(RecordingDirectory::default());
    let user = User::with_id(7);

    let first = provisioner.initialize(Some(&user)).await.unwrap().unwrap();
    let private_after_first = store.get("priv_key_7").unwrap();

    let second = provisioner.initialize(Some(&user)).await.unwrap().unwrap();
    let private_after_second = store.get("priv_key_7").unwrap();

    assert_eq!(first.action, ProvisionAction::Generated);
    assert_eq!(second.action, ProvisionAction::Republished);
    assert_eq!(private_after_first, private_after_second);
    assert_eq!(first.fingerprint, second.fingerprint);

    let requests = directory.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].public_key, requests[1].public_key);
}

#[tokio::test]
async fn test_missing_user_or_id_is_a_no_op() {
    let (provisioner, store, directory) = setup(RecordingDirectory::default());

    assert!(provisioner.initialize(None).await.unwrap().is_none());
    assert!(provisioner
        .initialize(Some(&User::default()))
        .await
        .unwrap()
        .is_none());
    assert!(provisioner
        .initialize(Some(&User::with_id(0)))
        .await
        .unwrap()
        .is_none());

    assert!(store.is_empty().unwrap());
    assert!(directory.requests().is_empty());
}

#[tokio::test]
async fn test_generation_failure_propagates_without_side_effects() {
    let store = Arc::new(MemoryKeyStore::new());
    let directory = Arc::new(RecordingDirectory::default());
    let provisioner = Provisioner::new(
        Arc::new(UnavailableProvider),
        store.clone(),
        directory.clone(),
    );

    let result = provisioner.initialize(Some(&User::with_id(42))).await;

    assert!(matches!(
        result,
        Err(ProvisionError::Key(KeyError::Generation(_)))
    ));
    assert!(store.is_empty().unwrap());
    assert!(directory.requests().is_empty());
    assert_eq!(provisioner.state(id(42)).unwrap(), KeyState::NoKey);
}

#[tokio::test]
async fn test_publish_failure_keeps_local_keys() {
    let (provisioner, store, directory) = setup(RecordingDirectory::failing(1));

    let report = provisioner
        .initialize(Some(&User::with_id(5)))
        .await
        .unwrap()
        .unwrap();

    assert!(!report.is_published());
    assert!(matches!(
        report.publish,
        Err(DirectoryError::Rejected { status: 503 })
    ));
    assert!(store.get("priv_key_5").unwrap().is_some());
    assert!(store.get("pub_key_5").unwrap().is_some());

    let attempts = provisioner
        .republish_with_retry(id(5), no_backoff(3))
        .await
        .unwrap();
    assert_eq!(attempts, 1);
    assert_eq!(directory.requests().len(), 2);
}

#[tokio::test]
async fn test_republish_with_retry_gives_up_after_max_attempts() {
    let (provisioner, _store, directory) = setup(RecordingDirectory::failing(10));
    provisioner
        .initialize(Some(&User::with_id(5)))
        .await
        .unwrap()
        .unwrap();

    let result = provisioner.republish_with_retry(id(5), no_backoff(3)).await;

    assert!(matches!(result, Err(ProvisionError::Directory(_))));
    // one publish from initialize, three from the retry loop
    assert_eq!(directory.requests().len(), 4);
}

#[tokio::test]
async fn test_republish_recovers_on_later_attempt() {
    let (provisioner, _store, directory) = setup(RecordingDirectory::failing(3));
    provisioner
        .initialize(Some(&User::with_id(5)))
        .await
        .unwrap()
        .unwrap();

    let attempts = provisioner
        .republish_with_retry(id(5), no_backoff(5))
        .await
        .unwrap();

    assert_eq!(attempts, 3);
    assert_eq!(directory.requests().len(), 4);
}

#[tokio::test]
async fn test_republish_without_keys_is_not_provisioned() {
    let (provisioner, _store, directory) = setup(RecordingDirectory::default());

    let result = provisioner.republish(id(9)).await;

    assert!(matches!(result, Err(ProvisionError::NotProvisioned(user)) if user == id(9)));
    assert!(directory.requests().is_empty());
}

#[tokio::test]
async fn test_missing_public_key_is_rebuilt_from_private_key() {
    let (provisioner, store, _directory) = setup(RecordingDirectory::default());
    provisioner
        .initialize(Some(&User::with_id(11)))
        .await
        .unwrap()
        .unwrap();
    let private_json = store.get("priv_key_11").unwrap().unwrap();
    let public_json = store.get("pub_key_11").unwrap().unwrap();

    let (restoring, partial_store, directory) = setup(RecordingDirectory::default());
    partial_store.set("priv_key_11", &private_json).unwrap();

    let report = restoring
        .initialize(Some(&User::with_id(11)))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.action, ProvisionAction::Restored);
    assert_eq!(
        partial_store.get("priv_key_11").unwrap().as_deref(),
        Some(private_json.as_str())
    );
    assert_eq!(
        partial_store.get("pub_key_11").unwrap().as_deref(),
        Some(public_json.as_str())
    );
    assert_eq!(directory.requests()[0].public_key, public_json);
}

#[tokio::test]
async fn test_corrupt_private_key_without_public_key_is_an_error() {
    let (provisioner, store, directory) = setup(RecordingDirectory::default());
    store.set("priv_key_3", "not json").unwrap();

    let result = provisioner.initialize(Some(&User::with_id(3))).await;

    assert!(matches!(result, Err(ProvisionError::Key(KeyError::Encoding(_)))));
    assert_eq!(store.get("priv_key_3").unwrap().as_deref(), Some("not json"));
    assert!(directory.requests().is_empty());
}

#[tokio::test]
async fn test_peers_agree_on_shared_secret_via_directory() {
    let directory = Arc::new(RecordingDirectory::default());
    let device = |store: Arc<MemoryKeyStore>| {
        Provisioner::new(Arc::new(P256Provider::new()), store, directory.clone())
    };
    let alice = device(Arc::new(MemoryKeyStore::new()));
    let bob = device(Arc::new(MemoryKeyStore::new()));

    alice.initialize(Some(&User::with_id(1))).await.unwrap();
    bob.initialize(Some(&User::with_id(2))).await.unwrap();

    let bob_public = alice.peer_public_key(id(2)).await.unwrap().unwrap();
    let alice_public = bob.peer_public_key(id(1)).await.unwrap().unwrap();
    assert_eq!(bob_public.kind(), KeyKind::Public);

    let alice_pair = alice.local_key_pair(id(1)).unwrap().unwrap();
    let bob_pair = bob.local_key_pair(id(2)).unwrap().unwrap();
    assert_eq!(alice_pair.public_key.fingerprint(), alice_public.fingerprint());

    let from_alice = alice_pair.private_key.derive_bits(&bob_public).unwrap();
    let from_bob = bob_pair.private_key.derive_bits(&alice_public).unwrap();
    assert_eq!(from_alice, from_bob);

    assert!(alice.peer_public_key(id(99)).await.unwrap().is_none());
    assert!(alice.local_key_pair(id(2)).unwrap().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_sign_ins_generate_once() {
    let (provisioner, store, directory) = setup(RecordingDirectory::default());
    let provisioner = Arc::new(provisioner);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let provisioner = provisioner.clone();
            tokio::spawn(async move {
                let user = User::with_id(42);
                provisioner.initialize(Some(&user)).await.unwrap().unwrap()
            })
        })
        .collect();

    let mut actions = Vec::new();
    for task in tasks {
        actions.push(task.await.unwrap().action);
    }

    let count = |wanted: ProvisionAction| actions.iter().filter(|a| **a == wanted).count();
    assert_eq!(count(ProvisionAction::Generated), 1);
    assert_eq!(count(ProvisionAction::Republished), 7);

    let published: HashSet<String> = directory
        .requests()
        .into_iter()
        .map(|request| request.public_key)
        .collect();
    assert_eq!(directory.requests().len(), 8);
    assert_eq!(published.len(), 1);
    assert_eq!(store.get("pub_key_42").unwrap().as_ref(), published.iter().next());
}
