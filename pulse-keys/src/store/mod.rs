//! Local key-value persistence for identity keys.
//!
//! Keys are namespaced per user (`priv_key_<id>`, `pub_key_<id>`) and values are
//! JSON-serialized JWKs.

mod memory;
mod os_keyring;
mod sqlite;

pub use memory::MemoryKeyStore;
pub use os_keyring::KeyringKeyStore;
pub use sqlite::SqliteKeyStore;

use crate::error::StoreError;
use crate::models::UserId;

const PRIVATE_KEY_PREFIX: &str = "priv_key_";
const PUBLIC_KEY_PREFIX: &str = "pub_key_";

/// String-keyed, string-valued persistence scoped to this device.
pub trait KeyStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
}

pub fn private_key_name(user_id: UserId) -> String {
    format!("{}{}", PRIVATE_KEY_PREFIX, user_id)
}

pub fn public_key_name(user_id: UserId) -> String {
    format!("{}{}", PUBLIC_KEY_PREFIX, user_id)
}
