//! Remote key directory: where public identity keys are published and looked up.

mod http;

pub use http::HttpDirectory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DirectoryError;
use crate::models::UserId;

/// Body of `POST /keys`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishKeysRequest {
    pub user_id: UserId,
    /// JWK of the public key, as a JSON string.
    pub public_key: String,
    /// Reserved for a pre-key bundle; always sent as `null` for now.
    pub pre_key_bundle: Option<serde_json::Value>,
}

impl PublishKeysRequest {
    pub fn new(user_id: UserId, public_key: impl Into<String>) -> Self {
        Self {
            user_id,
            public_key: public_key.into(),
            pre_key_bundle: None,
        }
    }
}

/// Record returned by `GET /keys/{user_id}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectoryRecord {
    pub user_id: UserId,
    pub public_key: String,
    #[serde(default)]
    pub pre_key_bundle: Option<serde_json::Value>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[async_trait]
pub trait KeyDirectory: Send + Sync {
    async fn publish(&self, request: &PublishKeysRequest) -> Result<(), DirectoryError>;

    /// `Ok(None)` when the directory holds no key for `user_id`.
    async fn fetch(&self, user_id: UserId) -> Result<Option<DirectoryRecord>, DirectoryError>;
}
