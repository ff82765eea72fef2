use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use url::Url;

use super::{DirectoryRecord, KeyDirectory, PublishKeysRequest};
use crate::error::DirectoryError;
use crate::models::UserId;

/// Key directory reached over the Pulse REST API.
#[derive(Debug, Clone)]
pub struct HttpDirectory {
    client: reqwest::Client,
    base_url: Url,
}

impl HttpDirectory {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, DirectoryError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|e| DirectoryError::InvalidEndpoint(format!("{}: {}", base_url, e)))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(DirectoryError::InvalidEndpoint(format!(
                "unsupported scheme {}",
                base_url.scheme()
            )));
        }
        // Url::join replaces the last segment unless the path ends with a slash
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self { client, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, DirectoryError> {
        self.base_url
            .join(path)
            .map_err(|e| DirectoryError::InvalidEndpoint(e.to_string()))
    }
}

#[async_trait]
impl KeyDirectory for HttpDirectory {
    async fn publish(&self, request: &PublishKeysRequest) -> Result<(), DirectoryError> {
        let url = self.endpoint("keys")?;

        let response = self.client.post(url).json(request).send().await?;

        if !response.status().is_success() {
            return Err(DirectoryError::Rejected {
                status: response.status().as_u16(),
            });
        }

        tracing::debug!(user_id = %request.user_id, "Public key accepted by directory");
        Ok(())
    }

    async fn fetch(&self, user_id: UserId) -> Result<Option<DirectoryRecord>, DirectoryError> {
        let url = self.endpoint(&format!("keys/{}", user_id))?;

        let response = self.client.get(url).send().await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(DirectoryError::Rejected {
                status: response.status().as_u16(),
            });
        }

        let body = response.bytes().await?;
        Ok(Some(serde_json::from_slice(&body)?))
    }
}
