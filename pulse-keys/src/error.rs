use thiserror::Error;

use crate::models::UserId;

/// Failures from the key provider: generation, import and export.
#[derive(Error, Debug)]
pub enum KeyError {
    #[error("Key generation failed: {0}")]
    Generation(String),

    #[error("Malformed key: {0}")]
    Malformed(String),

    #[error("Unsupported key profile: kty={kty}, crv={crv} (expected EC / P-256)")]
    UnsupportedProfile { kty: String, crv: String },

    #[error("Key usage not permitted: {0}")]
    UsageNotPermitted(&'static str),

    #[error("Invalid key encoding: {0}")]
    Encoding(#[from] serde_json::Error),
}

/// Failures from the local key-value store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Keyring error: {0}")]
    Keyring(#[from] keyring::Error),

    #[error("Failed to prepare data directory: {0}")]
    Io(#[from] std::io::Error),

    #[error("Key store lock poisoned")]
    Poisoned,
}

/// Failures talking to the remote key directory.
#[derive(Error, Debug)]
pub enum DirectoryError {
    #[error("Directory request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Directory rejected request with status {status}")]
    Rejected { status: u16 },

    #[error("Invalid directory endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Malformed directory response: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value:?}")]
    InvalidVar { name: &'static str, value: String },

    #[error("Configuration rejected: {0}")]
    Validation(String),

    #[error("Could not determine a data directory; set PULSE_DATA_DIR")]
    NoDataDir,
}

/// Errors surfaced by the provisioner. Publish failures during `initialize` are
/// reported in the outcome instead, see [`crate::ProvisionReport`].
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("No identity key provisioned for user {0}")]
    NotProvisioned(UserId),
}
