//! Pulse identity key provisioning.
//!
//! Ensures every signed-in user has an ECDH P-256 identity key on this device and
//! that the public half is published to the key directory, so peers can look it up.

pub mod config;
pub mod crypto;
pub mod directory;
pub mod error;
mod logging;
pub mod models;
mod provisioner;
pub mod store;

pub use config::{Config, RetryPolicy, StoreBackend};
pub use error::{ConfigError, DirectoryError, KeyError, ProvisionError, StoreError};
pub use logging::init_logging;
pub use models::{User, UserId};
pub use provisioner::{KeyState, ProvisionAction, ProvisionReport, Provisioner, PublishResult};
