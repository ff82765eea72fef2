//! Identity key material: ECDH P-256 key pairs and their JWK encoding.

mod provider;
mod types;

pub use provider::{KeyProvider, P256Provider};
pub use types::{CryptoKey, Jwk, KeyKind, KeyPair, KeyUsage};
