use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::KeyError;

/// Operations an identity key may be used for. Signing is never granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyUsage {
    #[serde(rename = "deriveKey")]
    DeriveKey,
    #[serde(rename = "deriveBits")]
    DeriveBits,
}

/// Which half of a key pair a serialized key is imported as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Public,
    Private,
}

impl KeyKind {
    /// Usage set granted on import: none for public keys, derivation for private ones.
    pub fn usages(self) -> Vec<KeyUsage> {
        match self {
            KeyKind::Public => Vec::new(),
            KeyKind::Private => vec![KeyUsage::DeriveKey, KeyUsage::DeriveBits],
        }
    }
}

fn default_ext() -> bool {
    true
}

/// JSON Web Key for an EC P-256 key. Field order matches what browsers emit, so a
/// stored JWK written by either side compares equal after a round trip.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    pub crv: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub d: Option<String>,
    #[serde(default = "default_ext")]
    pub ext: bool,
    #[serde(default)]
    pub key_ops: Vec<KeyUsage>,
    pub kty: String,
    pub x: String,
    pub y: String,
}

impl Jwk {
    pub fn to_json(&self) -> Result<String, KeyError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, KeyError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn is_private(&self) -> bool {
        self.d.is_some()
    }
}

impl fmt::Debug for Jwk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Jwk")
            .field("kty", &self.kty)
            .field("crv", &self.crv)
            .field("x", &self.x)
            .field("y", &self.y)
            .field("d", &self.d.as_ref().map(|_| "<redacted>"))
            .field("key_ops", &self.key_ops)
            .finish()
    }
}

#[derive(Clone)]
enum KeyMaterial {
    Public(PublicKey),
    Private(SecretKey),
}

/// Handle to one half of an identity key pair together with its granted usages.
#[derive(Clone)]
pub struct CryptoKey {
    material: KeyMaterial,
    usages: Vec<KeyUsage>,
}

impl CryptoKey {
    pub(crate) fn from_public(key: PublicKey) -> Self {
        Self {
            material: KeyMaterial::Public(key),
            usages: KeyKind::Public.usages(),
        }
    }

    pub(crate) fn from_secret(key: SecretKey) -> Self {
        Self {
            material: KeyMaterial::Private(key),
            usages: KeyKind::Private.usages(),
        }
    }

    pub fn kind(&self) -> KeyKind {
        match self.material {
            KeyMaterial::Public(_) => KeyKind::Public,
            KeyMaterial::Private(_) => KeyKind::Private,
        }
    }

    pub fn usages(&self) -> &[KeyUsage] {
        &self.usages
    }

    pub fn public_key(&self) -> PublicKey {
        match &self.material {
            KeyMaterial::Public(key) => *key,
            KeyMaterial::Private(secret) => secret.public_key(),
        }
    }

    /// Public half of this key, with the public usage set.
    pub fn to_public(&self) -> CryptoKey {
        CryptoKey::from_public(self.public_key())
    }

    pub(crate) fn secret_key(&self) -> Option<&SecretKey> {
        match &self.material {
            KeyMaterial::Public(_) => None,
            KeyMaterial::Private(secret) => Some(secret),
        }
    }

    /// Short hex id of the public point, safe to log.
    pub fn fingerprint(&self) -> String {
        let point = self.public_key().to_encoded_point(false);
        let digest = Sha256::digest(point.as_bytes());
        hex::encode(&digest[..8])
    }

    /// Raw ECDH shared secret with a peer's public key.
    pub fn derive_bits(&self, peer: &CryptoKey) -> Result<Vec<u8>, KeyError> {
        if !self.usages.contains(&KeyUsage::DeriveBits) {
            return Err(KeyError::UsageNotPermitted("deriveBits"));
        }
        let secret = self
            .secret_key()
            .ok_or(KeyError::UsageNotPermitted("deriveBits on a public key"))?;
        let peer_public = peer.public_key();
        let shared =
            p256::ecdh::diffie_hellman(secret.to_nonzero_scalar(), peer_public.as_affine());
        Ok(shared.raw_secret_bytes().to_vec())
    }
}

impl fmt::Debug for CryptoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CryptoKey")
            .field("kind", &self.kind())
            .field("fingerprint", &self.fingerprint())
            .field("usages", &self.usages)
            .finish()
    }
}

/// Identity key pair for ECDH key agreement over P-256.
#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public_key: CryptoKey,
    pub private_key: CryptoKey,
}

impl KeyPair {
    pub(crate) fn from_secret(secret: SecretKey) -> Self {
        Self {
            public_key: CryptoKey::from_public(secret.public_key()),
            private_key: CryptoKey::from_secret(secret),
        }
    }
}
