use base64::{engine::general_purpose::URL_SAFE_NO_PAD as B64URL, Engine};
use p256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use p256::{EncodedPoint, FieldBytes, PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;

use super::types::{CryptoKey, Jwk, KeyKind, KeyPair};
use crate::error::KeyError;

const KTY_EC: &str = "EC";
const CRV_P256: &str = "P-256";
const COORDINATE_LEN: usize = 32;

/// Scalars at or above the curve order are rejected and redrawn.
const MAX_SCALAR_ATTEMPTS: usize = 8;

/// Cryptographic capability the provisioner depends on.
pub trait KeyProvider: Send + Sync {
    fn generate_key_pair(&self) -> Result<KeyPair, KeyError>;
    fn export_key(&self, key: &CryptoKey) -> Result<Jwk, KeyError>;
    fn import_key(&self, jwk: &Jwk, kind: KeyKind) -> Result<CryptoKey, KeyError>;
}

/// ECDH P-256 provider backed by the OS random source.
#[derive(Debug, Default, Clone, Copy)]
pub struct P256Provider;

impl P256Provider {
    pub fn new() -> Self {
        Self
    }
}

impl KeyProvider for P256Provider {
    fn generate_key_pair(&self) -> Result<KeyPair, KeyError> {
        let secret = random_secret(&mut OsRng)?;
        Ok(KeyPair::from_secret(secret))
    }

    fn export_key(&self, key: &CryptoKey) -> Result<Jwk, KeyError> {
        let point = key.public_key().to_encoded_point(false);
        let x = point
            .x()
            .ok_or_else(|| KeyError::Malformed("public point has no x coordinate".into()))?;
        let y = point
            .y()
            .ok_or_else(|| KeyError::Malformed("public point has no y coordinate".into()))?;

        Ok(Jwk {
            crv: CRV_P256.to_string(),
            d: key.secret_key().map(|secret| B64URL.encode(secret.to_bytes())),
            ext: true,
            key_ops: key.usages().to_vec(),
            kty: KTY_EC.to_string(),
            x: B64URL.encode(x),
            y: B64URL.encode(y),
        })
    }

    fn import_key(&self, jwk: &Jwk, kind: KeyKind) -> Result<CryptoKey, KeyError> {
        if jwk.kty != KTY_EC || jwk.crv != CRV_P256 {
            return Err(KeyError::UnsupportedProfile {
                kty: jwk.kty.clone(),
                crv: jwk.crv.clone(),
            });
        }
        if !jwk.ext {
            return Err(KeyError::Malformed("key is marked non-extractable".into()));
        }
        let requested = kind.usages();
        if !jwk.key_ops.is_empty() && !requested.iter().all(|op| jwk.key_ops.contains(op)) {
            return Err(KeyError::Malformed(format!(
                "key_ops {:?} do not allow {:?}",
                jwk.key_ops, requested
            )));
        }

        let x = decode_coordinate("x", &jwk.x)?;
        let y = decode_coordinate("y", &jwk.y)?;
        let point = EncodedPoint::from_affine_coordinates(&x, &y, false);
        let public = Option::<PublicKey>::from(PublicKey::from_encoded_point(&point))
            .ok_or_else(|| KeyError::Malformed("point is not on P-256".into()))?;

        match (kind, jwk.d.as_deref()) {
            (KeyKind::Public, None) => Ok(CryptoKey::from_public(public)),
            (KeyKind::Public, Some(_)) => Err(KeyError::Malformed(
                "private material supplied for a public import".into(),
            )),
            (KeyKind::Private, None) => Err(KeyError::Malformed("missing private scalar d".into())),
            (KeyKind::Private, Some(d)) => {
                let scalar = decode_coordinate("d", d)?;
                let secret = SecretKey::from_bytes(&scalar)
                    .map_err(|_| KeyError::Malformed("d is not a valid P-256 scalar".into()))?;
                if secret.public_key() != public {
                    return Err(KeyError::Malformed("d does not match x/y".into()));
                }
                Ok(CryptoKey::from_secret(secret))
            }
        }
    }
}

fn random_secret(rng: &mut impl RngCore) -> Result<SecretKey, KeyError> {
    for _ in 0..MAX_SCALAR_ATTEMPTS {
        let mut bytes = FieldBytes::default();
        rng.try_fill_bytes(bytes.as_mut_slice())
            .map_err(|e| KeyError::Generation(e.to_string()))?;
        if let Ok(secret) = SecretKey::from_bytes(&bytes) {
            return Ok(secret);
        }
    }
    Err(KeyError::Generation(
        "random source produced no valid P-256 scalar".into(),
    ))
}

fn decode_coordinate(name: &str, value: &str) -> Result<FieldBytes, KeyError> {
    let bytes = B64URL
        .decode(value)
        .map_err(|e| KeyError::Malformed(format!("{name}: {e}")))?;
    if bytes.len() != COORDINATE_LEN {
        return Err(KeyError::Malformed(format!(
            "{name}: expected {COORDINATE_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    Ok(FieldBytes::clone_from_slice(&bytes))
}
