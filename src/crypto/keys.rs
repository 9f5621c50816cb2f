//! Ed25519 key wrappers.
//!
//! Thin newtypes around `ed25519-dalek` keep raw key material out of the
//! rest of the crate and validate sizes at deserialization boundaries.

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};

use crate::Hash;

/// Ed25519 public key size.
const PUBLIC_KEY_BYTES: usize = 32;
/// Ed25519 detached signature size.
pub(crate) const SIGNATURE_BYTES: usize = 64;

/// An Ed25519 verifying key (32 bytes).
///
/// Inner bytes are `pub(crate)` so unvalidated keys cannot be constructed
/// outside the crate. Use [`SigningKeypair::generate`] or deserialization.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningPublicKey(pub(crate) [u8; PUBLIC_KEY_BYTES]);

/// An Ed25519 detached signature.
///
/// Empty signatures are permitted so the genesis merge event (which is
/// content-addressed but configurator-signed out of band) and test fixtures
/// can be represented; an empty signature never verifies.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Signature(pub(crate) Vec<u8>);

impl Signature {
    /// Create an empty signature (used for fixture events).
    pub fn empty() -> Self {
        Signature(vec![])
    }

    /// Access the raw signature bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            s.serialize_str(&format!("f{}", hex::encode(&self.0)))
        } else {
            serde::Serialize::serialize(&self.0, s)
        }
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: Vec<u8> = if d.is_human_readable() {
            let text: String = serde::Deserialize::deserialize(d)?;
            let rest = text
                .strip_prefix('f')
                .ok_or_else(|| serde::de::Error::custom("signature missing multibase prefix"))?;
            hex::decode(rest).map_err(serde::de::Error::custom)?
        } else {
            serde::Deserialize::deserialize(d)?
        };
        if !bytes.is_empty() && bytes.len() != SIGNATURE_BYTES {
            return Err(serde::de::Error::custom(format!(
                "invalid Ed25519 signature: expected {} bytes, got {}",
                SIGNATURE_BYTES,
                bytes.len()
            )));
        }
        Ok(Signature(bytes))
    }
}

/// An Ed25519 signing keypair.
///
/// Implements [`Clone`] because the keypair is shared between the merge
/// scheduler and the node's local operation path.
#[derive(Clone)]
pub struct SigningKeypair {
    pub public: SigningPublicKey,
    secret: [u8; 32],
}

impl SigningKeypair {
    /// Generate a new random Ed25519 keypair.
    pub fn generate() -> Self {
        let signing = ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng);
        SigningKeypair {
            public: SigningPublicKey(signing.verifying_key().to_bytes()),
            secret: signing.to_bytes(),
        }
    }

    /// Reconstruct a keypair from a stored 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let signing = ed25519_dalek::SigningKey::from_bytes(&seed);
        SigningKeypair {
            public: SigningPublicKey(signing.verifying_key().to_bytes()),
            secret: seed,
        }
    }

    /// The stored seed bytes (for key-file persistence).
    pub fn seed(&self) -> &[u8; 32] {
        &self.secret
    }

    /// Sign a message, producing a detached signature.
    pub fn sign(&self, message: &[u8]) -> Signature {
        let signing = ed25519_dalek::SigningKey::from_bytes(&self.secret);
        Signature(signing.sign(message).to_bytes().to_vec())
    }
}

impl SigningPublicKey {
    /// Access the raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_BYTES] {
        &self.0
    }

    /// Construct from raw bytes, rejecting invalid curve points.
    pub fn from_bytes(bytes: [u8; PUBLIC_KEY_BYTES]) -> Option<Self> {
        ed25519_dalek::VerifyingKey::from_bytes(&bytes).ok()?;
        Some(SigningPublicKey(bytes))
    }

    /// Verify a detached signature against this public key.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> bool {
        let Ok(key) = ed25519_dalek::VerifyingKey::from_bytes(&self.0) else {
            return false;
        };
        let Ok(sig_bytes) = <[u8; SIGNATURE_BYTES]>::try_from(signature.0.as_slice()) else {
            return false;
        };
        let sig = ed25519_dalek::Signature::from_bytes(&sig_bytes);
        key.verify(message, &sig).is_ok()
    }

    /// Derive a compact fingerprint (BLAKE3 hash of the public key).
    ///
    /// Fingerprints are the stable peer/creator identity used throughout
    /// the protocol.
    pub fn fingerprint(&self) -> Hash {
        crate::hash_domain(b"weft.signing.fingerprint", &self.0)
    }
}

impl Serialize for SigningPublicKey {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        if s.is_human_readable() {
            s.serialize_str(&crate::multibase_encode(&self.0))
        } else {
            serde::Serialize::serialize(&self.0, s)
        }
    }
}

impl<'de> Deserialize<'de> for SigningPublicKey {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let bytes: [u8; PUBLIC_KEY_BYTES] = if d.is_human_readable() {
            let text: String = serde::Deserialize::deserialize(d)?;
            crate::multibase_decode(&text)
                .ok_or_else(|| serde::de::Error::custom("invalid multibase public key"))?
        } else {
            serde::Deserialize::deserialize(d)?
        };
        SigningPublicKey::from_bytes(bytes)
            .ok_or_else(|| serde::de::Error::custom("invalid Ed25519 public key"))
    }
}

/// Load or generate a persistent node keypair.
///
/// Reads the 32-byte seed from `data_dir/node.key` if it exists; otherwise
/// generates a new keypair and writes the seed to that path.
pub fn load_or_generate_keypair(data_dir: &std::path::Path) -> std::io::Result<SigningKeypair> {
    let key_path = data_dir.join("node.key");
    if key_path.exists() {
        let bytes = std::fs::read(&key_path)?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, "key file corrupted")
        })?;
        let keypair = SigningKeypair::from_seed(seed);
        tracing::info!(
            key = %hex::encode(&keypair.public.fingerprint()[..8]),
            "Loaded node key"
        );
        Ok(keypair)
    } else {
        std::fs::create_dir_all(data_dir)?;
        let keypair = SigningKeypair::generate();
        std::fs::write(&key_path, keypair.seed())?;
        tracing::info!(
            key = %hex::encode(&keypair.public.fingerprint()[..8]),
            "Generated node key"
        );
        Ok(keypair)
    }
}
