//! Key rings and the public identity derived from them.
//!
//! A key ring is the bincode encoding of a list of public keys, each tagged
//! with what it may be used for. The first signing key and the first
//! encrypting key are the ring's designated keys; together they determine the
//! peer's [`PublicIdentityHandle`].

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::Signature;
use ed25519_dalek::VerifyingKey;
use serde::Deserialize;
use serde::Serialize;
use sha3::Digest;
use sha3::Sha3_256;

/// Domain separator mixed into every identity handle.
const IDENTITY_HANDLE_DOMAIN: &[u8] = b"circle-rendezvous:identity-handle:v1:";

pub const IDENTITY_HANDLE_SIZE_IN_BYTES: usize = 32;
pub const PUBLIC_KEY_SIZE_IN_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("invalid key ring: {0}")]
    InvalidKeyRing(String),

    #[error("key ring has no designated signing or encrypting key")]
    NoSigningOrEncryptingKey,

    #[error("invalid identity handle: {0:?}")]
    InvalidHandle(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyUsage {
    Signing,
    Encrypting,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRingEntry {
    pub usage: KeyUsage,
    pub key: [u8; PUBLIC_KEY_SIZE_IN_BYTES],
}

impl KeyRingEntry {
    pub fn signing(key: &VerifyingKey) -> Self {
        Self {
            usage: KeyUsage::Signing,
            key: key.to_bytes(),
        }
    }

    pub fn encrypting(key: &x25519_dalek::PublicKey) -> Self {
        Self {
            usage: KeyUsage::Encrypting,
            key: key.to_bytes(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRing {
    entries: Vec<KeyRingEntry>,
}

impl KeyRing {
    pub fn new(entries: Vec<KeyRingEntry>) -> Self {
        Self { entries }
    }

    pub fn entries(&self) -> &[KeyRingEntry] {
        &self.entries
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IdentityError> {
        bincode::deserialize(bytes).map_err(|e| IdentityError::InvalidKeyRing(e.to_string()))
    }

    pub fn to_bytes(&self) -> bincode::Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// The first key marked for signing. A signing entry that is not a valid
    /// Ed25519 point invalidates the whole ring.
    fn designated_signing_key(&self) -> Result<Option<VerifyingKey>, IdentityError> {
        self.entries
            .iter()
            .find(|entry| entry.usage == KeyUsage::Signing)
            .map(|entry| {
                VerifyingKey::from_bytes(&entry.key)
                    .map_err(|e| IdentityError::InvalidKeyRing(format!("bad signing key: {e}")))
            })
            .transpose()
    }

    fn designated_encrypting_key(&self) -> Option<x25519_dalek::PublicKey> {
        self.entries
            .iter()
            .find(|entry| entry.usage == KeyUsage::Encrypting)
            .map(|entry| x25519_dalek::PublicKey::from(entry.key))
    }
}

/// Stable identifier of a peer, and the name of its directory entry.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicIdentityHandle([u8; IDENTITY_HANDLE_SIZE_IN_BYTES]);

impl PublicIdentityHandle {
    fn from_keys(signing_key: &VerifyingKey, encrypting_key: &x25519_dalek::PublicKey) -> Self {
        let mut hasher = Sha3_256::new();
        hasher.update(IDENTITY_HANDLE_DOMAIN);
        hasher.update(signing_key.as_bytes());
        hasher.update(encrypting_key.as_bytes());
        Self(hasher.finalize().into())
    }
}

impl fmt::Display for PublicIdentityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for PublicIdentityHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicIdentityHandle({self})")
    }
}

impl FromStr for PublicIdentityHandle {
    type Err = IdentityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; IDENTITY_HANDLE_SIZE_IN_BYTES];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| IdentityError::InvalidHandle(s.to_string()))?;
        Ok(Self(bytes))
    }
}

/// The designated keys of a key ring together with the handle they reduce to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    handle: PublicIdentityHandle,
    signing_key: VerifyingKey,
    encrypting_key: x25519_dalek::PublicKey,
}

impl PublicIdentity {
    pub fn handle(&self) -> PublicIdentityHandle {
        self.handle
    }

    /// Check `signature` over `signed_bytes` against the designated signing
    /// key. Malformed signatures are reported as a mismatch.
    pub fn verify(&self, signed_bytes: &[u8], signature: &[u8]) -> bool {
        let Ok(signature) = Signature::from_slice(signature) else {
            return false;
        };
        self.signing_key
            .verify_strict(signed_bytes, &signature)
            .is_ok()
    }
}

/// Parse `key_ring_bytes` and derive the identity of its designated keys.
///
/// The derivation depends only on the designated signing and encrypting keys,
/// so the same bytes always produce the same handle.
pub fn derive_identity(key_ring_bytes: &[u8]) -> Result<PublicIdentity, IdentityError> {
    let key_ring = KeyRing::from_bytes(key_ring_bytes)?;
    let signing_key = key_ring.designated_signing_key()?;
    let encrypting_key = key_ring.designated_encrypting_key();

    match (signing_key, encrypting_key) {
        (Some(signing_key), Some(encrypting_key)) => Ok(PublicIdentity {
            handle: PublicIdentityHandle::from_keys(&signing_key, &encrypting_key),
            signing_key,
            encrypting_key,
        }),
        _ => Err(IdentityError::NoSigningOrEncryptingKey),
    }
}
