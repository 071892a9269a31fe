/// Identities and signing for replicated log entries.
///
/// Every record in a site's collections is signed by the key that posted
/// it, and every log entry carries the signer's public key so receivers can
/// verify entries byte-for-byte after federation. Public keys and derived
/// identifiers are displayed as base58 strings.
use crate::error::{FedResult, FederationError};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// A public key in stable base58 string form.
///
/// This is the `posted_by` field of every record and the signer of every
/// log entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey(String);

impl PublicKey {
    /// Wrap an already-encoded base58 key string.
    pub fn new(encoded: impl Into<String>) -> Self {
        Self(encoded.into())
    }

    /// Encode a verifying key.
    pub fn from_verifying(key: &VerifyingKey) -> Self {
        Self(bs58::encode(key.as_bytes()).into_string())
    }

    /// Decode back into a verifying key.
    pub fn to_verifying(&self) -> FedResult<VerifyingKey> {
        let bytes = bs58::decode(&self.0)
            .into_vec()
            .map_err(|e| FederationError::Identity(format!("bad public key encoding: {}", e)))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| FederationError::Identity("public key must be 32 bytes".to_string()))?;
        VerifyingKey::from_bytes(&arr)
            .map_err(|e| FederationError::Identity(format!("invalid public key: {}", e)))
    }

    /// The base58 string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A signing identity owned by the local process.
///
/// Wraps an ed25519 keypair. The verifying half is what travels inside
/// records and log entries.
pub struct Identity {
    signing: SigningKey,
    public: PublicKey,
}

impl Identity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let public = PublicKey::from_verifying(&signing.verifying_key());
        Self { signing, public }
    }

    /// Build an identity from existing key material.
    pub fn from_signing_key(signing: SigningKey) -> Self {
        let public = PublicKey::from_verifying(&signing.verifying_key());
        Self { signing, public }
    }

    /// The public half of this identity.
    pub fn public_key(&self) -> &PublicKey {
        &self.public
    }

    /// A stable peer identifier derived from the public key.
    pub fn peer_id(&self) -> String {
        derive_peer_id(&self.public)
    }

    /// Sign a message, returning the detached signature bytes.
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing.sign(message).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("public", &self.public)
            .finish()
    }
}

/// Derive the stable peer id for a public key.
pub fn derive_peer_id(key: &PublicKey) -> String {
    let digest = blake3::hash(key.as_str().as_bytes());
    bs58::encode(digest.as_bytes()).into_string()
}

/// Verify a detached signature against a public key.
///
/// Returns `Ok(())` only when the key decodes and the signature checks out.
pub fn verify_signature(key: &PublicKey, message: &[u8], signature: &[u8]) -> FedResult<()> {
    let verifying = key.to_verifying()?;
    let arr: [u8; 64] = signature
        .try_into()
        .map_err(|_| FederationError::Identity("signature must be 64 bytes".to_string()))?;
    let signature = Signature::from_bytes(&arr);
    verifying
        .verify(message, &signature)
        .map_err(|e| FederationError::Identity(format!("signature verification failed: {}", e)))
}
