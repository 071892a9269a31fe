/// Signed append-only log entries.
///
/// A collection's history is a log of signed entries. Each entry names its
/// parent heads, carries a put or delete payload, and is content-addressed
/// by a blake3 hash over its canonical encoding. Entries travel
/// byte-for-byte through federation so receivers can verify the original
/// signature and preserve causal links.
use crate::error::{FedResult, FederationError};
use crate::identity::{verify_signature, Identity, PublicKey};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Content hash of a log entry, in hex form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryHash(String);

impl EntryHash {
    /// The hex string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EntryHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The mutation an entry applies to its collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// Store a document under a key.
    Put {
        /// Document id.
        key: String,
        /// The document body.
        document: JsonValue,
    },
    /// Tombstone a key.
    Del {
        /// Document id.
        key: String,
    },
}

impl EntryPayload {
    /// The document key this payload touches.
    pub fn key(&self) -> &str {
        match self {
            EntryPayload::Put { key, .. } => key,
            EntryPayload::Del { key } => key,
        }
    }

    /// The document body, for puts.
    pub fn document(&self) -> Option<&JsonValue> {
        match self {
            EntryPayload::Put { document, .. } => Some(document),
            EntryPayload::Del { .. } => None,
        }
    }

    /// Whether this payload is a delete.
    pub fn is_delete(&self) -> bool {
        matches!(self, EntryPayload::Del { .. })
    }
}

/// The signed-over portion of an entry, in canonical encoding order.
#[derive(Serialize)]
struct Signable<'a> {
    parents: &'a [EntryHash],
    payload: &'a EntryPayload,
    signer: &'a PublicKey,
    timestamp_ms: u64,
}

/// One entry in a collection's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Content hash of the canonical encoding plus signature.
    pub hash: EntryHash,
    /// Heads of the log at the time this entry was appended.
    pub parents: Vec<EntryHash>,
    /// The mutation payload.
    pub payload: EntryPayload,
    /// The key that signed this entry.
    pub signer: PublicKey,
    /// Append time, ms epoch.
    pub timestamp_ms: u64,
    /// Detached ed25519 signature over the canonical encoding.
    pub signature: Vec<u8>,
}

impl LogEntry {
    /// Create and sign a new entry.
    pub fn create(
        parents: Vec<EntryHash>,
        payload: EntryPayload,
        identity: &Identity,
        timestamp_ms: u64,
    ) -> FedResult<Self> {
        let signer = identity.public_key().clone();
        let canonical = canonical_bytes(&parents, &payload, &signer, timestamp_ms)?;
        let signature = identity.sign(&canonical);
        let hash = entry_hash(&canonical, &signature);

        Ok(Self {
            hash,
            parents,
            payload,
            signer,
            timestamp_ms,
            signature,
        })
    }

    /// Verify the signature and recompute the content hash.
    pub fn verify(&self) -> FedResult<()> {
        let canonical =
            canonical_bytes(&self.parents, &self.payload, &self.signer, self.timestamp_ms)?;
        verify_signature(&self.signer, &canonical, &self.signature)?;

        let expected = entry_hash(&canonical, &self.signature);
        if expected != self.hash {
            return Err(FederationError::Identity(format!(
                "entry hash mismatch: expected {}, found {}",
                expected, self.hash
            )));
        }
        Ok(())
    }

    /// Last-writer-wins ordering key: timestamp, then hash as a tiebreak.
    pub fn lww_key(&self) -> (u64, &str) {
        (self.timestamp_ms, self.hash.as_str())
    }
}

fn canonical_bytes(
    parents: &[EntryHash],
    payload: &EntryPayload,
    signer: &PublicKey,
    timestamp_ms: u64,
) -> FedResult<Vec<u8>> {
    let signable = Signable {
        parents,
        payload,
        signer,
        timestamp_ms,
    };
    Ok(bincode::serialize(&signable)?)
}

fn entry_hash(canonical: &[u8], signature: &[u8]) -> EntryHash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(canonical);
    hasher.update(signature);
    EntryHash(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn put_entry(identity: &Identity, key: &str, timestamp_ms: u64) -> LogEntry {
        LogEntry::create(
            Vec::new(),
            EntryPayload::Put {
                key: key.to_string(),
                document: json!({"name": "x"}),
            },
            identity,
            timestamp_ms,
        )
        .unwrap()
    }

    #[test]
    fn created_entries_verify() {
        let identity = Identity::generate();
        let entry = put_entry(&identity, "doc-1", 1000);
        entry.verify().unwrap();
    }

    #[test]
    fn tampered_payload_fails_verification() {
        let identity = Identity::generate();
        let mut entry = put_entry(&identity, "doc-1", 1000);
        entry.payload = EntryPayload::Del {
            key: "doc-1".to_string(),
        };
        assert!(entry.verify().is_err());
    }

    #[test]
    fn forged_signer_fails_verification() {
        let identity = Identity::generate();
        let other = Identity::generate();
        let mut entry = put_entry(&identity, "doc-1", 1000);
        entry.signer = other.public_key().clone();
        assert!(entry.verify().is_err());
    }

    #[test]
    fn identical_content_hashes_identically() {
        let identity = Identity::generate();
        let a = put_entry(&identity, "doc-1", 1000);
        let b = put_entry(&identity, "doc-1", 1000);
        assert_eq!(a.hash, b.hash);

        let later = put_entry(&identity, "doc-1", 1001);
        assert_ne!(a.hash, later.hash);
    }

    #[test]
    fn lww_key_orders_by_time_then_hash() {
        let identity = Identity::generate();
        let early = put_entry(&identity, "doc-1", 1000);
        let late = put_entry(&identity, "doc-1", 2000);
        assert!(late.lww_key() > early.lww_key());
    }

    #[test]
    fn entry_survives_json_round_trip() {
        let identity = Identity::generate();
        let entry = put_entry(&identity, "doc-1", 1000);
        let bytes = serde_json::to_vec(&entry).unwrap();
        let decoded: LogEntry = serde_json::from_slice(&bytes).unwrap();
        decoded.verify().unwrap();
        assert_eq!(decoded, entry);
    }
}
