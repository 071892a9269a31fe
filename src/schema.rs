/// Record schemas for the seven replicated collections.
///
/// Every record carries `posted_by` (the signing key of its author) and
/// `site_address` (the site that originated it). `site_address` is the
/// authoritative federation-origin field: a row whose address differs from
/// the local site's is a federated replica, weakly owned by its origin.
///
/// Each record type has a stable tag string for multiplexed decode and a
/// pair of serialization helpers (`to_value` / `from_value`). Ids are
/// either server-assigned opaque uuids or, for categories and blocked
/// content, deterministic hashes that dedupe per site.
use crate::error::FedResult;
use crate::identity::PublicKey;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

/// An opaque, stable site address derived from the site program's genesis.
///
/// Used as the federation identity and as every record's `site_address`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SiteAddress(String);

impl SiteAddress {
    /// Wrap an existing address string.
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    /// Derive a fresh address from a site's genesis material.
    ///
    /// The genesis is the root-of-trust key plus a random nonce, hashed and
    /// base58-encoded. Stable for the lifetime of the site.
    pub fn from_genesis(root: &PublicKey) -> Self {
        let nonce = uuid::Uuid::new_v4();
        let digest = blake3::hash(format!("{}:{}", root, nonce).as_bytes());
        Self(bs58::encode(digest.as_bytes()).into_string())
    }

    /// The address string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SiteAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Current time as a millisecond epoch.
///
/// All timestamps in this subsystem are u64 millisecond epochs.
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// A replicated record: serializable, tagged, and attributable.
pub trait Record: Serialize + DeserializeOwned {
    /// Stable tag string for multiplexed decode.
    const TAG: &'static str;

    /// The key that authored this record.
    fn posted_by(&self) -> &PublicKey;

    /// The site this record originated from.
    fn site_address(&self) -> &SiteAddress;

    /// Deterministic id, for record types that dedupe by content.
    ///
    /// Returns `None` for types with server-assigned opaque ids.
    fn deterministic_id(&self) -> Option<String> {
        None
    }

    /// Serialize into the document form stored in a collection index.
    fn to_value(&self) -> FedResult<JsonValue> {
        Ok(serde_json::to_value(self)?)
    }

    /// Deserialize from a stored document.
    fn from_value(value: &JsonValue) -> FedResult<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

fn sha256_hex(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        // NUL-delimit the parts so ("ab","c") and ("a","bc") hash apart.
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(hasher.finalize())
}

/// A content pointer published by a site.
///
/// The content itself lives in an external content-addressed store; only
/// the CID travels through federation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    /// Display name of the release.
    pub name: String,
    /// Id of the category this release belongs to.
    pub category_id: String,
    /// CID of the content payload.
    pub content_cid: String,
    /// Optional CID of a thumbnail image.
    pub thumbnail_cid: Option<String>,
    /// Optional free-form metadata blob.
    pub metadata: Option<String>,
    /// The key that posted this release.
    pub posted_by: PublicKey,
    /// The originating site.
    pub site_address: SiteAddress,
}

impl Record for Release {
    const TAG: &'static str = "release";

    fn posted_by(&self) -> &PublicKey {
        &self.posted_by
    }

    fn site_address(&self) -> &SiteAddress {
        &self.site_address
    }
}

/// A time-bounded promotion of a release.
///
/// The `release_id` reference is advisory: a featured release whose release
/// is not locally present is permitted and simply inert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeaturedRelease {
    /// Id of the promoted release.
    pub release_id: String,
    /// Start of the promotion window (ms epoch).
    pub start_time: u64,
    /// End of the promotion window (ms epoch).
    pub end_time: u64,
    /// Whether the release is actively promoted.
    pub promoted: bool,
    /// The key that posted this record.
    pub posted_by: PublicKey,
    /// The originating site.
    pub site_address: SiteAddress,
}

impl Record for FeaturedRelease {
    const TAG: &'static str = "featured_release";

    fn posted_by(&self) -> &PublicKey {
        &self.posted_by
    }

    fn site_address(&self) -> &SiteAddress {
        &self.site_address
    }
}

/// A category definition for organizing releases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentCategory {
    /// Site-scoped category identifier (e.g. "movies").
    pub category_id: String,
    /// Human-readable name.
    pub display_name: String,
    /// Whether this category is surfaced prominently.
    pub featured: bool,
    /// Optional description.
    pub description: Option<String>,
    /// Optional JSON schema constraining release metadata in this category.
    pub metadata_schema: Option<String>,
    /// The key that posted this category.
    pub posted_by: PublicKey,
    /// The originating site.
    pub site_address: SiteAddress,
}

impl Record for ContentCategory {
    const TAG: &'static str = "content_category";

    fn posted_by(&self) -> &PublicKey {
        &self.posted_by
    }

    fn site_address(&self) -> &SiteAddress {
        &self.site_address
    }

    fn deterministic_id(&self) -> Option<String> {
        Some(category_id(&self.site_address, &self.category_id))
    }
}

/// Deterministic ContentCategory document id: hash of `site_address ‖ category_id`.
///
/// Two puts with the same (site, category) pair collapse to a single row.
pub fn category_id(site: &SiteAddress, category: &str) -> String {
    sha256_hex(&[site.as_str(), category])
}

/// An admin-managed block entry for a content CID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedContent {
    /// CID of the blocked content.
    pub content_cid: String,
    /// The key that posted this block.
    pub posted_by: PublicKey,
    /// The originating site.
    pub site_address: SiteAddress,
}

impl Record for BlockedContent {
    const TAG: &'static str = "blocked_content";

    fn posted_by(&self) -> &PublicKey {
        &self.posted_by
    }

    fn site_address(&self) -> &SiteAddress {
        &self.site_address
    }

    fn deterministic_id(&self) -> Option<String> {
        Some(blocked_content_id(&self.site_address, &self.content_cid))
    }
}

/// Deterministic BlockedContent document id, derived from the CID per site.
pub fn blocked_content_id(site: &SiteAddress, content_cid: &str) -> String {
    sha256_hex(&[site.as_str(), content_cid])
}

/// A subscription to a remote site's federated collections.
///
/// Creating one triggers federation start (live pubsub + historical
/// backfill); removing it triggers cleanup of the origin's federated rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// The remote site address being subscribed to.
    pub to: SiteAddress,
    /// Optional human-readable name for the subscription.
    pub name: Option<String>,
    /// One-hop recursion hint. Carried and serialized, but the broadcast
    /// path never re-emits foreign writes, so it has no runtime effect.
    pub recursive: Option<bool>,
    /// The administrator that created the subscription.
    pub posted_by: PublicKey,
    /// The subscribing site (always the local site).
    pub site_address: SiteAddress,
}

impl Record for Subscription {
    const TAG: &'static str = "subscription";

    fn posted_by(&self) -> &PublicKey {
        &self.posted_by
    }

    fn site_address(&self) -> &SiteAddress {
        &self.site_address
    }
}

/// A member of the site, permitted to post releases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    /// The member's public key; also the document id.
    pub public_key: PublicKey,
    /// The root-of-trust key that added this member.
    pub posted_by: PublicKey,
    /// The site this membership applies to.
    pub site_address: SiteAddress,
}

impl Record for Member {
    const TAG: &'static str = "member";

    fn posted_by(&self) -> &PublicKey {
        &self.posted_by
    }

    fn site_address(&self) -> &SiteAddress {
        &self.site_address
    }

    fn deterministic_id(&self) -> Option<String> {
        Some(self.public_key.as_str().to_string())
    }
}

/// An administrator of the site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Administrator {
    /// The administrator's public key; also the document id.
    pub public_key: PublicKey,
    /// The root-of-trust key that added this administrator.
    pub posted_by: PublicKey,
    /// The site this role applies to.
    pub site_address: SiteAddress,
}

impl Record for Administrator {
    const TAG: &'static str = "administrator";

    fn posted_by(&self) -> &PublicKey {
        &self.posted_by
    }

    fn site_address(&self) -> &SiteAddress {
        &self.site_address
    }

    fn deterministic_id(&self) -> Option<String> {
        Some(self.public_key.as_str().to_string())
    }
}

/// Site-level descriptive metadata, readable by remote peers without
/// installing federation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteMetadata {
    /// Display name of the site.
    pub name: String,
    /// Optional description.
    pub description: Option<String>,
    /// Optional CID of a site image.
    pub image_cid: Option<String>,
}

/// Read the `site_address` field out of a stored document.
pub fn document_site_address(value: &JsonValue) -> Option<SiteAddress> {
    value
        .get("site_address")
        .and_then(|v| v.as_str())
        .map(SiteAddress::new)
}

/// Read the `posted_by` field out of a stored document.
pub fn document_posted_by(value: &JsonValue) -> Option<PublicKey> {
    value
        .get("posted_by")
        .and_then(|v| v.as_str())
        .map(PublicKey::new)
}
