/// The site program: an addressable, replicated bundle of seven document
/// collections with access policies installed at open time.
///
/// A site exclusively owns its collections. The typed API stamps every
/// record with the local `posted_by` and `site_address`, so federated rows
/// (rows whose address differs) can only enter through log joins, where
/// the access policy decides their fate.
use crate::config::SiteArgs;
use crate::error::{FedResult, FederationError};
use crate::identity::Identity;
use crate::policy::{
    FederatedCollectionPolicy, RootOfTrustPolicy, SubscriptionPolicy,
};
use crate::query::{Query, SearchOptions};
use crate::runtime::store::{Document, PutReceipt, Store};
use crate::runtime::{
    DocumentRuntime, SiteState, ADMINISTRATORS, BLOCKED_CONTENT, CONTENT_CATEGORIES,
    FEATURED_RELEASES, MEMBERS, RELEASES, SUBSCRIPTIONS,
};
use crate::schema::{
    Administrator, BlockedContent, ContentCategory, FeaturedRelease, Member, Record, Release,
    SiteAddress, SiteMetadata, Subscription,
};
use crate::identity::PublicKey;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Fields of a release under the caller's control.
///
/// `posted_by` and `site_address` are stamped by the site.
#[derive(Debug, Clone, Default)]
pub struct ReleaseDraft {
    pub name: String,
    pub category_id: String,
    pub content_cid: String,
    pub thumbnail_cid: Option<String>,
    pub metadata: Option<String>,
}

/// Caller-controlled fields of a featured release.
#[derive(Debug, Clone, Default)]
pub struct FeaturedReleaseDraft {
    pub release_id: String,
    pub start_time: u64,
    pub end_time: u64,
    pub promoted: bool,
}

/// Caller-controlled fields of a content category.
#[derive(Debug, Clone, Default)]
pub struct ContentCategoryDraft {
    pub category_id: String,
    pub display_name: String,
    pub featured: bool,
    pub description: Option<String>,
    pub metadata_schema: Option<String>,
}

/// An addressable, replicated site.
pub struct Site {
    runtime: Arc<DocumentRuntime>,
    identity: Arc<Identity>,
    address: SiteAddress,
    state: Arc<SiteState>,
    releases: Arc<Store>,
    featured_releases: Arc<Store>,
    content_categories: Arc<Store>,
    blocked_content: Arc<Store>,
    subscriptions: Arc<Store>,
    members: Arc<Store>,
    administrators: Arc<Store>,
    closed: AtomicBool,
}

impl Site {
    /// Open a fresh site with the given collection parameters.
    ///
    /// The identity becomes the site's root of trust and is seeded as its
    /// first administrator. The site registers with the runtime under a
    /// newly derived genesis address.
    pub async fn open(
        runtime: Arc<DocumentRuntime>,
        identity: Arc<Identity>,
        args: SiteArgs,
    ) -> FedResult<Arc<Self>> {
        let address = SiteAddress::from_genesis(identity.public_key());
        let root = identity.public_key().clone();

        let members = Store::open(
            MEMBERS,
            address.clone(),
            Arc::new(RootOfTrustPolicy::new(root.clone())),
            args.members_args.clone(),
        );
        let administrators = Store::open(
            ADMINISTRATORS,
            address.clone(),
            Arc::new(RootOfTrustPolicy::new(root.clone())),
            args.administrators_args.clone(),
        );
        let subscriptions = Store::open(
            SUBSCRIPTIONS,
            address.clone(),
            Arc::new(SubscriptionPolicy::new(
                address.clone(),
                Arc::clone(&administrators),
            )),
            args.subscriptions_args.clone(),
        );

        let federated_policy = || {
            Arc::new(FederatedCollectionPolicy::new(
                address.clone(),
                Arc::clone(&subscriptions),
                Arc::clone(&members),
                Arc::clone(&administrators),
            ))
        };
        let releases = Store::open(
            RELEASES,
            address.clone(),
            federated_policy(),
            args.releases_args.clone(),
        );
        let featured_releases = Store::open(
            FEATURED_RELEASES,
            address.clone(),
            federated_policy(),
            args.featured_releases_args.clone(),
        );
        let content_categories = Store::open(
            CONTENT_CATEGORIES,
            address.clone(),
            federated_policy(),
            args.content_categories_args.clone(),
        );
        let blocked_content = Store::open(
            BLOCKED_CONTENT,
            address.clone(),
            federated_policy(),
            args.blocked_content_args.clone(),
        );

        // The root of trust is the site's first administrator.
        let admin_row = Administrator {
            public_key: root.clone(),
            posted_by: root.clone(),
            site_address: address.clone(),
        };
        administrators
            .put_document(
                admin_row.deterministic_id().unwrap_or_default(),
                admin_row.to_value()?,
                &identity,
            )
            .await?;

        let mut stores = HashMap::new();
        for store in [
            &releases,
            &featured_releases,
            &content_categories,
            &blocked_content,
            &subscriptions,
            &members,
            &administrators,
        ] {
            stores.insert(store.name().to_string(), Arc::clone(store));
        }
        let state = SiteState::new(address.clone(), stores);
        runtime.register_site(Arc::clone(&state));

        tracing::info!(address = %address, "site opened");

        Ok(Arc::new(Self {
            runtime,
            identity,
            address,
            state,
            releases,
            featured_releases,
            content_categories,
            blocked_content,
            subscriptions,
            members,
            administrators,
            closed: AtomicBool::new(false),
        }))
    }

    /// Attach to a site already hosted by this runtime.
    ///
    /// Collection handles are shared with the hosting program; the
    /// attaching identity is used for status computation.
    pub fn attach(
        runtime: Arc<DocumentRuntime>,
        identity: Arc<Identity>,
        address: SiteAddress,
    ) -> FedResult<Arc<Self>> {
        let state = runtime
            .site(&address)
            .ok_or_else(|| FederationError::Network(format!("unknown site {}", address)))?;

        let store = |name: &str| -> FedResult<Arc<Store>> {
            state
                .store(name)
                .map(Arc::clone)
                .ok_or_else(|| FederationError::Runtime(format!("site missing '{}'", name)))
        };

        Ok(Arc::new(Self {
            releases: store(RELEASES)?,
            featured_releases: store(FEATURED_RELEASES)?,
            content_categories: store(CONTENT_CATEGORIES)?,
            blocked_content: store(BLOCKED_CONTENT)?,
            subscriptions: store(SUBSCRIPTIONS)?,
            members: store(MEMBERS)?,
            administrators: store(ADMINISTRATORS)?,
            state,
            runtime,
            identity,
            address,
            closed: AtomicBool::new(false),
        }))
    }

    /// The site's stable address.
    pub fn address(&self) -> &SiteAddress {
        &self.address
    }

    /// The pubsub topic carrying this site's outgoing federation traffic.
    ///
    /// Stable for the lifetime of the site.
    pub fn federation_topic(&self) -> String {
        format!("{}/federation", self.address)
    }

    /// The identity this site signs with.
    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// The runtime hosting this site.
    pub fn runtime(&self) -> &Arc<DocumentRuntime> {
        &self.runtime
    }

    /// Close the site: unregister from the runtime and release every
    /// collection handle.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.runtime.unregister_site(&self.address);
        for store in self.all_stores() {
            store.close();
        }
        tracing::info!(address = %self.address, "site closed");
    }

    fn all_stores(&self) -> [&Arc<Store>; 7] {
        [
            &self.releases,
            &self.featured_releases,
            &self.content_categories,
            &self.blocked_content,
            &self.subscriptions,
            &self.members,
            &self.administrators,
        ]
    }

    // ─── Collection accessors ───────────────────────────────────────────

    pub fn releases(&self) -> &Arc<Store> {
        &self.releases
    }

    pub fn featured_releases(&self) -> &Arc<Store> {
        &self.featured_releases
    }

    pub fn content_categories(&self) -> &Arc<Store> {
        &self.content_categories
    }

    pub fn blocked_content(&self) -> &Arc<Store> {
        &self.blocked_content
    }

    pub fn subscriptions(&self) -> &Arc<Store> {
        &self.subscriptions
    }

    pub fn members(&self) -> &Arc<Store> {
        &self.members
    }

    pub fn administrators(&self) -> &Arc<Store> {
        &self.administrators
    }

    // ─── Site metadata ──────────────────────────────────────────────────

    /// Read the site-level metadata.
    pub async fn metadata(&self) -> SiteMetadata {
        self.state.metadata().await
    }

    /// Replace the site-level metadata.
    pub async fn set_metadata(&self, metadata: SiteMetadata) {
        self.state.set_metadata(metadata).await;
    }

    // ─── Releases ───────────────────────────────────────────────────────

    /// Add a release authored by this site.
    pub async fn add_release(&self, draft: ReleaseDraft) -> FedResult<PutReceipt> {
        let record = Release {
            name: draft.name,
            category_id: draft.category_id,
            content_cid: draft.content_cid,
            thumbnail_cid: draft.thumbnail_cid,
            metadata: draft.metadata,
            posted_by: self.identity.public_key().clone(),
            site_address: self.address.clone(),
        };
        self.releases
            .put_document(Uuid::new_v4().to_string(), record.to_value()?, &self.identity)
            .await
    }

    /// Edit a release. Only permitted at the origin site.
    pub async fn edit_release(&self, id: &str, draft: ReleaseDraft) -> FedResult<PutReceipt> {
        let existing = self.get_release(id)?.ok_or_else(|| FederationError::NotFound {
            collection: RELEASES.to_string(),
            id: id.to_string(),
        })?;
        if existing.site_address != self.address {
            // Federated rows are only mutated through delete-propagation.
            return Err(FederationError::AccessDenied);
        }
        let record = Release {
            name: draft.name,
            category_id: draft.category_id,
            content_cid: draft.content_cid,
            thumbnail_cid: draft.thumbnail_cid,
            metadata: draft.metadata,
            posted_by: existing.posted_by,
            site_address: existing.site_address,
        };
        self.releases
            .put_document(id, record.to_value()?, &self.identity)
            .await
    }

    /// Delete a release by id.
    pub async fn delete_release(&self, id: &str) -> FedResult<()> {
        self.releases
            .del_document(id, &self.identity)
            .await
            .map(|_| ())
    }

    /// Get a release by id.
    pub fn get_release(&self, id: &str) -> FedResult<Option<Release>> {
        decode_document(self.releases.index_get(id))
    }

    /// Search releases.
    pub fn get_releases(&self, options: &SearchOptions) -> Vec<Release> {
        decode_documents(self.releases.search(options))
    }

    // ─── Featured releases ──────────────────────────────────────────────

    /// Feature a release for a promotion window.
    pub async fn add_featured_release(
        &self,
        draft: FeaturedReleaseDraft,
    ) -> FedResult<PutReceipt> {
        let record = FeaturedRelease {
            release_id: draft.release_id,
            start_time: draft.start_time,
            end_time: draft.end_time,
            promoted: draft.promoted,
            posted_by: self.identity.public_key().clone(),
            site_address: self.address.clone(),
        };
        self.featured_releases
            .put_document(Uuid::new_v4().to_string(), record.to_value()?, &self.identity)
            .await
    }

    /// Delete a featured release by id.
    pub async fn delete_featured_release(&self, id: &str) -> FedResult<()> {
        self.featured_releases
            .del_document(id, &self.identity)
            .await
            .map(|_| ())
    }

    /// Get a featured release by id.
    pub fn get_featured_release(&self, id: &str) -> FedResult<Option<FeaturedRelease>> {
        decode_document(self.featured_releases.index_get(id))
    }

    /// Search featured releases.
    pub fn get_featured_releases(&self, options: &SearchOptions) -> Vec<FeaturedRelease> {
        decode_documents(self.featured_releases.search(options))
    }

    // ─── Content categories ─────────────────────────────────────────────

    /// Create or update a category. The id is deterministic per
    /// (site, category_id), so repeated puts collapse to one row.
    pub async fn add_content_category(
        &self,
        draft: ContentCategoryDraft,
    ) -> FedResult<PutReceipt> {
        let mut record = ContentCategory {
            category_id: draft.category_id,
            display_name: draft.display_name,
            featured: draft.featured,
            description: draft.description,
            metadata_schema: draft.metadata_schema,
            posted_by: self.identity.public_key().clone(),
            site_address: self.address.clone(),
        };
        let id = record
            .deterministic_id()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        // An update keeps the original author.
        if let Some(existing) = self.get_content_category(&id)? {
            record.posted_by = existing.posted_by;
        }
        self.content_categories
            .put_document(id, record.to_value()?, &self.identity)
            .await
    }

    /// Delete a category by id.
    pub async fn delete_content_category(&self, id: &str) -> FedResult<()> {
        self.content_categories
            .del_document(id, &self.identity)
            .await
            .map(|_| ())
    }

    /// Get a category by id.
    pub fn get_content_category(&self, id: &str) -> FedResult<Option<ContentCategory>> {
        decode_document(self.content_categories.index_get(id))
    }

    /// Search categories.
    pub fn get_content_categories(&self, options: &SearchOptions) -> Vec<ContentCategory> {
        decode_documents(self.content_categories.search(options))
    }

    // ─── Blocked content ────────────────────────────────────────────────

    /// Block a content CID.
    pub async fn block_content(&self, content_cid: &str) -> FedResult<PutReceipt> {
        let mut record = BlockedContent {
            content_cid: content_cid.to_string(),
            posted_by: self.identity.public_key().clone(),
            site_address: self.address.clone(),
        };
        let id = record
            .deterministic_id()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if let Some(existing) = self.blocked_content.index_get(&id) {
            if let Some(original) = crate::schema::document_posted_by(&existing.value) {
                record.posted_by = original;
            }
        }
        self.blocked_content
            .put_document(id, record.to_value()?, &self.identity)
            .await
    }

    /// Revoke a block by id.
    pub async fn unblock_content(&self, id: &str) -> FedResult<()> {
        self.blocked_content
            .del_document(id, &self.identity)
            .await
            .map(|_| ())
    }

    /// Search blocked content.
    pub fn get_blocked_content(&self, options: &SearchOptions) -> Vec<BlockedContent> {
        decode_documents(self.blocked_content.search(options))
    }

    // ─── Subscriptions ──────────────────────────────────────────────────

    /// Subscribe to a remote site.
    ///
    /// A subscription to this site's own address is silently ignored.
    pub async fn add_subscription(
        &self,
        to: SiteAddress,
        name: Option<String>,
        recursive: Option<bool>,
    ) -> FedResult<Option<PutReceipt>> {
        if to == self.address {
            tracing::debug!(address = %self.address, "ignoring self-subscription");
            return Ok(None);
        }
        let record = Subscription {
            to,
            name,
            recursive,
            posted_by: self.identity.public_key().clone(),
            site_address: self.address.clone(),
        };
        let receipt = self
            .subscriptions
            .put_document(Uuid::new_v4().to_string(), record.to_value()?, &self.identity)
            .await?;
        Ok(Some(receipt))
    }

    /// Delete a subscription by id.
    pub async fn delete_subscription(&self, id: &str) -> FedResult<()> {
        self.subscriptions
            .del_document(id, &self.identity)
            .await
            .map(|_| ())
    }

    /// Find the subscription row pointing at a remote address, if any.
    pub fn subscription_to(&self, address: &SiteAddress) -> Option<Document> {
        self.subscriptions
            .search(
                &SearchOptions::new()
                    .query(Query::field_eq("to", address.as_str()))
                    .fetch(1),
            )
            .into_iter()
            .next()
    }

    /// Search subscriptions.
    pub fn get_subscriptions(&self, options: &SearchOptions) -> Vec<Subscription> {
        decode_documents(self.subscriptions.search(options))
    }

    // ─── Members and administrators ─────────────────────────────────────

    /// Add a member. Root-of-trust only.
    pub async fn add_member(&self, public_key: PublicKey) -> FedResult<PutReceipt> {
        let record = Member {
            public_key,
            posted_by: self.identity.public_key().clone(),
            site_address: self.address.clone(),
        };
        let id = record
            .deterministic_id()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.members
            .put_document(id, record.to_value()?, &self.identity)
            .await
    }

    /// Remove a member. Root-of-trust only.
    pub async fn remove_member(&self, public_key: &PublicKey) -> FedResult<()> {
        self.members
            .del_document(public_key.as_str(), &self.identity)
            .await
            .map(|_| ())
    }

    /// Add an administrator. Root-of-trust only.
    pub async fn add_administrator(&self, public_key: PublicKey) -> FedResult<PutReceipt> {
        let record = Administrator {
            public_key,
            posted_by: self.identity.public_key().clone(),
            site_address: self.address.clone(),
        };
        let id = record
            .deterministic_id()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        self.administrators
            .put_document(id, record.to_value()?, &self.identity)
            .await
    }

    /// Remove an administrator. Root-of-trust only.
    pub async fn remove_administrator(&self, public_key: &PublicKey) -> FedResult<()> {
        self.administrators
            .del_document(public_key.as_str(), &self.identity)
            .await
            .map(|_| ())
    }

    /// Whether a key is listed as a member.
    pub fn is_member(&self, key: &PublicKey) -> bool {
        self.members.index_get(key.as_str()).is_some()
    }

    /// Whether a key is listed as an administrator.
    pub fn is_administrator(&self, key: &PublicKey) -> bool {
        self.administrators.index_get(key.as_str()).is_some()
    }
}

fn decode_document<R: Record>(document: Option<Document>) -> FedResult<Option<R>> {
    match document {
        Some(doc) => Ok(Some(R::from_value(&doc.value)?)),
        None => Ok(None),
    }
}

fn decode_documents<R: Record>(documents: Vec<Document>) -> Vec<R> {
    documents
        .iter()
        .filter_map(|doc| R::from_value(&doc.value).ok())
        .collect()
}
