/// The service façade: a stable, uniform API over a site program.
///
/// Mutating operations return a uniform `ServiceResponse` shape; getters
/// return typed results. Opening a site with `federate: true` wires up a
/// federation manager; `stop` reverses the order (manager first, then
/// site).
use crate::config::{FederationConfig, SiteArgs};
use crate::error::{FedResult, FederationError};
use crate::federation::FederationManager;
use crate::identity::{Identity, PublicKey};
use crate::query::SearchOptions;
use crate::runtime::store::PutReceipt;
use crate::runtime::DocumentRuntime;
use crate::schema::{
    BlockedContent, ContentCategory, FeaturedRelease, Release, SiteAddress, SiteMetadata,
    Subscription,
};
use crate::site::{ContentCategoryDraft, FeaturedReleaseDraft, ReleaseDraft, Site};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// The account's standing on the open site, computed from the membership
/// collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccountStatus {
    Guest,
    Member,
    Admin,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AccountStatus::Guest => "GUEST",
            AccountStatus::Member => "MEMBER",
            AccountStatus::Admin => "ADMIN",
        };
        write!(f, "{}", label)
    }
}

/// The uniform response shape for mutating operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceResponse {
    /// Whether the operation succeeded.
    pub success: bool,
    /// Id of the touched document, when one exists.
    pub id: Option<String>,
    /// Hash of the appended log entry, when one exists.
    pub hash: Option<String>,
    /// Short error string on failure.
    pub error: Option<String>,
}

impl ServiceResponse {
    fn ok() -> Self {
        Self {
            success: true,
            id: None,
            hash: None,
            error: None,
        }
    }

    fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::ok()
        }
    }

    fn failure(error: &FederationError) -> Self {
        Self {
            success: false,
            id: None,
            hash: None,
            error: Some(error.boundary_message()),
        }
    }

    fn from_put(result: FedResult<PutReceipt>) -> Self {
        match result {
            Ok(receipt) => Self {
                success: true,
                id: Some(receipt.id),
                hash: Some(receipt.hash),
                error: None,
            },
            Err(e) => Self::failure(&e),
        }
    }

    fn from_unit(result: FedResult<()>, id: &str) -> Self {
        match result {
            Ok(()) => Self::with_id(id),
            Err(e) => Self::failure(&e),
        }
    }
}

/// Which site to open.
pub enum SiteTarget {
    /// Create a fresh site owned by the service identity.
    New,
    /// Attach to a site already hosted by the runtime.
    Existing(SiteAddress),
}

/// Options for `open_site`.
pub struct OpenOptions {
    /// Per-collection open parameters.
    pub site_args: SiteArgs,
    /// Whether to start a federation manager for the site.
    pub federate: bool,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            site_args: SiteArgs::publishing(),
            federate: false,
        }
    }
}

/// Per-collection document counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteStats {
    pub releases: usize,
    pub featured_releases: usize,
    pub content_categories: usize,
    pub blocked_content: usize,
    pub subscriptions: usize,
    pub members: usize,
    pub administrators: usize,
}

/// A service instance: one identity, at most one open site.
pub struct SiteService {
    runtime: Arc<DocumentRuntime>,
    identity: Arc<Identity>,
    config: FederationConfig,
    site: Option<Arc<Site>>,
    manager: Option<FederationManager>,
}

impl SiteService {
    /// Initialize a service with a freshly generated identity.
    pub fn init(runtime: Arc<DocumentRuntime>) -> Self {
        Self::with_identity(runtime, Arc::new(Identity::generate()))
    }

    /// Initialize with an existing identity.
    pub fn with_identity(runtime: Arc<DocumentRuntime>, identity: Arc<Identity>) -> Self {
        Self {
            runtime,
            identity,
            config: FederationConfig::default(),
            site: None,
            manager: None,
        }
    }

    /// Override the federation timing constants.
    pub fn with_config(mut self, config: FederationConfig) -> Self {
        self.config = config;
        self
    }

    /// Open (or attach to) a site, optionally starting federation.
    pub async fn open_site(&mut self, target: SiteTarget, options: OpenOptions) -> ServiceResponse {
        if self.site.is_some() {
            return ServiceResponse::failure(&FederationError::Runtime(
                "a site is already open".to_string(),
            ));
        }

        let opened = match target {
            SiteTarget::New => {
                Site::open(
                    Arc::clone(&self.runtime),
                    Arc::clone(&self.identity),
                    options.site_args,
                )
                .await
            }
            SiteTarget::Existing(address) => Site::attach(
                Arc::clone(&self.runtime),
                Arc::clone(&self.identity),
                address,
            ),
        };

        let site = match opened {
            Ok(site) => site,
            Err(e) => return ServiceResponse::failure(&e),
        };

        if options.federate {
            let manager = FederationManager::new(Arc::clone(&site), self.config.clone());
            manager.start().await;
            self.manager = Some(manager);
        }

        let address = site.address().to_string();
        self.site = Some(site);
        ServiceResponse::with_id(address)
    }

    /// Stop federation (if any) and close the site.
    pub async fn stop(&mut self) -> ServiceResponse {
        if let Some(manager) = self.manager.take() {
            manager.stop().await;
        }
        if let Some(site) = self.site.take() {
            site.close();
        }
        ServiceResponse::ok()
    }

    fn require_site(&self) -> FedResult<&Arc<Site>> {
        self.site
            .as_ref()
            .ok_or_else(|| FederationError::Runtime("no site open".to_string()))
    }

    // ─── Identity and addressing ────────────────────────────────────────

    /// The service identity's public key.
    pub fn get_public_key(&self) -> &PublicKey {
        self.identity.public_key()
    }

    /// The stable peer id derived from the public key.
    pub fn get_peer_id(&self) -> String {
        self.identity.peer_id()
    }

    /// The open site's address.
    pub fn get_site_address(&self) -> FedResult<SiteAddress> {
        Ok(self.require_site()?.address().clone())
    }

    /// This account's standing on the open site.
    pub fn get_account_status(&self) -> FedResult<AccountStatus> {
        let site = self.require_site()?;
        let key = self.identity.public_key();
        if site.is_administrator(key) {
            Ok(AccountStatus::Admin)
        } else if site.is_member(key) {
            Ok(AccountStatus::Member)
        } else {
            Ok(AccountStatus::Guest)
        }
    }

    /// Probe a peer address.
    pub fn dial(&self, address: &SiteAddress) -> ServiceResponse {
        match self.runtime.dial(address) {
            Ok(()) => ServiceResponse::ok(),
            Err(e) => ServiceResponse::failure(&e),
        }
    }

    // ─── Site metadata ──────────────────────────────────────────────────

    /// Read the open site's metadata.
    pub async fn get_site_metadata(&self) -> FedResult<SiteMetadata> {
        Ok(self.require_site()?.metadata().await)
    }

    /// Replace the open site's metadata.
    pub async fn set_site_metadata(&self, metadata: SiteMetadata) -> ServiceResponse {
        match self.require_site() {
            Ok(site) => {
                site.set_metadata(metadata).await;
                ServiceResponse::ok()
            }
            Err(e) => ServiceResponse::failure(&e),
        }
    }

    /// Peek a remote site's metadata without installing federation.
    pub async fn get_remote_site_metadata(
        &self,
        address: &SiteAddress,
    ) -> FedResult<SiteMetadata> {
        let replica = self
            .runtime
            .open_remote(
                address,
                SiteArgs::remote_minimal(),
                self.config.remote_open_deadline,
            )
            .await?;
        let metadata = replica.metadata().await;
        replica.close();
        Ok(metadata)
    }

    /// Per-collection document counts for the open site.
    pub fn get_site_stats(&self) -> FedResult<SiteStats> {
        let site = self.require_site()?;
        Ok(SiteStats {
            releases: site.releases().index_len(),
            featured_releases: site.featured_releases().index_len(),
            content_categories: site.content_categories().index_len(),
            blocked_content: site.blocked_content().index_len(),
            subscriptions: site.subscriptions().index_len(),
            members: site.members().index_len(),
            administrators: site.administrators().index_len(),
        })
    }

    // ─── Releases ───────────────────────────────────────────────────────

    pub async fn add_release(&self, draft: ReleaseDraft) -> ServiceResponse {
        match self.require_site() {
            Ok(site) => ServiceResponse::from_put(site.add_release(draft).await),
            Err(e) => ServiceResponse::failure(&e),
        }
    }

    pub async fn edit_release(&self, id: &str, draft: ReleaseDraft) -> ServiceResponse {
        match self.require_site() {
            Ok(site) => ServiceResponse::from_put(site.edit_release(id, draft).await),
            Err(e) => ServiceResponse::failure(&e),
        }
    }

    pub async fn delete_release(&self, id: &str) -> ServiceResponse {
        match self.require_site() {
            Ok(site) => ServiceResponse::from_unit(site.delete_release(id).await, id),
            Err(e) => ServiceResponse::failure(&e),
        }
    }

    pub fn get_release(&self, id: &str) -> FedResult<Option<Release>> {
        self.require_site()?.get_release(id)
    }

    pub fn get_releases(&self, options: &SearchOptions) -> FedResult<Vec<Release>> {
        Ok(self.require_site()?.get_releases(options))
    }

    // ─── Featured releases ──────────────────────────────────────────────

    pub async fn add_featured_release(&self, draft: FeaturedReleaseDraft) -> ServiceResponse {
        match self.require_site() {
            Ok(site) => ServiceResponse::from_put(site.add_featured_release(draft).await),
            Err(e) => ServiceResponse::failure(&e),
        }
    }

    pub async fn delete_featured_release(&self, id: &str) -> ServiceResponse {
        match self.require_site() {
            Ok(site) => ServiceResponse::from_unit(site.delete_featured_release(id).await, id),
            Err(e) => ServiceResponse::failure(&e),
        }
    }

    pub fn get_featured_release(&self, id: &str) -> FedResult<Option<FeaturedRelease>> {
        self.require_site()?.get_featured_release(id)
    }

    pub fn get_featured_releases(
        &self,
        options: &SearchOptions,
    ) -> FedResult<Vec<FeaturedRelease>> {
        Ok(self.require_site()?.get_featured_releases(options))
    }

    // ─── Content categories ─────────────────────────────────────────────

    pub async fn add_content_category(&self, draft: ContentCategoryDraft) -> ServiceResponse {
        match self.require_site() {
            Ok(site) => ServiceResponse::from_put(site.add_content_category(draft).await),
            Err(e) => ServiceResponse::failure(&e),
        }
    }

    pub async fn delete_content_category(&self, id: &str) -> ServiceResponse {
        match self.require_site() {
            Ok(site) => ServiceResponse::from_unit(site.delete_content_category(id).await, id),
            Err(e) => ServiceResponse::failure(&e),
        }
    }

    pub fn get_content_category(&self, id: &str) -> FedResult<Option<ContentCategory>> {
        self.require_site()?.get_content_category(id)
    }

    pub fn get_content_categories(
        &self,
        options: &SearchOptions,
    ) -> FedResult<Vec<ContentCategory>> {
        Ok(self.require_site()?.get_content_categories(options))
    }

    // ─── Blocked content ────────────────────────────────────────────────

    pub async fn block_content(&self, content_cid: &str) -> ServiceResponse {
        match self.require_site() {
            Ok(site) => ServiceResponse::from_put(site.block_content(content_cid).await),
            Err(e) => ServiceResponse::failure(&e),
        }
    }

    pub async fn unblock_content(&self, id: &str) -> ServiceResponse {
        match self.require_site() {
            Ok(site) => ServiceResponse::from_unit(site.unblock_content(id).await, id),
            Err(e) => ServiceResponse::failure(&e),
        }
    }

    pub fn get_blocked_content(&self, options: &SearchOptions) -> FedResult<Vec<BlockedContent>> {
        Ok(self.require_site()?.get_blocked_content(options))
    }

    // ─── Subscriptions ──────────────────────────────────────────────────

    /// Subscribe to a remote site. A self-subscription is reported as a
    /// success with no id and writes nothing.
    pub async fn add_subscription(
        &self,
        to: SiteAddress,
        name: Option<String>,
        recursive: Option<bool>,
    ) -> ServiceResponse {
        match self.require_site() {
            Ok(site) => match site.add_subscription(to, name, recursive).await {
                Ok(Some(receipt)) => ServiceResponse::from_put(Ok(receipt)),
                Ok(None) => ServiceResponse::ok(),
                Err(e) => ServiceResponse::failure(&e),
            },
            Err(e) => ServiceResponse::failure(&e),
        }
    }

    pub async fn delete_subscription(&self, id: &str) -> ServiceResponse {
        match self.require_site() {
            Ok(site) => ServiceResponse::from_unit(site.delete_subscription(id).await, id),
            Err(e) => ServiceResponse::failure(&e),
        }
    }

    /// Remove the subscription pointing at a remote address, if present.
    pub async fn unsubscribe_from(&self, address: &SiteAddress) -> ServiceResponse {
        match self.require_site() {
            Ok(site) => match site.subscription_to(address) {
                Some(doc) => {
                    ServiceResponse::from_unit(site.delete_subscription(&doc.id).await, &doc.id)
                }
                None => ServiceResponse::failure(&FederationError::NotFound {
                    collection: "subscriptions".to_string(),
                    id: address.to_string(),
                }),
            },
            Err(e) => ServiceResponse::failure(&e),
        }
    }

    pub fn get_subscriptions(&self, options: &SearchOptions) -> FedResult<Vec<Subscription>> {
        Ok(self.require_site()?.get_subscriptions(options))
    }

    // ─── Membership ─────────────────────────────────────────────────────

    pub async fn add_member(&self, public_key: PublicKey) -> ServiceResponse {
        match self.require_site() {
            Ok(site) => ServiceResponse::from_put(site.add_member(public_key).await),
            Err(e) => ServiceResponse::failure(&e),
        }
    }

    pub async fn add_administrator(&self, public_key: PublicKey) -> ServiceResponse {
        match self.require_site() {
            Ok(site) => ServiceResponse::from_put(site.add_administrator(public_key).await),
            Err(e) => ServiceResponse::failure(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn operations_require_an_open_site() {
        let runtime = DocumentRuntime::new();
        let service = SiteService::init(runtime);

        let response = service.add_release(ReleaseDraft::default()).await;
        assert!(!response.success);
        assert!(response.error.is_some());
    }

    #[tokio::test]
    async fn open_reports_the_site_address() {
        let runtime = DocumentRuntime::new();
        let mut service = SiteService::init(runtime);

        let response = service
            .open_site(SiteTarget::New, OpenOptions::default())
            .await;
        assert!(response.success);
        assert_eq!(
            response.id.as_deref(),
            Some(service.get_site_address().unwrap().as_str())
        );
    }

    #[tokio::test]
    async fn opener_is_admin() {
        let runtime = DocumentRuntime::new();
        let mut service = SiteService::init(runtime);
        service
            .open_site(SiteTarget::New, OpenOptions::default())
            .await;

        assert_eq!(service.get_account_status().unwrap(), AccountStatus::Admin);
    }

    #[tokio::test]
    async fn double_open_is_rejected() {
        let runtime = DocumentRuntime::new();
        let mut service = SiteService::init(runtime);
        service
            .open_site(SiteTarget::New, OpenOptions::default())
            .await;

        let response = service
            .open_site(SiteTarget::New, OpenOptions::default())
            .await;
        assert!(!response.success);
    }
}
