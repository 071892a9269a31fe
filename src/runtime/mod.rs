/// The document runtime: hosted site state, remote opens, and the pubsub
/// bus.
///
/// The runtime is the process-wide hub that site programs register with.
/// Opening a remote site yields a replica handle with read access to the
/// collections the open parameters replicate; the handle is owned by the
/// opening task and must be closed by it. Unknown addresses behave like
/// unreachable peers: the open blocks until its deadline and times out.
pub mod log;
pub mod pubsub;
pub mod store;

use crate::config::{CollectionArgs, Replication, SiteArgs};
use crate::error::{FedResult, FederationError};
use crate::schema::{SiteAddress, SiteMetadata};
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use pubsub::PubSub;
use store::Store;

/// Collection names of a site program.
pub const RELEASES: &str = "releases";
pub const FEATURED_RELEASES: &str = "featured_releases";
pub const CONTENT_CATEGORIES: &str = "content_categories";
pub const BLOCKED_CONTENT: &str = "blocked_content";
pub const SUBSCRIPTIONS: &str = "subscriptions";
pub const MEMBERS: &str = "members";
pub const ADMINISTRATORS: &str = "administrators";

/// The four collections that federate.
pub const FEDERATED_COLLECTIONS: [&str; 4] = [
    RELEASES,
    FEATURED_RELEASES,
    CONTENT_CATEGORIES,
    BLOCKED_CONTENT,
];

/// How often a pending remote open re-checks the registry.
const REMOTE_OPEN_PROBE_INTERVAL: Duration = Duration::from_millis(50);

/// The replicated state a site program registers with the runtime.
pub struct SiteState {
    address: SiteAddress,
    stores: HashMap<String, Arc<Store>>,
    metadata: RwLock<SiteMetadata>,
    open_replicas: AtomicUsize,
}

impl SiteState {
    /// Bundle a site's opened collections.
    pub fn new(address: SiteAddress, stores: HashMap<String, Arc<Store>>) -> Arc<Self> {
        Arc::new(Self {
            address,
            stores,
            metadata: RwLock::new(SiteMetadata::default()),
            open_replicas: AtomicUsize::new(0),
        })
    }

    /// The site's address.
    pub fn address(&self) -> &SiteAddress {
        &self.address
    }

    /// Look up a collection by name.
    pub fn store(&self, name: &str) -> Option<&Arc<Store>> {
        self.stores.get(name)
    }

    /// Read the site-level metadata.
    pub async fn metadata(&self) -> SiteMetadata {
        self.metadata.read().await.clone()
    }

    /// Replace the site-level metadata.
    pub async fn set_metadata(&self, metadata: SiteMetadata) {
        *self.metadata.write().await = metadata;
    }

    /// Number of remote replica handles currently open against this site.
    pub fn replica_count(&self) -> usize {
        self.open_replicas.load(Ordering::SeqCst)
    }
}

/// The process-wide document runtime.
pub struct DocumentRuntime {
    pubsub: Arc<PubSub>,
    sites: DashMap<SiteAddress, Arc<SiteState>>,
}

impl DocumentRuntime {
    /// Create a runtime hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pubsub: Arc::new(PubSub::new()),
            sites: DashMap::new(),
        })
    }

    /// The shared pubsub bus.
    pub fn pubsub(&self) -> &Arc<PubSub> {
        &self.pubsub
    }

    /// Register a site program's state, making it reachable by address.
    pub fn register_site(&self, state: Arc<SiteState>) {
        self.sites.insert(state.address().clone(), state);
    }

    /// Remove a site from the registry. Pending and future remote opens
    /// against its address will time out.
    pub fn unregister_site(&self, address: &SiteAddress) {
        self.sites.remove(address);
    }

    /// Fetch a hosted site's state.
    pub fn site(&self, address: &SiteAddress) -> Option<Arc<SiteState>> {
        self.sites.get(address).map(|s| Arc::clone(&s))
    }

    /// Check a peer address is reachable.
    pub fn dial(&self, address: &SiteAddress) -> FedResult<()> {
        if self.sites.contains_key(address) {
            Ok(())
        } else {
            Err(FederationError::Network(format!(
                "failed to dial {}",
                address
            )))
        }
    }

    /// Open a remote site with the given replication parameters.
    ///
    /// Blocks until the address is reachable or the deadline elapses. The
    /// returned handle exposes only the collections the parameters
    /// replicate, and must be closed by the task that opened it.
    pub async fn open_remote(
        &self,
        address: &SiteAddress,
        args: SiteArgs,
        deadline: Duration,
    ) -> FedResult<RemoteSite> {
        let wait_for_site = async {
            loop {
                if let Some(state) = self.site(address) {
                    return state;
                }
                tokio::time::sleep(REMOTE_OPEN_PROBE_INTERVAL).await;
            }
        };

        let state = tokio::time::timeout(deadline, wait_for_site)
            .await
            .map_err(|_| {
                FederationError::Timeout(format!("opening remote site {}", address))
            })?;

        state.open_replicas.fetch_add(1, Ordering::SeqCst);
        Ok(RemoteSite {
            state,
            args,
            closed: false,
        })
    }
}

/// A handle on a remote site opened for replication.
pub struct RemoteSite {
    state: Arc<SiteState>,
    args: SiteArgs,
    closed: bool,
}

impl std::fmt::Debug for RemoteSite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSite")
            .field("address", self.state.address())
            .field("closed", &self.closed)
            .finish()
    }
}

impl RemoteSite {
    /// The remote site's address.
    pub fn address(&self) -> &SiteAddress {
        self.state.address()
    }

    /// Access a remote collection.
    ///
    /// Collections the open parameters did not replicate are unavailable.
    pub fn store(&self, name: &str) -> FedResult<Arc<Store>> {
        let replicated = args_for_collection(&self.args, name)
            .map(|args| args.replicate != Replication::Disabled)
            .unwrap_or(false);
        if !replicated {
            return Err(FederationError::Runtime(format!(
                "collection '{}' not replicated on this handle",
                name
            )));
        }
        self.state
            .store(name)
            .map(Arc::clone)
            .ok_or_else(|| FederationError::Runtime(format!("no collection '{}'", name)))
    }

    /// Read the remote site's metadata.
    pub async fn metadata(&self) -> SiteMetadata {
        self.state.metadata().await
    }

    /// Close the handle, releasing the replica slot.
    pub fn close(mut self) {
        self.closed = true;
        self.state.open_replicas.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Drop for RemoteSite {
    fn drop(&mut self) {
        if !self.closed {
            self.state.open_replicas.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Map a collection name to its open parameters.
pub fn args_for_collection<'a>(args: &'a SiteArgs, name: &str) -> Option<&'a CollectionArgs> {
    match name {
        RELEASES => Some(&args.releases_args),
        FEATURED_RELEASES => Some(&args.featured_releases_args),
        CONTENT_CATEGORIES => Some(&args.content_categories_args),
        BLOCKED_CONTENT => Some(&args.blocked_content_args),
        SUBSCRIPTIONS => Some(&args.subscriptions_args),
        MEMBERS => Some(&args.members_args),
        ADMINISTRATORS => Some(&args.administrators_args),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_state(address: &str) -> Arc<SiteState> {
        SiteState::new(SiteAddress::new(address), HashMap::new())
    }

    #[tokio::test]
    async fn dial_known_and_unknown() {
        let runtime = DocumentRuntime::new();
        runtime.register_site(empty_state("site-a"));

        assert!(runtime.dial(&SiteAddress::new("site-a")).is_ok());
        assert!(runtime.dial(&SiteAddress::new("site-x")).is_err());
    }

    #[tokio::test]
    async fn open_remote_times_out_for_unknown_address() {
        let runtime = DocumentRuntime::new();
        let err = runtime
            .open_remote(
                &SiteAddress::new("nowhere"),
                SiteArgs::remote_minimal(),
                Duration::from_millis(120),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::Timeout(_)));
    }

    #[tokio::test]
    async fn replica_counting_tracks_open_and_close() {
        let runtime = DocumentRuntime::new();
        let state = empty_state("site-a");
        runtime.register_site(Arc::clone(&state));

        let address = SiteAddress::new("site-a");
        let replica = runtime
            .open_remote(
                &address,
                SiteArgs::remote_minimal(),
                Duration::from_millis(200),
            )
            .await
            .unwrap();
        assert_eq!(state.replica_count(), 1);

        replica.close();
        assert_eq!(state.replica_count(), 0);
    }

    #[tokio::test]
    async fn dropped_replica_releases_its_slot() {
        let runtime = DocumentRuntime::new();
        let state = empty_state("site-a");
        runtime.register_site(Arc::clone(&state));

        let address = SiteAddress::new("site-a");
        {
            let _replica = runtime
                .open_remote(
                    &address,
                    SiteArgs::remote_minimal(),
                    Duration::from_millis(200),
                )
                .await
                .unwrap();
            assert_eq!(state.replica_count(), 1);
        }
        assert_eq!(state.replica_count(), 0);
    }

    #[tokio::test]
    async fn metadata_round_trip() {
        let state = empty_state("site-a");
        let metadata = SiteMetadata {
            name: "Test Site".to_string(),
            description: Some("a test".to_string()),
            image_cid: None,
        };
        state.set_metadata(metadata.clone()).await;
        assert_eq!(state.metadata().await, metadata);
    }
}
