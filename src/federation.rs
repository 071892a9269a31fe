/// The federation manager: turns a site's active subscriptions into a
/// live, bounded replication of remote records, and broadcasts local
/// mutations in the other direction.
///
/// Three flows per remote site:
///
/// - **Push**: change listeners on the four federated collections pack
///   each batch's log entries into a `FederationUpdate` and publish it on
///   this site's federation topic.
/// - **Pull-live**: a pubsub listener per subscription joins incoming
///   entries into the matching local log. Malformed payloads are
///   discarded silently; the access policy filters out entries whose
///   origin is not subscribed.
/// - **Pull-historical**: a deadline-bounded task per subscription opens
///   the remote site with minimal replication and periodically joins its
///   log heads, closing the gap pubsub delivery may leave.
///
/// Removing a subscription deletes every federated row of that origin,
/// aborts the backfill, and unsubscribes the topic. Errors never escape
/// `start()` or `stop()`.
use crate::config::{FederationConfig, SiteArgs};
use crate::error::{FedResult, FederationError};
use crate::query::Query;
use crate::runtime::log::LogEntry;
use crate::runtime::pubsub::PubSubMessage;
use crate::runtime::store::{ChangeBatch, Document, Store};
use crate::runtime::{
    DocumentRuntime, RemoteSite, BLOCKED_CONTENT, CONTENT_CATEGORIES, FEATURED_RELEASES, RELEASES,
};
use crate::schema::{document_site_address, Record, SiteAddress, Subscription};
use crate::site::Site;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

/// Largest accepted wire frame (16 MB).
const MAX_UPDATE_SIZE: usize = 16 * 1024 * 1024;

/// The four collections that travel over federation, by wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FederatedStore {
    #[serde(rename = "releases")]
    Releases,
    #[serde(rename = "featuredReleases")]
    FeaturedReleases,
    #[serde(rename = "contentCategories")]
    ContentCategories,
    #[serde(rename = "blockedContent")]
    BlockedContent,
}

impl FederatedStore {
    /// All four federated collections.
    pub const ALL: [FederatedStore; 4] = [
        FederatedStore::Releases,
        FederatedStore::FeaturedReleases,
        FederatedStore::ContentCategories,
        FederatedStore::BlockedContent,
    ];

    /// The local collection name.
    pub fn collection_name(self) -> &'static str {
        match self {
            FederatedStore::Releases => RELEASES,
            FederatedStore::FeaturedReleases => FEATURED_RELEASES,
            FederatedStore::ContentCategories => CONTENT_CATEGORIES,
            FederatedStore::BlockedContent => BLOCKED_CONTENT,
        }
    }
}

/// The federation wire record: a batch of log entries from one collection.
///
/// Entries travel raw so the receiver can join them byte-for-byte,
/// preserving signatures and causal links.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederationUpdate {
    /// Record tag for multiplexed decode.
    pub tag: String,
    /// Which collection was touched.
    pub store: FederatedStore,
    /// Entries behind added or updated documents.
    pub added: Vec<LogEntry>,
    /// Tombstone entries behind removed documents.
    pub removed: Vec<LogEntry>,
}

impl FederationUpdate {
    /// The wire tag.
    pub const TAG: &'static str = "federation_update";

    /// Build an update for one collection.
    pub fn new(store: FederatedStore, added: Vec<LogEntry>, removed: Vec<LogEntry>) -> Self {
        Self {
            tag: Self::TAG.to_string(),
            store,
            added,
            removed,
        }
    }

    /// Whether the update carries no entries.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }

    /// Serialize into a length-prefixed frame: 4-byte big-endian length
    /// followed by the JSON body.
    pub fn to_bytes(&self) -> FedResult<Vec<u8>> {
        let body = serde_json::to_vec(self)?;
        if body.len() > MAX_UPDATE_SIZE {
            return Err(FederationError::InvalidInput {
                reason: format!("update too large: {} bytes", body.len()),
            });
        }
        let mut frame = Vec::with_capacity(4 + body.len());
        frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a frame. Returns `None` for anything that is not a
    /// well-formed `FederationUpdate`; the topic may carry other
    /// payloads, and those are silently ignored.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < 4 {
            return None;
        }
        let declared = u32::from_be_bytes(bytes[..4].try_into().ok()?) as usize;
        if declared > MAX_UPDATE_SIZE || declared != bytes.len() - 4 {
            return None;
        }
        let update: FederationUpdate = serde_json::from_slice(&bytes[4..]).ok()?;
        if update.tag != Self::TAG {
            return None;
        }
        Some(update)
    }
}

/// State for one active federation with a remote site.
struct FederationHandle {
    topic: String,
    abort_tx: watch::Sender<bool>,
    sync_task: JoinHandle<()>,
    listener_task: JoinHandle<()>,
}

struct Inner {
    site: Arc<Site>,
    runtime: Arc<DocumentRuntime>,
    config: FederationConfig,
    active: DashMap<SiteAddress, FederationHandle>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
    running: AtomicBool,
}

/// Drives federation for one site.
pub struct FederationManager {
    inner: Arc<Inner>,
}

impl FederationManager {
    /// Create a manager for a site. Nothing runs until `start()`.
    pub fn new(site: Arc<Site>, config: FederationConfig) -> Self {
        let runtime = Arc::clone(site.runtime());
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                site,
                runtime,
                config,
                active: DashMap::new(),
                tasks: Mutex::new(Vec::new()),
                shutdown_tx,
                running: AtomicBool::new(false),
            }),
        }
    }

    /// Install listeners and begin federations for every pre-existing
    /// subscription. Idempotent; errors are logged, never raised.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = Vec::new();
        for fs in FederatedStore::ALL {
            let inner = Arc::clone(&self.inner);
            let shutdown_rx = self.inner.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(push_loop(inner, fs, shutdown_rx)));
        }

        {
            let inner = Arc::clone(&self.inner);
            let shutdown_rx = self.inner.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(subscription_watch_loop(inner, shutdown_rx)));
        }
        self.inner.tasks.lock().await.extend(tasks);

        // Federate every subscription that predates start().
        let existing = self
            .inner
            .site
            .subscriptions()
            .search(&Default::default());
        for doc in existing {
            if let Ok(subscription) = Subscription::from_value(&doc.value) {
                federate_with(&self.inner, subscription.to).await;
            }
        }

        tracing::info!(site = %self.inner.site.address(), "federation manager started");
    }

    /// Tear everything down. Safe to call concurrently with in-flight
    /// syncs; completes even if individual handles fail.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = self.inner.shutdown_tx.send(());

        let remotes: Vec<SiteAddress> = self
            .inner
            .active
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        let mut handle_tasks = Vec::new();
        for remote in remotes {
            if let Some((_, handle)) = self.inner.active.remove(&remote) {
                let _ = handle.abort_tx.send(true);
                handle_tasks.push(handle.sync_task);
                handle_tasks.push(handle.listener_task);
            }
        }

        let mut tasks = self.inner.tasks.lock().await;
        for result in futures::future::join_all(tasks.drain(..).chain(handle_tasks)).await {
            if let Err(e) = result {
                tracing::debug!(error = %e, "federation task ended abnormally");
            }
        }

        tracing::info!(site = %self.inner.site.address(), "federation manager stopped");
    }

    /// Whether a federation with this remote is active.
    pub fn is_federating_with(&self, remote: &SiteAddress) -> bool {
        self.inner.active.contains_key(remote)
    }

    /// Number of active federations.
    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }
}

fn federated_store(site: &Site, fs: FederatedStore) -> &Arc<Store> {
    match fs {
        FederatedStore::Releases => site.releases(),
        FederatedStore::FeaturedReleases => site.featured_releases(),
        FederatedStore::ContentCategories => site.content_categories(),
        FederatedStore::BlockedContent => site.blocked_content(),
    }
}

/// Begin federating with a remote site: subscribe to its topic and spawn
/// the historical backfill. At most one federation per remote address.
async fn federate_with(inner: &Arc<Inner>, remote: SiteAddress) {
    if &remote == inner.site.address() {
        return;
    }
    if inner.active.contains_key(&remote) {
        return;
    }

    let topic = format!("{}/federation", remote);
    let messages = inner.runtime.pubsub().subscribe(&topic);
    let (abort_tx, abort_rx) = watch::channel(false);

    let listener_task = tokio::spawn(listen_loop(
        Arc::clone(inner),
        topic.clone(),
        messages,
        abort_rx.clone(),
        inner.shutdown_tx.subscribe(),
    ));
    let sync_task = tokio::spawn(historical_sync(
        Arc::clone(inner),
        remote.clone(),
        abort_rx,
    ));

    let handle = FederationHandle {
        topic,
        abort_tx,
        sync_task,
        listener_task,
    };

    match inner.active.entry(remote.clone()) {
        Entry::Occupied(_) => {
            // Lost the race; retract the duplicate.
            let _ = handle.abort_tx.send(true);
        }
        Entry::Vacant(slot) => {
            slot.insert(handle);
            tracing::info!(site = %inner.site.address(), remote = %remote, "federation started");
        }
    }
}

/// Stop federating with a remote site and clean up its rows.
async fn unfederate(inner: &Arc<Inner>, remote: SiteAddress) {
    let Some((_, handle)) = inner.active.remove(&remote) else {
        return;
    };

    // Delete every federated row of this origin, collection by collection,
    // in id batches. Failures are logged; the handle is dropped either
    // way so a retry can start clean.
    for fs in FederatedStore::ALL {
        let store = federated_store(&inner.site, fs);
        let mut cursor = store.iterate(
            Some(Query::field_eq("site_address", remote.as_str())),
            inner.config.iterate_batch_size,
        );
        while !cursor.done() {
            let ids: Vec<String> = cursor.next_batch().iter().map(|d| d.id.clone()).collect();
            let identity = inner.site.identity();
            let deletes = ids.iter().map(|id| store.del_document(id, identity));
            for result in futures::future::join_all(deletes).await {
                if let Err(e) = result {
                    tracing::warn!(
                        remote = %remote,
                        collection = store.name(),
                        error = %e,
                        "cleanup delete failed"
                    );
                }
            }
        }
    }

    let _ = handle.abort_tx.send(true);
    tracing::info!(site = %inner.site.address(), remote = %remote, topic = %handle.topic, "federation stopped");
}

/// Watch the subscriptions collection and start/stop federations.
async fn subscription_watch_loop(inner: Arc<Inner>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut changes = inner.site.subscriptions().subscribe_changes();
    loop {
        tokio::select! {
            batch = changes.recv() => match batch {
                Ok(batch) => {
                    for doc in &batch.added {
                        if let Ok(subscription) = Subscription::from_value(&doc.value) {
                            federate_with(&inner, subscription.to).await;
                        }
                    }
                    for doc in &batch.removed {
                        if let Ok(subscription) = Subscription::from_value(&doc.value) {
                            unfederate(&inner, subscription.to).await;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "subscription watcher lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown_rx.recv() => break,
        }
    }
}

/// Broadcast local mutations of one federated collection.
async fn push_loop(
    inner: Arc<Inner>,
    fs: FederatedStore,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let store = Arc::clone(federated_store(&inner.site, fs));
    let mut changes = store.subscribe_changes();
    let topic = inner.site.federation_topic();

    loop {
        tokio::select! {
            batch = changes.recv() => match batch {
                Ok(batch) => broadcast_batch(&inner, fs, &store, &topic, batch),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(collection = store.name(), skipped, "push listener lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = shutdown_rx.recv() => break,
        }
    }
}

/// Pack a change batch into a wire update and publish it.
///
/// Only rows originated by this site are broadcast: federated rows are
/// never re-emitted as our own, which keeps federation single-hop.
fn broadcast_batch(
    inner: &Inner,
    fs: FederatedStore,
    store: &Store,
    topic: &str,
    batch: ChangeBatch,
) {
    let own = |doc: &Document| {
        document_site_address(&doc.value).as_ref() == Some(inner.site.address())
    };
    let entries = |docs: &[Document]| -> Vec<LogEntry> {
        docs.iter()
            .filter(|doc| own(doc))
            .filter_map(|doc| store.log_entry(&doc.head))
            .collect()
    };

    let added = entries(&batch.added);
    // Tombstones for removed rows: the row body names the origin, the
    // head points at the delete entry.
    let removed = entries(&batch.removed);

    let update = FederationUpdate::new(fs, added, removed);
    if update.is_empty() {
        return;
    }

    match update.to_bytes() {
        Ok(frame) => {
            inner
                .runtime
                .pubsub()
                .publish(frame, &[topic.to_string()]);
        }
        Err(e) => {
            tracing::warn!(collection = store.name(), error = %e, "failed to encode update");
        }
    }
}

/// Ingest pubsub traffic from one remote federation topic.
async fn listen_loop(
    inner: Arc<Inner>,
    topic: String,
    mut messages: broadcast::Receiver<PubSubMessage>,
    mut abort_rx: watch::Receiver<bool>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            message = messages.recv() => match message {
                Ok(message) => {
                    if !message.topics.iter().any(|t| t == &topic) {
                        continue;
                    }
                    let Some(update) = FederationUpdate::from_bytes(&message.data) else {
                        // Not a FederationUpdate; the topic may carry
                        // other payloads.
                        continue;
                    };
                    ingest_update(&inner, update).await;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(topic = %topic, skipped, "live listener lagged; historical sync will repair");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            _ = abort_rx.changed() => break,
            _ = shutdown_rx.recv() => break,
        }
    }
    drop(messages);
    inner.runtime.pubsub().unsubscribe(&topic);
}

/// Join a live update's entries into the matching local collection.
async fn ingest_update(inner: &Inner, update: FederationUpdate) {
    let store = federated_store(&inner.site, update.store);
    let mut entries = update.added;
    entries.extend(update.removed);
    if let Err(e) = store.join(entries).await {
        tracing::warn!(collection = store.name(), error = %e, "failed to join live update");
    }
}

/// Deadline-bounded historical backfill for one subscription.
async fn historical_sync(inner: Arc<Inner>, remote: SiteAddress, mut abort_rx: watch::Receiver<bool>) {
    let deadline = inner.config.sync_deadline;
    match tokio::time::timeout(deadline, sync_with_remote(&inner, &remote, &mut abort_rx)).await {
        Ok(Ok(())) => {}
        Ok(Err(FederationError::Aborted)) => {}
        Ok(Err(e)) => {
            tracing::warn!(remote = %remote, error = %e, "historical sync failed");
        }
        Err(_) => {
            tracing::debug!(remote = %remote, "historical sync reached its deadline");
        }
    }
}

async fn sync_with_remote(
    inner: &Inner,
    remote: &SiteAddress,
    abort_rx: &mut watch::Receiver<bool>,
) -> FedResult<()> {
    let replica = tokio::select! {
        opened = inner.runtime.open_remote(
            remote,
            SiteArgs::remote_minimal(),
            inner.config.remote_open_deadline,
        ) => opened?,
        _ = abort_rx.changed() => return Err(FederationError::Aborted),
    };

    let outcome = head_join_loop(inner, &replica, abort_rx).await;
    replica.close();
    outcome
}

/// Periodically snapshot the remote heads and join them locally.
///
/// Join is commutative and idempotent, so overlap with pull-live is safe.
async fn head_join_loop(
    inner: &Inner,
    replica: &RemoteSite,
    abort_rx: &mut watch::Receiver<bool>,
) -> FedResult<()> {
    loop {
        let joins = FederatedStore::ALL.map(|fs| join_remote_heads(inner, replica, fs));
        for result in futures::future::join_all(joins).await {
            if let Err(e) = result {
                tracing::debug!(remote = %replica.address(), error = %e, "head join failed");
            }
        }

        tokio::select! {
            _ = abort_rx.changed() => return Err(FederationError::Aborted),
            _ = tokio::time::sleep(inner.config.poll_interval) => {}
        }
    }
}

async fn join_remote_heads(
    inner: &Inner,
    replica: &RemoteSite,
    fs: FederatedStore,
) -> FedResult<()> {
    let remote_store = replica.store(fs.collection_name())?;
    let heads = remote_store.heads(true).await;
    if heads.is_empty() {
        return Ok(());
    }
    let local = federated_store(&inner.site, fs);
    local.join(heads).await?;
    Ok(())
}
