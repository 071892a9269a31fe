/// Per-collection document store.
///
/// A store pairs a signed append-only log with a derived current-state
/// index. Local mutations append entries; federated entries arrive through
/// `join`, which is idempotent by entry hash, verifies signatures, and
/// consults the installed access policy before applying anything. Index
/// effects fan out to observers as change batches, delivered in the order
/// entries were appended locally.
///
/// Conflict resolution is last-writer-wins per key, ordered by entry
/// timestamp with the entry hash as a tiebreak. An entry that loses LWW is
/// still appended to the log (history is preserved) but produces no index
/// change and no event.
use crate::config::CollectionArgs;
use crate::error::{FedResult, FederationError};
use crate::identity::{Identity, PublicKey};
use crate::query::{Query, SearchOptions};
use crate::runtime::log::{EntryHash, EntryPayload, LogEntry};
use crate::schema::{now_ms, SiteAddress};
use dashmap::DashMap;
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Channel capacity for change broadcasts.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

/// The kind of candidate write being classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    Put,
    Del,
}

/// A candidate write presented to an access policy.
pub struct WriteOp<'a> {
    /// Put or delete.
    pub kind: WriteKind,
    /// The document key being written.
    pub key: &'a str,
    /// The incoming document body (puts only).
    pub document: Option<&'a JsonValue>,
    /// The current row under this key, if any.
    pub existing: Option<&'a JsonValue>,
    /// The key that signed the log entry.
    pub signer: &'a PublicKey,
}

/// Classifies candidate writes for a collection.
///
/// Policies are pure and synchronous: they read index snapshots and return
/// a verdict, never suspending.
pub trait AccessPolicy: Send + Sync {
    fn can_apply(&self, op: &WriteOp<'_>) -> bool;
}

/// A policy that admits everything. Used for site-private collections that
/// never receive federated writes and are guarded at the API layer.
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn can_apply(&self, _op: &WriteOp<'_>) -> bool {
        true
    }
}

/// A document in the current-state index.
#[derive(Debug, Clone)]
pub struct Document {
    /// The document id.
    pub id: String,
    /// The document body.
    pub value: JsonValue,
    /// Hash of the log entry that produced this state (the head).
    pub head: EntryHash,
    /// Timestamp of that entry, ms epoch.
    pub timestamp_ms: u64,
}

/// A batch of index changes, emitted to observers.
#[derive(Debug, Clone, Default)]
pub struct ChangeBatch {
    /// Documents inserted or updated.
    pub added: Vec<Document>,
    /// Documents removed. Each carries the tombstone entry as its head.
    pub removed: Vec<Document>,
}

impl ChangeBatch {
    /// Whether the batch carries no changes.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Receipt for a successful put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutReceipt {
    /// The document id.
    pub id: String,
    /// Hash of the appended log entry.
    pub hash: String,
}

/// Receipt for a successful delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelReceipt {
    /// The document id.
    pub id: String,
}

/// Where an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ApplySource {
    /// Appended by the local site program. Denials are errors.
    Local,
    /// Joined from a federated log. Denials and bad signatures are skipped.
    Federated,
}

/// LWW winner bookkeeping per key.
struct KeyState {
    timestamp_ms: u64,
    hash: EntryHash,
}

/// Append-order log state, guarded by one lock so appends serialize.
struct LogInner {
    order: Vec<EntryHash>,
    heads: HashSet<EntryHash>,
}

enum IndexEffect {
    Added(Document),
    Removed(Document),
}

/// One replicated collection: signed log + derived index + change stream.
pub struct Store {
    name: String,
    site: SiteAddress,
    args: CollectionArgs,
    policy: Arc<dyn AccessPolicy>,
    entries: DashMap<EntryHash, LogEntry>,
    log: Mutex<LogInner>,
    index: DashMap<String, Document>,
    key_state: DashMap<String, KeyState>,
    change_tx: broadcast::Sender<ChangeBatch>,
    closed: AtomicBool,
}

impl Store {
    /// Open a collection with its policy installed.
    pub fn open(
        name: impl Into<String>,
        site: SiteAddress,
        policy: Arc<dyn AccessPolicy>,
        args: CollectionArgs,
    ) -> Arc<Self> {
        let (change_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Arc::new(Self {
            name: name.into(),
            site,
            args,
            policy,
            entries: DashMap::new(),
            log: Mutex::new(LogInner {
                order: Vec::new(),
                heads: HashSet::new(),
            }),
            index: DashMap::new(),
            key_state: DashMap::new(),
            change_tx,
            closed: AtomicBool::new(false),
        })
    }

    /// The collection name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning site's address.
    pub fn site(&self) -> &SiteAddress {
        &self.site
    }

    /// The open parameters this collection was opened with.
    pub fn args(&self) -> &CollectionArgs {
        &self.args
    }

    /// Close the collection. Further operations fail; observers see the
    /// change stream end when the store is dropped.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Timestamp for a new local entry on a key.
    ///
    /// Wall-clock ms, bumped past the key's current winner so successive
    /// local writes to one key within the same millisecond still order.
    fn next_timestamp(&self, key: &str) -> u64 {
        let now = now_ms();
        match self.key_state.get(key) {
            Some(state) => now.max(state.timestamp_ms + 1),
            None => now,
        }
    }

    fn ensure_open(&self) -> FedResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(FederationError::Runtime(format!(
                "collection '{}' is closed",
                self.name
            )));
        }
        Ok(())
    }

    /// Append a put signed by the given identity.
    pub async fn put_document(
        &self,
        id: impl Into<String>,
        value: JsonValue,
        identity: &Identity,
    ) -> FedResult<PutReceipt> {
        self.ensure_open()?;
        let id = id.into();
        let mut inner = self.log.lock().await;

        let parents: Vec<EntryHash> = inner.heads.iter().cloned().collect();
        let entry = LogEntry::create(
            parents,
            EntryPayload::Put {
                key: id.clone(),
                document: value,
            },
            identity,
            self.next_timestamp(&id),
        )?;
        let hash = entry.hash.clone();

        let (_, effect) = self.apply_one(&mut inner, entry, ApplySource::Local)?;
        self.emit(effects_to_batch(effect));

        Ok(PutReceipt {
            id,
            hash: hash.to_string(),
        })
    }

    /// Append a delete signed by the given identity.
    ///
    /// Deleting an id with no current row is a not-found error.
    pub async fn del_document(&self, id: &str, identity: &Identity) -> FedResult<DelReceipt> {
        self.ensure_open()?;
        let mut inner = self.log.lock().await;

        if !self.index.contains_key(id) {
            return Err(FederationError::NotFound {
                collection: self.name.clone(),
                id: id.to_string(),
            });
        }

        let parents: Vec<EntryHash> = inner.heads.iter().cloned().collect();
        let entry = LogEntry::create(
            parents,
            EntryPayload::Del {
                key: id.to_string(),
            },
            identity,
            self.next_timestamp(id),
        )?;

        let (_, effect) = self.apply_one(&mut inner, entry, ApplySource::Local)?;
        self.emit(effects_to_batch(effect));

        Ok(DelReceipt { id: id.to_string() })
    }

    /// Join federated entries into this log.
    ///
    /// Idempotent by entry hash: entries already present are skipped with
    /// no index change and no event. Entries that fail signature
    /// verification or are rejected by the access policy are skipped
    /// silently (logged at debug). Returns the number of entries appended.
    pub async fn join(&self, entries: Vec<LogEntry>) -> FedResult<usize> {
        self.ensure_open()?;
        let mut inner = self.log.lock().await;

        let mut batch = ChangeBatch::default();
        let mut appended = 0;
        for entry in entries {
            match self.apply_one(&mut inner, entry, ApplySource::Federated) {
                Ok((was_appended, effect)) => {
                    if was_appended {
                        appended += 1;
                    }
                    match effect {
                        Some(IndexEffect::Added(doc)) => batch.added.push(doc),
                        Some(IndexEffect::Removed(doc)) => batch.removed.push(doc),
                        None => {}
                    }
                }
                Err(e) => {
                    tracing::debug!(collection = %self.name, error = %e, "skipped federated entry");
                }
            }
        }

        self.emit(batch);
        Ok(appended)
    }

    /// Apply one entry under the log lock.
    ///
    /// Returns whether the entry was appended, and its index effect if any.
    fn apply_one(
        &self,
        inner: &mut LogInner,
        entry: LogEntry,
        source: ApplySource,
    ) -> FedResult<(bool, Option<IndexEffect>)> {
        if self.entries.contains_key(&entry.hash) {
            return Ok((false, None));
        }

        if source == ApplySource::Federated {
            if let Err(e) = entry.verify() {
                tracing::warn!(collection = %self.name, error = %e, "rejected unverifiable entry");
                return Ok((false, None));
            }
        }

        let key = entry.payload.key().to_string();
        let existing = self.index.get(&key).map(|doc| doc.value.clone());
        let op = WriteOp {
            kind: if entry.payload.is_delete() {
                WriteKind::Del
            } else {
                WriteKind::Put
            },
            key: &key,
            document: entry.payload.document(),
            existing: existing.as_ref(),
            signer: &entry.signer,
        };

        if !self.policy.can_apply(&op) {
            return match source {
                ApplySource::Local => Err(FederationError::AccessDenied),
                ApplySource::Federated => {
                    tracing::debug!(
                        collection = %self.name,
                        key = %key,
                        signer = %entry.signer,
                        "access policy rejected federated entry"
                    );
                    Ok((false, None))
                }
            };
        }

        // Append to the log and advance the heads.
        for parent in &entry.parents {
            inner.heads.remove(parent);
        }
        inner.heads.insert(entry.hash.clone());
        inner.order.push(entry.hash.clone());
        self.entries.insert(entry.hash.clone(), entry.clone());

        // LWW index effect.
        let wins = match self.key_state.get(&key) {
            Some(state) => entry.lww_key() > (state.timestamp_ms, state.hash.as_str()),
            None => true,
        };
        if !wins {
            return Ok((true, None));
        }
        self.key_state.insert(
            key.clone(),
            KeyState {
                timestamp_ms: entry.timestamp_ms,
                hash: entry.hash.clone(),
            },
        );

        let effect = match &entry.payload {
            EntryPayload::Put { document, .. } => {
                let doc = Document {
                    id: key.clone(),
                    value: document.clone(),
                    head: entry.hash.clone(),
                    timestamp_ms: entry.timestamp_ms,
                };
                self.index.insert(key, doc.clone());
                Some(IndexEffect::Added(doc))
            }
            EntryPayload::Del { .. } => self.index.remove(&key).map(|(_, previous)| {
                IndexEffect::Removed(Document {
                    head: entry.hash.clone(),
                    timestamp_ms: entry.timestamp_ms,
                    ..previous
                })
            }),
        };

        Ok((true, effect))
    }

    fn emit(&self, batch: ChangeBatch) {
        if !batch.is_empty() {
            // No observers is fine.
            let _ = self.change_tx.send(batch);
        }
    }

    /// Subscribe to index change batches.
    pub fn subscribe_changes(&self) -> broadcast::Receiver<ChangeBatch> {
        self.change_tx.subscribe()
    }

    /// Fetch a log entry by hash.
    pub fn log_entry(&self, hash: &EntryHash) -> Option<LogEntry> {
        self.entries.get(hash).map(|e| e.clone())
    }

    /// Entries behind the log heads.
    ///
    /// `deep` walks the heads' full ancestry. In this in-memory runtime
    /// that is every entry in local append order, and it is what
    /// historical sync joins: `join` applies exactly the entries handed
    /// to it and never fetches ancestors itself.
    pub async fn heads(&self, deep: bool) -> Vec<LogEntry> {
        let inner = self.log.lock().await;
        let hashes: Vec<&EntryHash> = if deep {
            inner.order.iter().collect()
        } else {
            inner.heads.iter().collect()
        };
        hashes
            .into_iter()
            .filter_map(|hash| self.entries.get(hash).map(|e| e.clone()))
            .collect()
    }

    /// Number of entries in the log.
    pub async fn log_len(&self) -> usize {
        self.log.lock().await.order.len()
    }

    /// Get a document by id.
    pub fn index_get(&self, id: &str) -> Option<Document> {
        self.index.get(id).map(|doc| doc.clone())
    }

    /// Number of documents currently indexed.
    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    /// Whether any indexed document satisfies the predicate.
    ///
    /// Synchronous, for use inside access policies.
    pub fn index_any(&self, predicate: impl Fn(&JsonValue) -> bool) -> bool {
        self.index.iter().any(|doc| predicate(&doc.value))
    }

    /// Search the index.
    pub fn search(&self, options: &SearchOptions) -> Vec<Document> {
        let mut results: Vec<Document> = self
            .index
            .iter()
            .filter(|doc| {
                options
                    .query
                    .as_ref()
                    .map(|q| q.matches_value(&doc.value))
                    .unwrap_or(true)
            })
            .map(|doc| doc.clone())
            .collect();

        if !options.sort.is_empty() {
            results.sort_by(|a, b| options.compare_documents(&a.value, &b.value));
        }
        if let Some(fetch) = options.fetch {
            results.truncate(fetch);
        }
        results
    }

    /// Iterate the index in batches over a snapshot.
    pub fn iterate(&self, query: Option<Query>, batch_size: usize) -> IndexCursor {
        let options = SearchOptions {
            query,
            sort: Vec::new(),
            fetch: None,
        };
        IndexCursor {
            items: self.search(&options),
            pos: 0,
            batch_size: batch_size.max(1),
        }
    }
}

/// A batched cursor over an index snapshot.
pub struct IndexCursor {
    items: Vec<Document>,
    pos: usize,
    batch_size: usize,
}

impl IndexCursor {
    /// The next batch of documents; empty once exhausted.
    pub fn next_batch(&mut self) -> &[Document] {
        let start = self.pos;
        let end = (start + self.batch_size).min(self.items.len());
        self.pos = end;
        &self.items[start..end]
    }

    /// Whether the cursor is exhausted.
    pub fn done(&self) -> bool {
        self.pos >= self.items.len()
    }
}

fn effects_to_batch(effect: Option<IndexEffect>) -> ChangeBatch {
    let mut batch = ChangeBatch::default();
    match effect {
        Some(IndexEffect::Added(doc)) => batch.added.push(doc),
        Some(IndexEffect::Removed(doc)) => batch.removed.push(doc),
        None => {}
    }
    batch
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_store() -> (Arc<Store>, Identity) {
        let store = Store::open(
            "releases",
            SiteAddress::new("site-test"),
            Arc::new(AllowAll),
            CollectionArgs::replicated(),
        );
        (store, Identity::generate())
    }

    #[tokio::test]
    async fn put_then_get() {
        let (store, identity) = open_store();
        let receipt = store
            .put_document("doc-1", json!({"name": "First"}), &identity)
            .await
            .unwrap();
        assert_eq!(receipt.id, "doc-1");

        let doc = store.index_get("doc-1").unwrap();
        assert_eq!(doc.value, json!({"name": "First"}));
        assert_eq!(doc.head.to_string(), receipt.hash);
    }

    #[tokio::test]
    async fn delete_removes_from_index_but_keeps_log() {
        let (store, identity) = open_store();
        store
            .put_document("doc-1", json!({"name": "First"}), &identity)
            .await
            .unwrap();
        store.del_document("doc-1", &identity).await.unwrap();

        assert!(store.index_get("doc-1").is_none());
        assert_eq!(store.index_len(), 0);
        assert_eq!(store.log_len().await, 2);
    }

    #[tokio::test]
    async fn delete_of_missing_id_is_not_found() {
        let (store, identity) = open_store();
        let err = store.del_document("ghost", &identity).await.unwrap_err();
        assert!(matches!(err, FederationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let (source, src_id) = open_store();
        let (target, _target_id) = open_store();

        source
            .put_document("doc-1", json!({"name": "First"}), &src_id)
            .await
            .unwrap();
        let entries = source.heads(true).await;

        let mut rx = target.subscribe_changes();
        assert_eq!(target.join(entries.clone()).await.unwrap(), 1);
        assert_eq!(target.index_len(), 1);

        // Second join applies nothing and emits nothing.
        assert_eq!(target.join(entries).await.unwrap(), 0);
        assert_eq!(target.index_len(), 1);
        assert_eq!(target.log_len().await, 1);

        let first = rx.try_recv().unwrap();
        assert_eq!(first.added.len(), 1);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn join_rejects_tampered_entries() {
        let (source, src_id) = open_store();
        let (target, _target_id) = open_store();

        source
            .put_document("doc-1", json!({"name": "First"}), &src_id)
            .await
            .unwrap();
        let mut entries = source.heads(true).await;
        if let EntryPayload::Put { document, .. } = &mut entries[0].payload {
            *document = json!({"name": "Forged"});
        }

        assert_eq!(target.join(entries).await.unwrap(), 0);
        assert_eq!(target.index_len(), 0);
    }

    #[tokio::test]
    async fn last_writer_wins_across_joins() {
        let (a, a_id) = open_store();
        let (b, b_id) = open_store();

        a.put_document("doc-1", json!({"v": 1}), &a_id).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        b.put_document("doc-1", json!({"v": 2}), &b_id).await.unwrap();

        // Apply in both orders; both converge on the later write.
        let from_a = a.heads(true).await;
        let from_b = b.heads(true).await;

        b.join(from_a.clone()).await.unwrap();
        assert_eq!(b.index_get("doc-1").unwrap().value, json!({"v": 2}));

        a.join(from_b).await.unwrap();
        assert_eq!(a.index_get("doc-1").unwrap().value, json!({"v": 2}));
    }

    #[tokio::test]
    async fn change_events_arrive_in_append_order() {
        let (store, identity) = open_store();
        let mut rx = store.subscribe_changes();

        for i in 0..3 {
            store
                .put_document(format!("doc-{}", i), json!({"i": i}), &identity)
                .await
                .unwrap();
        }

        for i in 0..3 {
            let batch = rx.recv().await.unwrap();
            assert_eq!(batch.added[0].id, format!("doc-{}", i));
        }
    }

    #[tokio::test]
    async fn shallow_heads_track_the_log_frontier() {
        let (store, identity) = open_store();
        store
            .put_document("doc-1", json!({"v": 1}), &identity)
            .await
            .unwrap();
        let receipt = store
            .put_document("doc-2", json!({"v": 2}), &identity)
            .await
            .unwrap();

        // Each append supersedes the previous frontier, so one head
        // remains: the latest entry. A deep walk still yields everything.
        let heads = store.heads(false).await;
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].hash.to_string(), receipt.hash);
        assert_eq!(store.heads(true).await.len(), 2);
    }

    #[tokio::test]
    async fn closed_store_rejects_operations() {
        let (store, identity) = open_store();
        store.close();
        let err = store
            .put_document("doc-1", json!({}), &identity)
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::Runtime(_)));
    }

    #[tokio::test]
    async fn cursor_batches_over_snapshot() {
        let (store, identity) = open_store();
        for i in 0..5 {
            store
                .put_document(format!("doc-{}", i), json!({"i": i}), &identity)
                .await
                .unwrap();
        }

        let mut cursor = store.iterate(None, 2);
        let mut seen = 0;
        while !cursor.done() {
            let batch = cursor.next_batch();
            assert!(batch.len() <= 2);
            seen += batch.len();
        }
        assert_eq!(seen, 5);
    }
}
