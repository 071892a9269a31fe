/// Access policies for the replicated collections.
///
/// Policies are pure, synchronous classifiers over candidate writes. The
/// four federated collections share one policy: self-origin writes fall
/// through to the local membership rules, remote-origin puts require a
/// fresh subscription lookup on the origin address, and remote-origin
/// deletes are admitted unconditionally (tombstones are idempotent and
/// bounded by what was previously accepted).
///
/// Site-private collections use independent policies: members and
/// administrators are mutable only by the root-of-trust key that opened
/// the site; subscriptions only by the site's administrators.
use crate::identity::PublicKey;
use crate::runtime::store::{AccessPolicy, Store, WriteKind, WriteOp};
use crate::schema::{document_posted_by, document_site_address, SiteAddress};
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Check whether a key is listed in a membership collection.
///
/// Member and administrator documents use the public key as their id, so
/// this is a direct index lookup.
fn is_listed(store: &Store, key: &PublicKey) -> bool {
    store.index_get(key.as_str()).is_some()
}

/// Look up whether the local site holds a subscription to `origin`.
///
/// A fresh exact-match search against the subscriptions index.
pub fn is_subscribed_to(subscriptions: &Store, origin: &SiteAddress) -> bool {
    subscriptions.index_any(|doc| {
        doc.get("to").and_then(JsonValue::as_str) == Some(origin.as_str())
    })
}

/// Authorship rules shared by every put.
///
/// A new row must be posted by its signer; an edit must preserve the
/// original `posted_by`.
fn authorship_holds(op: &WriteOp<'_>) -> bool {
    let Some(document) = op.document else {
        return false;
    };
    let Some(posted_by) = document_posted_by(document) else {
        return false;
    };
    match op.existing {
        None => &posted_by == op.signer,
        Some(existing) => Some(posted_by) == document_posted_by(existing),
    }
}

/// Local membership rules for self-origin writes to a federated collection.
pub struct LocalWritePolicy {
    members: Arc<Store>,
    administrators: Arc<Store>,
}

impl LocalWritePolicy {
    pub fn new(members: Arc<Store>, administrators: Arc<Store>) -> Self {
        Self {
            members,
            administrators,
        }
    }

    fn is_admin(&self, key: &PublicKey) -> bool {
        is_listed(&self.administrators, key)
    }

    fn may_post(&self, key: &PublicKey) -> bool {
        self.is_admin(key) || is_listed(&self.members, key)
    }
}

impl AccessPolicy for LocalWritePolicy {
    fn can_apply(&self, op: &WriteOp<'_>) -> bool {
        match (op.kind, op.existing) {
            (WriteKind::Put, None) => self.may_post(op.signer) && authorship_holds(op),
            (WriteKind::Put, Some(existing)) => {
                let original = document_posted_by(existing);
                let may_edit =
                    original.as_ref() == Some(op.signer) || self.is_admin(op.signer);
                may_edit && authorship_holds(op)
            }
            (WriteKind::Del, Some(existing)) => {
                document_posted_by(existing).as_ref() == Some(op.signer)
                    || self.is_admin(op.signer)
            }
            (WriteKind::Del, None) => false,
        }
    }
}

/// The reusable federated-write classifier.
///
/// Determines the origin site of the candidate write (from the put payload
/// or the existing row for a delete), then dispatches: self-origin writes
/// go to the local policy, remote puts are admitted iff the origin is
/// subscribed, and remote deletes are admitted unconditionally. A delete
/// whose target row is absent is denied.
pub fn can_perform_federated_write(
    self_address: &SiteAddress,
    subscriptions: &Store,
    op: &WriteOp<'_>,
    local: &dyn AccessPolicy,
) -> bool {
    let origin = match op.kind {
        WriteKind::Put => op.document.and_then(document_site_address),
        WriteKind::Del => op.existing.and_then(document_site_address),
    };
    let Some(origin) = origin else {
        return false;
    };

    if &origin == self_address {
        return local.can_apply(op);
    }

    match op.kind {
        WriteKind::Put => is_subscribed_to(subscriptions, &origin) && authorship_holds(op),
        WriteKind::Del => true,
    }
}

/// Policy installed on the four federated collections.
pub struct FederatedCollectionPolicy {
    self_address: SiteAddress,
    subscriptions: Arc<Store>,
    local: LocalWritePolicy,
}

impl FederatedCollectionPolicy {
    pub fn new(
        self_address: SiteAddress,
        subscriptions: Arc<Store>,
        members: Arc<Store>,
        administrators: Arc<Store>,
    ) -> Self {
        Self {
            self_address,
            subscriptions,
            local: LocalWritePolicy::new(members, administrators),
        }
    }
}

impl AccessPolicy for FederatedCollectionPolicy {
    fn can_apply(&self, op: &WriteOp<'_>) -> bool {
        can_perform_federated_write(&self.self_address, &self.subscriptions, op, &self.local)
    }
}

/// Policy for members and administrators: only the root-of-trust key that
/// opened the site may mutate, and rows must be posted by it.
pub struct RootOfTrustPolicy {
    root: PublicKey,
}

impl RootOfTrustPolicy {
    pub fn new(root: PublicKey) -> Self {
        Self { root }
    }
}

impl AccessPolicy for RootOfTrustPolicy {
    fn can_apply(&self, op: &WriteOp<'_>) -> bool {
        if op.signer != &self.root {
            return false;
        }
        match op.kind {
            WriteKind::Put => authorship_holds(op),
            WriteKind::Del => op.existing.is_some(),
        }
    }
}

/// Policy for the subscriptions collection: administrators of the
/// subscribing site only, and rows must belong to this site.
pub struct SubscriptionPolicy {
    self_address: SiteAddress,
    administrators: Arc<Store>,
}

impl SubscriptionPolicy {
    pub fn new(self_address: SiteAddress, administrators: Arc<Store>) -> Self {
        Self {
            self_address,
            administrators,
        }
    }
}

impl AccessPolicy for SubscriptionPolicy {
    fn can_apply(&self, op: &WriteOp<'_>) -> bool {
        if !is_listed(&self.administrators, op.signer) {
            return false;
        }
        match op.kind {
            WriteKind::Put => {
                let Some(document) = op.document else {
                    return false;
                };
                document_site_address(document).as_ref() == Some(&self.self_address)
                    && authorship_holds(op)
            }
            WriteKind::Del => op.existing.is_some(),
        }
    }
}
