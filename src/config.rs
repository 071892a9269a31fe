/// Configuration for sites and federation timing.
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Replication setting for a single collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Replication {
    /// Do not replicate this collection.
    Disabled,
    /// Replicate without a factor bound.
    Enabled,
    /// Replicate to at most this many peers.
    Factor(usize),
}

impl Default for Replication {
    fn default() -> Self {
        Self::Disabled
    }
}

/// Per-collection open parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionArgs {
    /// Replication mode for this collection.
    pub replicate: Replication,
    /// Minimum replica count to aim for.
    pub replicas_min: Option<usize>,
    /// Disable the in-memory index cache.
    pub disable_cache: bool,
}

impl CollectionArgs {
    /// Replicated collection with no factor bound.
    pub fn replicated() -> Self {
        Self {
            replicate: Replication::Enabled,
            ..Self::default()
        }
    }

    /// Replicated collection bounded to a factor.
    pub fn factor(factor: usize) -> Self {
        Self {
            replicate: Replication::Factor(factor),
            ..Self::default()
        }
    }

    /// Non-replicated collection.
    pub fn local_only() -> Self {
        Self::default()
    }
}

/// Open parameters for all seven collections of a site.
///
/// Unspecified collections default to `replicate: Disabled`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteArgs {
    pub releases_args: CollectionArgs,
    pub featured_releases_args: CollectionArgs,
    pub content_categories_args: CollectionArgs,
    pub subscriptions_args: CollectionArgs,
    pub blocked_content_args: CollectionArgs,
    pub members_args: CollectionArgs,
    pub administrators_args: CollectionArgs,
}

impl SiteArgs {
    /// Defaults for a publishing site: federated collections replicated,
    /// site-private collections local-only.
    pub fn publishing() -> Self {
        Self {
            releases_args: CollectionArgs::replicated(),
            featured_releases_args: CollectionArgs::replicated(),
            content_categories_args: CollectionArgs::replicated(),
            blocked_content_args: CollectionArgs::replicated(),
            ..Self::default()
        }
    }

    /// Minimal replication used when opening a remote site for historical
    /// sync: factor 1 on the four federated collections, nothing else.
    pub fn remote_minimal() -> Self {
        Self {
            releases_args: CollectionArgs::factor(1),
            featured_releases_args: CollectionArgs::factor(1),
            content_categories_args: CollectionArgs::factor(1),
            blocked_content_args: CollectionArgs::factor(1),
            ..Self::default()
        }
    }
}

/// Timing constants for the federation manager.
///
/// These are the only tunables the engine exposes.
#[derive(Debug, Clone)]
pub struct FederationConfig {
    /// Hard deadline for a subscription's historical backfill (default: 60 s).
    pub sync_deadline: Duration,
    /// Poll interval inside the historical head-join loop (default: 3 s).
    pub poll_interval: Duration,
    /// Deadline for opening a remote site (default: 15 s).
    pub remote_open_deadline: Duration,
    /// Batch size when iterating an index during unsubscribe cleanup.
    pub iterate_batch_size: usize,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            sync_deadline: Duration::from_secs(60),
            poll_interval: Duration::from_secs(3),
            remote_open_deadline: Duration::from_secs(15),
            iterate_batch_size: 1000,
        }
    }
}

impl FederationConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the historical-sync deadline.
    pub fn sync_deadline(mut self, deadline: Duration) -> Self {
        self.sync_deadline = deadline;
        self
    }

    /// Set the historical poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the remote-open deadline.
    pub fn remote_open_deadline(mut self, deadline: Duration) -> Self {
        self.remote_open_deadline = deadline;
        self
    }

    /// Set the iterate batch size.
    pub fn iterate_batch_size(mut self, size: usize) -> Self {
        self.iterate_batch_size = size;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let config = FederationConfig::default();
        assert_eq!(config.sync_deadline, Duration::from_secs(60));
        assert_eq!(config.poll_interval, Duration::from_secs(3));
        assert_eq!(config.remote_open_deadline, Duration::from_secs(15));
        assert_eq!(config.iterate_batch_size, 1000);
    }

    #[test]
    fn unspecified_collections_do_not_replicate() {
        let args = SiteArgs::default();
        assert_eq!(args.members_args.replicate, Replication::Disabled);
        assert_eq!(args.releases_args.replicate, Replication::Disabled);
    }

    #[test]
    fn remote_minimal_replication() {
        let args = SiteArgs::remote_minimal();
        assert_eq!(args.releases_args.replicate, Replication::Factor(1));
        assert_eq!(args.subscriptions_args.replicate, Replication::Disabled);
        assert_eq!(args.administrators_args.replicate, Replication::Disabled);
    }
}
