//! # Weft - peer-to-peer content federation
//!
//! Weft lets independent *sites* publish catalogs of content pointers
//! (releases, featured releases, categories, blocked-content lists) and
//! lets other sites subscribe to them, receiving both a bounded historical
//! backfill and live updates. Content bytes live in an external
//! content-addressed store and are referenced by CIDs; only metadata
//! pointers travel through the system.
//!
//! ## Quick start
//!
//! ```ignore
//! use weft::{DocumentRuntime, OpenOptions, SiteService, SiteTarget};
//! use weft::site::ReleaseDraft;
//!
//! #[tokio::main]
//! async fn main() {
//!     let runtime = DocumentRuntime::new();
//!
//!     // A publishing site.
//!     let mut publisher = SiteService::init(runtime.clone());
//!     publisher.open_site(SiteTarget::New, OpenOptions::default()).await;
//!     publisher.add_release(ReleaseDraft {
//!         name: "First Release".into(),
//!         category_id: "movies".into(),
//!         content_cid: "bafy...".into(),
//!         ..ReleaseDraft::default()
//!     }).await;
//!
//!     // A subscriber, federating live.
//!     let mut reader = SiteService::init(runtime.clone());
//!     reader.open_site(SiteTarget::New, OpenOptions {
//!         federate: true,
//!         ..OpenOptions::default()
//!     }).await;
//!     let upstream = publisher.get_site_address().unwrap();
//!     reader.add_subscription(upstream, None, None).await;
//!     // Historical backfill and live updates now converge reader's
//!     // collections with the publisher's.
//! }
//! ```
//!
//! ## Architecture
//!
//! - **Document runtime** (`runtime`) - signed append-only logs with
//!   idempotent join, derived indexes, change events, and a topic pubsub
//!   bus.
//! - **Site program** (`site`) - seven replicated collections with access
//!   policies installed at open time.
//! - **Federation manager** (`federation`) - push broadcast of local
//!   mutations, pull-live pubsub ingestion, deadline-bounded historical
//!   backfill, and unsubscribe cleanup.
//! - **Service façade** (`service`) - a uniform request/response API over
//!   the site program.
//!
//! The design is eventually consistent: last-writer-wins per document by
//! log causality, with no cross-collection transactionality. A
//! subscription to a site never propagates writes from sites *it*
//! subscribes to; federation is strictly single-hop.

pub mod config;
pub mod error;
pub mod federation;
pub mod identity;
pub mod policy;
pub mod query;
pub mod runtime;
pub mod schema;
pub mod service;
pub mod site;

// Public API exports
pub use config::{CollectionArgs, FederationConfig, Replication, SiteArgs};
pub use error::{FedResult, FederationError};
pub use federation::{FederatedStore, FederationManager, FederationUpdate};
pub use identity::{Identity, PublicKey};
pub use query::{Filter, Query, SearchOptions, SortBy};
pub use runtime::log::{EntryHash, EntryPayload, LogEntry};
pub use runtime::store::{ChangeBatch, Document, PutReceipt};
pub use runtime::DocumentRuntime;
pub use schema::{
    Administrator, BlockedContent, ContentCategory, FeaturedRelease, Member, Release, SiteAddress,
    SiteMetadata, Subscription,
};
pub use service::{AccountStatus, OpenOptions, ServiceResponse, SiteService, SiteStats, SiteTarget};
pub use site::Site;

/// Initialize the logging system.
///
/// Call once at application startup. The log level is controlled via the
/// `WEFT_LOG` environment variable:
/// - `WEFT_LOG=error` - Only errors
/// - `WEFT_LOG=warn` - Errors and warnings
/// - `WEFT_LOG=info` - General information (default)
/// - `WEFT_LOG=debug` - Debug information
/// - `WEFT_LOG=trace` - Verbose tracing
pub fn init_logging() {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("WEFT_LOG").unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Initialize logging with a specific level.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::new(level);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}
