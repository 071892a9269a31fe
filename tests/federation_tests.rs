/// End-to-end federation tests.
///
/// These drive multiple sites inside one runtime and verify the full
/// subscription lifecycle: historical backfill, live propagation of adds
/// and deletes, unsubscribe cleanup, rejection of unsubscribed origins,
/// single-hop federation, and stop safety.
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use weft::site::ReleaseDraft;
use weft::{
    ContentCategory, DocumentRuntime, EntryPayload, FederatedStore, FederationConfig,
    FederationManager, FederationUpdate, Identity, LogEntry, OpenOptions, Release, SearchOptions,
    Site, SiteArgs, SiteService, SiteTarget,
};

/// Federation timings tightened for tests.
fn test_config() -> FederationConfig {
    FederationConfig::new()
        .sync_deadline(Duration::from_secs(5))
        .poll_interval(Duration::from_millis(50))
        .remote_open_deadline(Duration::from_secs(1))
}

async fn open_service(runtime: &Arc<DocumentRuntime>, federate: bool) -> SiteService {
    let mut service = SiteService::init(Arc::clone(runtime)).with_config(test_config());
    let response = service
        .open_site(
            SiteTarget::New,
            OpenOptions {
                federate,
                ..OpenOptions::default()
            },
        )
        .await;
    assert!(response.success, "open_site failed: {:?}", response.error);
    service
}

fn release_draft(name: &str) -> ReleaseDraft {
    ReleaseDraft {
        name: name.to_string(),
        category_id: "movies".to_string(),
        content_cid: format!("bafy-{}", name.to_lowercase().replace(' ', "-")),
        ..ReleaseDraft::default()
    }
}

fn release_count(service: &SiteService) -> usize {
    service
        .get_releases(&SearchOptions::default())
        .map(|r| r.len())
        .unwrap_or(0)
}

/// Poll a predicate until it holds or the deadline elapses.
async fn wait_until(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        sleep(Duration::from_millis(25)).await;
    }
    predicate()
}

async fn populate_releases(service: &SiteService, count: usize) {
    for i in 0..count {
        let response = service
            .add_release(release_draft(&format!("Historical Release #{}", i)))
            .await;
        assert!(response.success);
    }
}

#[tokio::test]
async fn backfill_of_historical_releases() {
    let runtime = DocumentRuntime::new();
    let publisher = {
        let s = open_service(&runtime, true).await;
        populate_releases(&s, 100).await;
        s
    };
    let subscriber = open_service(&runtime, true).await;

    let upstream = publisher.get_site_address().unwrap();
    let response = subscriber
        .add_subscription(upstream.clone(), Some("upstream".to_string()), None)
        .await;
    assert!(response.success);

    assert!(
        wait_until(Duration::from_secs(5), || release_count(&subscriber) == 100).await,
        "expected 100 backfilled releases, saw {}",
        release_count(&subscriber)
    );

    for release in subscriber.get_releases(&SearchOptions::default()).unwrap() {
        assert_eq!(release.site_address, upstream);
    }
}

#[tokio::test]
async fn live_add_after_backfill() {
    let runtime = DocumentRuntime::new();
    let publisher = open_service(&runtime, true).await;
    populate_releases(&publisher, 10).await;
    let subscriber = open_service(&runtime, true).await;

    let upstream = publisher.get_site_address().unwrap();
    subscriber.add_subscription(upstream, None, None).await;
    assert!(wait_until(Duration::from_secs(5), || release_count(&subscriber) == 10).await);

    let response = publisher
        .add_release(release_draft("Live Update Release"))
        .await;
    assert!(response.success);

    assert!(
        wait_until(Duration::from_secs(2), || release_count(&subscriber) == 11).await,
        "live add did not propagate"
    );
    let live: Vec<Release> = subscriber
        .get_releases(
            &SearchOptions::new().query(weft::Filter::eq("name", "Live Update Release")),
        )
        .unwrap();
    assert_eq!(live.len(), 1);
}

#[tokio::test]
async fn live_delete_after_backfill() {
    let runtime = DocumentRuntime::new();
    let publisher = open_service(&runtime, true).await;
    populate_releases(&publisher, 10).await;
    let subscriber = open_service(&runtime, true).await;

    let upstream = publisher.get_site_address().unwrap();
    subscriber.add_subscription(upstream, None, None).await;
    assert!(wait_until(Duration::from_secs(5), || release_count(&subscriber) == 10).await);

    let added = publisher
        .add_release(release_draft("Live Update Release"))
        .await;
    assert!(added.success);
    let release_id = added.id.unwrap();
    assert!(wait_until(Duration::from_secs(2), || release_count(&subscriber) == 11).await);

    let deleted = publisher.delete_release(&release_id).await;
    assert!(deleted.success);

    assert!(
        wait_until(Duration::from_secs(2), || release_count(&subscriber) == 10).await,
        "live delete did not propagate"
    );
    assert!(subscriber.get_release(&release_id).unwrap().is_none());
}

#[tokio::test]
async fn unsubscribe_cleans_up_federated_rows() {
    let runtime = DocumentRuntime::new();
    let publisher = open_service(&runtime, true).await;
    populate_releases(&publisher, 20).await;
    let subscriber = open_service(&runtime, true).await;

    let upstream = publisher.get_site_address().unwrap();
    subscriber.add_subscription(upstream.clone(), None, None).await;
    assert!(wait_until(Duration::from_secs(5), || release_count(&subscriber) == 20).await);

    let response = subscriber.unsubscribe_from(&upstream).await;
    assert!(response.success);

    assert!(
        wait_until(Duration::from_secs(3), || release_count(&subscriber) == 0).await,
        "federated rows were not cleaned up"
    );

    // The origin is unaffected, and the rows stay gone.
    sleep(Duration::from_millis(200)).await;
    assert_eq!(release_count(&subscriber), 0);
    assert_eq!(release_count(&publisher), 20);
}

#[tokio::test]
async fn unsubscribed_origins_are_rejected() {
    let runtime = DocumentRuntime::new();
    let publisher = open_service(&runtime, true).await;
    let subscriber = open_service(&runtime, true).await;
    let stranger = open_service(&runtime, true).await;

    // The subscriber federates with the publisher only.
    let upstream = publisher.get_site_address().unwrap();
    subscriber.add_subscription(upstream.clone(), None, None).await;
    populate_releases(&publisher, 2).await;
    assert!(wait_until(Duration::from_secs(5), || release_count(&subscriber) == 2).await);

    // The stranger announces a release on its own topic. Nobody listens.
    let announce = stranger.add_release(release_draft("Stranger Release")).await;
    assert!(announce.success);

    // Even a forged update leaked onto the publisher's topic is rejected:
    // the entries inside claim the stranger's address, which the
    // subscriber holds no subscription to.
    let stranger_address = stranger.get_site_address().unwrap();
    let forger = Identity::generate();
    let forged_doc = serde_json::json!({
        "name": "Leaked Release",
        "category_id": "movies",
        "content_cid": "bafy-leaked",
        "thumbnail_cid": null,
        "metadata": null,
        "posted_by": forger.public_key().as_str(),
        "site_address": stranger_address.as_str(),
    });
    let entry = LogEntry::create(
        Vec::new(),
        EntryPayload::Put {
            key: "leaked-1".to_string(),
            document: forged_doc,
        },
        &forger,
        weft::schema::now_ms(),
    )
    .unwrap();
    let update = FederationUpdate::new(FederatedStore::Releases, vec![entry], Vec::new());
    runtime.pubsub().publish(
        update.to_bytes().unwrap(),
        &[format!("{}/federation", upstream)],
    );

    sleep(Duration::from_millis(300)).await;
    assert_eq!(release_count(&subscriber), 2);
    assert!(subscriber.get_release("leaked-1").unwrap().is_none());
}

#[tokio::test]
async fn federation_is_single_hop() {
    let runtime = DocumentRuntime::new();
    let site_a = open_service(&runtime, true).await;
    let site_b = open_service(&runtime, true).await;
    let site_c = open_service(&runtime, true).await;

    let a_addr = site_a.get_site_address().unwrap();
    let b_addr = site_b.get_site_address().unwrap();

    // A publishes; B subscribes to A and observes it.
    site_a.add_release(release_draft("A Original")).await;
    site_b.add_subscription(a_addr, None, None).await;
    assert!(wait_until(Duration::from_secs(5), || release_count(&site_b) == 1).await);

    // B publishes its own release too.
    site_b.add_release(release_draft("B Original")).await;

    // C subscribes to B only, with the recursion hint set. The hint has
    // no runtime effect: C sees B's own rows and never A's.
    site_c
        .add_subscription(b_addr, None, Some(true))
        .await;
    assert!(
        wait_until(Duration::from_secs(5), || release_count(&site_c) == 1).await,
        "C never observed B's own release"
    );

    sleep(Duration::from_millis(300)).await;
    let c_releases = site_c.get_releases(&SearchOptions::default()).unwrap();
    assert_eq!(c_releases.len(), 1);
    assert_eq!(c_releases[0].name, "B Original");
}

#[tokio::test]
async fn manager_tracks_active_federations() {
    let runtime = DocumentRuntime::new();
    let publisher = open_service(&runtime, true).await;
    populate_releases(&publisher, 3).await;
    let upstream = publisher.get_site_address().unwrap();

    // Drive the manager directly to observe its federation lifecycle.
    let identity = Arc::new(Identity::generate());
    let site = Site::open(Arc::clone(&runtime), identity, SiteArgs::publishing())
        .await
        .unwrap();
    let manager = FederationManager::new(Arc::clone(&site), test_config());
    manager.start().await;
    assert_eq!(manager.active_count(), 0);
    assert!(!manager.is_federating_with(&upstream));

    let receipt = site
        .add_subscription(upstream.clone(), None, None)
        .await
        .unwrap();
    assert!(receipt.is_some());
    assert!(
        wait_until(Duration::from_secs(2), || {
            manager.is_federating_with(&upstream)
        })
        .await,
        "federation never became active"
    );
    assert_eq!(manager.active_count(), 1);
    assert!(
        wait_until(Duration::from_secs(5), || {
            site.get_releases(&SearchOptions::default()).len() == 3
        })
        .await
    );

    let subscription = site.subscription_to(&upstream).unwrap();
    site.delete_subscription(&subscription.id).await.unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            !manager.is_federating_with(&upstream)
        })
        .await,
        "federation was not torn down on unsubscribe"
    );
    assert_eq!(manager.active_count(), 0);

    manager.stop().await;
    site.close();
}

#[tokio::test]
async fn stop_is_safe_during_inflight_sync() {
    let runtime = DocumentRuntime::new();
    let publisher = open_service(&runtime, true).await;
    populate_releases(&publisher, 5).await;
    let mut subscriber = open_service(&runtime, true).await;

    let upstream = publisher.get_site_address().unwrap();
    subscriber.add_subscription(upstream.clone(), None, None).await;

    // Stop while the historical sync is still inside its poll loop.
    sleep(Duration::from_millis(80)).await;
    tokio::time::timeout(Duration::from_secs(3), subscriber.stop())
        .await
        .expect("stop did not resolve in bounded time");

    // No topic left subscribed, no remote program left open.
    let topic = format!("{}/federation", upstream);
    assert_eq!(runtime.pubsub().subscriber_count(&topic), 0);
    let publisher_state = runtime.site(&upstream).unwrap();
    assert_eq!(publisher_state.replica_count(), 0);
}

#[tokio::test]
async fn categories_federate_with_deterministic_ids() {
    let runtime = DocumentRuntime::new();
    let publisher = open_service(&runtime, true).await;
    let subscriber = open_service(&runtime, true).await;

    let draft = weft::site::ContentCategoryDraft {
        category_id: "movies".to_string(),
        display_name: "Movies".to_string(),
        featured: true,
        ..weft::site::ContentCategoryDraft::default()
    };
    let first = publisher.add_content_category(draft.clone()).await;
    let second = publisher.add_content_category(draft).await;
    assert_eq!(first.id, second.id);

    let upstream = publisher.get_site_address().unwrap();
    subscriber.add_subscription(upstream.clone(), None, None).await;

    let expected_id = weft::schema::category_id(&upstream, "movies");
    assert!(
        wait_until(Duration::from_secs(5), || {
            subscriber
                .get_content_category(&expected_id)
                .ok()
                .flatten()
                .is_some()
        })
        .await,
        "category did not federate"
    );

    let categories: Vec<ContentCategory> = subscriber
        .get_content_categories(&SearchOptions::default())
        .unwrap();
    assert_eq!(categories.len(), 1);
}

#[tokio::test]
async fn self_subscription_is_inert() {
    let runtime = DocumentRuntime::new();
    let service = open_service(&runtime, true).await;
    let own = service.get_site_address().unwrap();

    let response = service.add_subscription(own, None, None).await;
    assert!(response.success);
    assert!(response.id.is_none());
    assert_eq!(
        service
            .get_subscriptions(&SearchOptions::default())
            .unwrap()
            .len(),
        0
    );
}

#[tokio::test]
async fn blocked_content_federates_and_cleans_up() {
    let runtime = DocumentRuntime::new();
    let publisher = open_service(&runtime, true).await;
    let subscriber = open_service(&runtime, true).await;

    publisher.block_content("bafy-banned").await;
    let upstream = publisher.get_site_address().unwrap();
    subscriber.add_subscription(upstream.clone(), None, None).await;

    let blocked_count = || {
        subscriber
            .get_blocked_content(&SearchOptions::default())
            .map(|b| b.len())
            .unwrap_or(0)
    };
    assert!(wait_until(Duration::from_secs(5), || blocked_count() == 1).await);

    subscriber.unsubscribe_from(&upstream).await;
    assert!(wait_until(Duration::from_secs(3), || blocked_count() == 0).await);
}

#[tokio::test]
async fn dangling_featured_reference_is_inert() {
    let runtime = DocumentRuntime::new();
    let publisher = open_service(&runtime, true).await;
    let subscriber = open_service(&runtime, true).await;

    // Feature a release, then delete the release: the reference dangles.
    let release = publisher.add_release(release_draft("Promoted")).await;
    let release_id = release.id.unwrap();
    let featured = publisher
        .add_featured_release(weft::site::FeaturedReleaseDraft {
            release_id: release_id.clone(),
            start_time: weft::schema::now_ms(),
            end_time: weft::schema::now_ms() + 60_000,
            promoted: true,
        })
        .await;
    assert!(featured.success);
    publisher.delete_release(&release_id).await;

    let upstream = publisher.get_site_address().unwrap();
    subscriber.add_subscription(upstream, None, None).await;

    assert!(
        wait_until(Duration::from_secs(5), || {
            subscriber
                .get_featured_releases(&SearchOptions::default())
                .map(|f| f.len() == 1)
                .unwrap_or(false)
        })
        .await
    );
    // The referenced release is gone everywhere; the pointer simply dangles.
    assert_eq!(release_count(&subscriber), 0);
}
