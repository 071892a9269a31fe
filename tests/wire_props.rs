/// Property tests for the pure surfaces: wire frame decoding and
/// deterministic id derivation.
use proptest::prelude::*;
use weft::schema::{blocked_content_id, category_id};
use weft::{FederatedStore, FederationUpdate, SiteAddress};

proptest! {
    /// Arbitrary bytes never decode, and never panic the decoder.
    #[test]
    fn garbage_frames_are_rejected(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        // A random buffer is overwhelmingly unlikely to carry a valid
        // length prefix plus a well-formed tagged JSON body.
        prop_assert!(FederationUpdate::from_bytes(&bytes).is_none());
    }

    /// Encoding always survives its own decoder.
    #[test]
    fn empty_updates_round_trip(store_index in 0usize..4) {
        let store = FederatedStore::ALL[store_index];
        let update = FederationUpdate::new(store, Vec::new(), Vec::new());
        let frame = update.to_bytes().unwrap();
        let decoded = FederationUpdate::from_bytes(&frame).unwrap();
        prop_assert_eq!(decoded.store, store);
        prop_assert!(decoded.is_empty());
    }

    /// Category ids are a pure function of (site, category) and collide
    /// only on identical inputs.
    #[test]
    fn category_ids_are_deterministic(
        site_a in "[a-zA-Z0-9]{1,32}",
        site_b in "[a-zA-Z0-9]{1,32}",
        cat_a in "[a-zA-Z0-9_-]{1,32}",
        cat_b in "[a-zA-Z0-9_-]{1,32}",
    ) {
        let a = category_id(&SiteAddress::new(site_a.clone()), &cat_a);
        prop_assert_eq!(&a, &category_id(&SiteAddress::new(site_a.clone()), &cat_a));

        if site_a != site_b || cat_a != cat_b {
            let b = category_id(&SiteAddress::new(site_b), &cat_b);
            // Distinct inputs hash apart (modulo sha256 collisions).
            prop_assert_ne!(a, b);
        }
    }

    /// Blocked-content ids are deterministic per (site, cid).
    #[test]
    fn blocked_content_ids_are_deterministic(
        site in "[a-zA-Z0-9]{1,32}",
        cid in "[a-zA-Z0-9]{1,64}",
    ) {
        let site = SiteAddress::new(site);
        prop_assert_eq!(blocked_content_id(&site, &cid), blocked_content_id(&site, &cid));
    }
}
