//! End-to-end engine test: a fresh DKG roster signs under a tweaked key.

use std::sync::Arc;
use std::time::Duration;

use frost_engine::{keygen, sign_with_tweak, MemoryPubsub, PubsubNet, SessionHub};

async fn hubs(net: &Arc<MemoryPubsub>, ids: &[&str]) -> Vec<Arc<SessionHub>> {
    let mut out = Vec::new();
    for id in ids {
        let net: Arc<dyn PubsubNet> = Arc::clone(net) as Arc<dyn PubsubNet>;
        out.push(SessionHub::start(net, id).await.unwrap());
    }
    out
}

#[tokio::test]
async fn dkg_then_threshold_sign() {
    let ids = ["alice", "bob", "carol"];
    let net = Arc::new(MemoryPubsub::new());
    let hubs = hubs(&net, &ids).await;
    let roster: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
    let timeout = Duration::from_secs(10);

    let (a, b, c) = tokio::join!(
        keygen(&hubs[0], &roster, timeout),
        keygen(&hubs[1], &roster, timeout),
        keygen(&hubs[2], &roster, timeout),
    );
    let shares = [a.unwrap(), b.unwrap(), c.unwrap()];

    let group_key = shares[0].x_only().unwrap();
    assert!(shares.iter().all(|s| s.x_only().unwrap() == group_key));
    assert_eq!(shares[0].threshold(), 2);

    let message = [0xabu8; 32];
    let merkle_root = [0xcdu8; 32];
    let (sa, sb, sc) = tokio::join!(
        sign_with_tweak(&hubs[0], &shares[0], &roster, &message, &merkle_root, timeout),
        sign_with_tweak(&hubs[1], &shares[1], &roster, &message, &merkle_root, timeout),
        sign_with_tweak(&hubs[2], &shares[2], &roster, &message, &merkle_root, timeout),
    );
    let (sa, sb, sc) = (sa.unwrap(), sb.unwrap(), sc.unwrap());

    // everyone holds the same signature, ready to attach as a witness
    assert_eq!(sa, sb);
    assert_eq!(sb, sc);
}

#[tokio::test]
async fn consecutive_rounds_reuse_the_topic() {
    let ids = ["alice", "bob"];
    let net = Arc::new(MemoryPubsub::new());
    let hubs = hubs(&net, &ids).await;
    let roster: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
    let timeout = Duration::from_secs(10);

    let (a, b) = tokio::join!(
        keygen(&hubs[0], &roster, timeout),
        keygen(&hubs[1], &roster, timeout),
    );
    let shares = [a.unwrap(), b.unwrap()];

    // two sequential signing sessions over the same subscription
    for byte in [1u8, 2u8] {
        let message = [byte; 32];
        let root = [0u8; 32];
        let (sa, sb) = tokio::join!(
            sign_with_tweak(&hubs[0], &shares[0], &roster, &message, &root, timeout),
            sign_with_tweak(&hubs[1], &shares[1], &roster, &message, &root, timeout),
        );
        assert_eq!(sa.unwrap(), sb.unwrap());
    }
}
