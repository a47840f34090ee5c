mod common;

use std::time::Duration;

use common::*;
use orgmesh::{
    reconnect::FailureReason,
    store::{MemoryBackend, PeerStore},
    types::{PeerId, Role},
    NodeEvent,
};

#[test_log::test(tokio::test(start_paused = true))]
async fn unreachable_peer_is_given_up_after_five_attempts() {
    let mesh = TestMesh::new();
    let client_id = PeerId::new("client-1");
    mesh.network.set_unreachable(&client_id, true);
    let client = mesh.start("client-1", Role::Client);
    mesh.registered(&["client-1"]).await;

    let store = PeerStore::new(MemoryBackend::new());
    let node = mesh.node(ADMIN, Role::Admin, store.clone());
    let mut events = node.subscribe();
    let admin = node.start();

    let mut attempts = Vec::new();
    let failure = within("permanent failure", async {
        loop {
            match wait_for(&mut events, |e| {
                matches!(
                    e,
                    NodeEvent::ReconnectionScheduled { .. } | NodeEvent::PeerPermanentlyFailed { .. }
                )
            })
            .await
            {
                NodeEvent::ReconnectionScheduled {
                    peer,
                    reason,
                    attempt,
                    ..
                } => {
                    assert_eq!(peer, client_id);
                    assert_eq!(reason, FailureReason::IceFailed);
                    attempts.push(attempt);
                }
                event => return event,
            }
        }
    })
    .await;
    assert_eq!(attempts, vec![1, 2, 3, 4, 5]);
    assert_eq!(
        failure,
        NodeEvent::PeerPermanentlyFailed {
            peer: client_id.clone(),
            reason: FailureReason::IceFailed,
            attempts: 5,
        }
    );
    assert!(admin.is_permanently_failed(&client_id));
    assert_eq!(admin.peer_status(&client_id), None);
    assert_eq!(admin.active_attempt(&client_id), None);

    // every failure was counted in the store until the peer was evicted
    let state = store.load(&org()).await.unwrap().unwrap();
    assert!(state.peer(&client_id).is_none());

    // presence and reconnection requests from the client do not revive it
    tokio::time::sleep(Duration::from_secs(60)).await;
    let later = drain(&mut events);
    assert!(
        reconnections(&later).is_empty(),
        "retried a failed peer: {later:?}"
    );
    assert!(admin.is_permanently_failed(&client_id));

    // an explicit open starts over
    mesh.network.set_unreachable(&client_id, false);
    admin.open_connection(client_id.clone()).await.unwrap();
    connected(&admin, "client-1").await;
    connected(&client, ADMIN).await;
    assert!(!admin.is_permanently_failed(&client_id));
    let state = store.load(&org()).await.unwrap().unwrap();
    assert_eq!(state.peer(&client_id).unwrap().connection_attempts, 0);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn dropped_link_recovers_on_the_first_attempt() {
    let mesh = TestMesh::new();
    let client = mesh.start("client-1", Role::Client);
    mesh.registered(&["client-1"]).await;
    let admin = mesh.start(ADMIN, Role::Admin);
    connected(&admin, "client-1").await;
    connected(&client, ADMIN).await;

    let mut events = admin.subscribe();
    mesh.network
        .drop_link(&PeerId::new(ADMIN), &PeerId::new("client-1"));

    let scheduled = wait_for(&mut events, |e| {
        matches!(e, NodeEvent::ReconnectionScheduled { .. })
    })
    .await;
    let NodeEvent::ReconnectionScheduled {
        peer,
        reason,
        attempt,
        delay,
    } = scheduled
    else {
        unreachable!()
    };
    assert_eq!(peer, PeerId::new("client-1"));
    assert_eq!(reason, FailureReason::ConnectionLost);
    assert_eq!(attempt, 1);
    // one second base plus up to ten percent jitter
    assert!(delay >= Duration::from_secs(1), "{delay:?}");
    assert!(delay <= Duration::from_millis(1100), "{delay:?}");

    connected(&admin, "client-1").await;
    connected(&client, ADMIN).await;
    eventually(|| admin.active_attempt(&PeerId::new("client-1")).is_none()).await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn force_reconnect_all_retries_given_up_peers() {
    let mesh = TestMesh::new();
    let client_id = PeerId::new("client-1");
    mesh.network.set_unreachable(&client_id, true);
    let client = mesh.start("client-1", Role::Client);
    mesh.registered(&["client-1"]).await;

    let node = mesh.node(ADMIN, Role::Admin, PeerStore::new(MemoryBackend::new()));
    let mut events = node.subscribe();
    let admin = node.start();
    wait_for(&mut events, |e| {
        matches!(e, NodeEvent::PeerPermanentlyFailed { .. })
    })
    .await;
    assert!(admin.is_permanently_failed(&client_id));
    assert_eq!(admin.peer_status(&client_id), None);

    mesh.network.set_unreachable(&client_id, false);
    admin.force_reconnect(None).await.unwrap();
    let scheduled = wait_for(&mut events, |e| {
        matches!(e, NodeEvent::ReconnectionScheduled { .. })
    })
    .await;
    assert!(matches!(
        scheduled,
        NodeEvent::ReconnectionScheduled { peer, attempt: 1, .. } if peer == client_id
    ));
    connected(&admin, "client-1").await;
    connected(&client, ADMIN).await;
    assert!(!admin.is_permanently_failed(&client_id));
}
