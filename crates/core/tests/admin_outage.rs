mod common;

use std::time::Duration;

use common::*;
use orgmesh::{
    mesh::MeshPhase,
    store::{MemoryBackend, PeerStore},
    types::{PeerId, Role},
    NodeEvent,
};
use tokio::time::Instant;

const CLIENTS: [&str; 3] = ["client-1", "client-2", "client-3"];

#[test_log::test(tokio::test(start_paused = true))]
async fn clients_elect_a_relay_while_the_admin_is_away() {
    let mesh = TestMesh::new();
    let admin_store = PeerStore::new(MemoryBackend::new());
    let clients: Vec<_> = CLIENTS
        .iter()
        .map(|id| mesh.start(id, Role::Client))
        .collect();
    mesh.registered(&CLIENTS).await;
    let admin = mesh.node(ADMIN, Role::Admin, admin_store.clone()).start();
    for client in &clients {
        connected(client, ADMIN).await;
    }

    let mut relay_events = clients[0].subscribe();
    let mut member_events = clients[1].subscribe();
    admin.shutdown().await.unwrap();
    let stopped_at = Instant::now();

    wait_for(&mut member_events, |e| *e == NodeEvent::AdminAbsent).await;
    let silent_for = stopped_at.elapsed();
    assert!(silent_for >= Duration::from_secs(10), "absent after {silent_for:?}");
    assert!(silent_for <= Duration::from_secs(17), "absent after {silent_for:?}");

    // nobody has client links yet, so the smallest id wins
    let elected = wait_for(&mut member_events, |e| {
        matches!(e, NodeEvent::TemporaryRelayElected { .. })
    })
    .await;
    assert_eq!(
        elected,
        NodeEvent::TemporaryRelayElected {
            relay: PeerId::new("client-1"),
            local: false,
        }
    );
    let elected = wait_for(&mut relay_events, |e| {
        matches!(e, NodeEvent::TemporaryRelayElected { .. })
    })
    .await;
    assert_eq!(
        elected,
        NodeEvent::TemporaryRelayElected {
            relay: PeerId::new("client-1"),
            local: true,
        }
    );

    connected(&clients[0], "client-2").await;
    connected(&clients[0], "client-3").await;
    connected(&clients[1], "client-1").await;
    assert_eq!(
        clients[0].mesh_state().await.unwrap().phase,
        MeshPhase::TemporaryRelay
    );
    // members keep waiting for the admin while they follow the relay
    let state = clients[2].mesh_state().await.unwrap();
    assert_eq!(state.phase, MeshPhase::AdminAbsent);
    assert!(!state.state.has_active_admin);
    assert_eq!(state.state.temporary_relay_id, Some(PeerId::new("client-1")));
    // members do not link with each other
    assert_eq!(clients[1].peer_status(&PeerId::new("client-3")), None);

    let restarted_at = Instant::now();
    let admin = mesh.node(ADMIN, Role::Admin, admin_store).start();

    wait_for(&mut member_events, |e| {
        *e == NodeEvent::TemporaryRelayDemoted {
            relay: PeerId::new("client-1"),
            local: false,
        }
    })
    .await;
    wait_for(&mut member_events, |e| *e == NodeEvent::AdminRestored).await;
    assert!(restarted_at.elapsed() <= Duration::from_secs(5));
    wait_for(&mut relay_events, |e| {
        *e == NodeEvent::TemporaryRelayDemoted {
            relay: PeerId::new("client-1"),
            local: true,
        }
    })
    .await;

    for client in &clients {
        within("admin restored", async {
            while client.mesh_state().await.unwrap().phase != MeshPhase::Normal {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
        let state = client.mesh_state().await.unwrap();
        assert!(state.state.has_active_admin);
        assert_eq!(state.state.temporary_relay_id, None);
        connected(client, ADMIN).await;
    }
    for id in CLIENTS {
        connected(&admin, id).await;
    }
    // relay-mode links are gone once the admin is back
    let relay_peer = PeerId::new("client-2");
    eventually(|| clients[0].peer_status(&relay_peer).is_none()).await;
}

#[test_log::test(tokio::test(start_paused = true))]
async fn second_admin_takes_over_as_primary() {
    let mesh = TestMesh::new();
    let first = mesh.start(ADMIN, Role::Admin);
    let second = mesh.start("admin-b", Role::Admin);
    mesh.registered(&[ADMIN, "admin-b"]).await;

    eventually_primary(&second, ADMIN).await;
    assert_eq!(first.primary_admin().await.unwrap(), Some(PeerId::new(ADMIN)));

    let mut events = second.subscribe();
    first.shutdown().await.unwrap();
    let change = wait_for(&mut events, |e| {
        matches!(e, NodeEvent::PrimaryAdminChanged { .. })
    })
    .await;
    assert_eq!(
        change,
        NodeEvent::PrimaryAdminChanged {
            previous: Some(PeerId::new(ADMIN)),
            primary: Some(PeerId::new("admin-b")),
        }
    );
}

async fn eventually_primary(node: &orgmesh::NodeHandle, expected: &str) {
    let expected = Some(PeerId::new(expected));
    within("primary admin", async {
        while node.primary_admin().await.unwrap() != expected {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
}
