mod common;

use std::sync::Arc;

use common::*;
use orgmesh::{
    crypto::{ChaChaSealer, MessageSealer},
    mesh::MeshPhase,
    store::{MemoryBackend, PeerStore},
    types::{PeerId, Role},
    NodeError, NodeEvent, NodeHandle,
};

fn sealed(mesh: &TestMesh, id: &str, role: Role, sealer: &Arc<dyn MessageSealer>) -> NodeHandle {
    mesh.node(id, role, PeerStore::new(MemoryBackend::new()))
        .with_sealer(sealer.clone())
        .start()
}

#[test_log::test(tokio::test(start_paused = true))]
async fn admin_forwards_locations_between_clients() {
    let mesh = TestMesh::new();
    let sealer: Arc<dyn MessageSealer> = Arc::new(ChaChaSealer::new(&ChaChaSealer::generate_key()));
    let sender = sealed(&mesh, "client-1", Role::Client, &sealer);
    let receiver = sealed(&mesh, "client-2", Role::Client, &sealer);
    mesh.registered(&["client-1", "client-2"]).await;
    let admin = sealed(&mesh, ADMIN, Role::Admin, &sealer);
    for client in [&sender, &receiver] {
        connected(client, ADMIN).await;
    }
    // clients only link with the admin while it is around
    assert_eq!(sender.peer_status(&PeerId::new("client-2")), None);

    let mut at_admin = admin.subscribe();
    let mut at_receiver = receiver.subscribe();
    let delivered = sender
        .broadcast_location(59.3293, 18.0686, Some(12.5))
        .await
        .unwrap();
    assert_eq!(delivered, 1);

    let NodeEvent::LocationReceived(update) = wait_for(&mut at_receiver, |e| {
        matches!(e, NodeEvent::LocationReceived(_))
    })
    .await
    else {
        unreachable!()
    };
    assert_eq!(update.peer_id, PeerId::new("client-1"));
    assert_eq!(update.latitude, 59.3293);
    assert_eq!(update.longitude, 18.0686);
    assert_eq!(update.accuracy, Some(12.5));

    let seen_by_admin = wait_for(&mut at_admin, |e| matches!(e, NodeEvent::LocationReceived(_))).await;
    assert_eq!(seen_by_admin, NodeEvent::LocationReceived(update));
}

#[test_log::test(tokio::test(start_paused = true))]
async fn handle_reports_errors_and_survives_clearing_state() {
    let mesh = TestMesh::new();
    let store = PeerStore::new(MemoryBackend::new());
    let admin = mesh.node(ADMIN, Role::Admin, store.clone()).start();
    mesh.registered(&[ADMIN]).await;

    let err = admin.open_connection(PeerId::new(ADMIN)).await.unwrap_err();
    assert!(matches!(err, NodeError::UnknownPeer(peer) if peer == PeerId::new(ADMIN)));

    let snapshot = admin.mesh_state().await.unwrap();
    assert_eq!(snapshot.phase, MeshPhase::Normal);
    assert!(snapshot.state.has_active_admin);
    assert_eq!(admin.primary_admin().await.unwrap(), Some(PeerId::new(ADMIN)));

    eventually(|| store.backend().raw(&org()).is_some()).await;
    admin.clear_stored_state().await.unwrap();
    assert!(store.load(&org()).await.unwrap().is_none());
    // forcing a reconnect with no peers is a no-op
    admin.force_reconnect(None).await.unwrap();

    admin.shutdown().await.unwrap();
    assert!(matches!(admin.mesh_state().await, Err(NodeError::ChannelClosed)));
    assert!(matches!(
        admin.open_connection(PeerId::new("client-1")).await,
        Err(NodeError::ChannelClosed)
    ));
    assert!(matches!(admin.shutdown().await, Err(NodeError::ChannelClosed)));
}
