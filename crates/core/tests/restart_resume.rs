mod common;

use chrono::Utc;
use common::*;
use orgmesh::{
    message::SessionDescription,
    reconnect::FailureReason,
    store::{FileBackend, MemoryBackend, PeerStore, ServerState, StoredPeer, StoreBackend},
    types::{PeerId, Role},
    NodeEvent,
};

fn stored(id: &str, hours_ago: i64) -> StoredPeer {
    StoredPeer {
        last_connected: Utc::now() - chrono::Duration::hours(hours_ago),
        ..StoredPeer::new(PeerId::new(id), id, org())
    }
}

async fn preload<B: StoreBackend>(store: &PeerStore<B>, clients: Vec<StoredPeer>) {
    let mut state = ServerState::new(org(), "Acme");
    state.admin_id = Some(PeerId::new(ADMIN));
    state.is_active = true;
    state.clients = clients;
    store.save(&state).await.unwrap();
}

fn resumed(events: &[NodeEvent]) -> Vec<(PeerId, FailureReason, u32)> {
    let mut out: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            NodeEvent::ReconnectionScheduled {
                peer,
                reason,
                attempt,
                ..
            } => Some((peer.clone(), *reason, *attempt)),
            _ => None,
        })
        .collect();
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

fn stored_offer(store: &PeerStore<MemoryBackend>, id: &str) -> Option<(u32, Option<SessionDescription>)> {
    let raw = store.backend().raw(&org())?;
    let state = serde_json::from_slice::<ServerState>(&raw).ok()?;
    let peer = state.peer(&PeerId::new(id))?;
    Some((peer.connection_attempts, peer.last_offer.clone()))
}

#[test_log::test(tokio::test(start_paused = true))]
async fn admin_resumes_stored_peers_after_restart() {
    let mesh = TestMesh::new();
    let store = PeerStore::new(MemoryBackend::new());
    preload(&store, vec![stored("client-1", 1), stored("client-2", 1)]).await;

    // client-3 was never stored and joins through presence alone
    let clients: Vec<_> = ["client-1", "client-2", "client-3"]
        .iter()
        .map(|id| mesh.start(id, Role::Client))
        .collect();
    mesh.registered(&["client-1", "client-2", "client-3"]).await;

    let node = mesh.node(ADMIN, Role::Admin, store.clone());
    let mut events = node.subscribe();
    let admin = node.start();
    for id in ["client-1", "client-2", "client-3"] {
        connected(&admin, id).await;
    }
    for client in &clients {
        connected(client, ADMIN).await;
    }

    let seen = drain(&mut events);
    assert_eq!(
        resumed(&seen),
        vec![
            (PeerId::new("client-1"), FailureReason::ConnectionLost, 1),
            (PeerId::new("client-2"), FailureReason::ConnectionLost, 1),
        ]
    );

    let state = store.load(&org()).await.unwrap().unwrap();
    assert!(state.is_active);
    for id in ["client-1", "client-2", "client-3"] {
        let peer = state.peer(&PeerId::new(id)).unwrap();
        assert_eq!(peer.connection_attempts, 0, "{id}");
    }
}

#[test_log::test(tokio::test(start_paused = true))]
async fn stale_stored_peers_are_not_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let store = PeerStore::new(FileBackend::new(dir.path()));
    preload(&store, vec![stored("client-1", 1), stored("client-2", 25)]).await;
    let path = store.backend().path_for(&org());
    assert!(path.exists());

    let mesh = TestMesh::new();
    let client = mesh.start("client-1", Role::Client);
    mesh.registered(&["client-1"]).await;

    let node = mesh.node(ADMIN, Role::Admin, store.clone());
    let mut events = node.subscribe();
    let admin = node.start();
    connected(&admin, "client-1").await;
    connected(&client, ADMIN).await;

    let seen = drain(&mut events);
    assert_eq!(
        resumed(&seen),
        vec![(PeerId::new("client-1"), FailureReason::ConnectionLost, 1)]
    );
    assert_eq!(admin.peer_status(&PeerId::new("client-2")), None);

    // the first cleanup pass rewrites the file without the stale peer
    eventually(|| {
        let Ok(bytes) = std::fs::read(&path) else {
            return false;
        };
        let Ok(state) = serde_json::from_slice::<ServerState>(&bytes) else {
            return false;
        };
        state.peer(&PeerId::new("client-2")).is_none()
            && state.peer(&PeerId::new("client-1")).is_some()
    })
    .await;

    admin.shutdown().await.unwrap();
    let state = store.load(&org()).await.unwrap().unwrap();
    assert_eq!(state.admin_id, Some(PeerId::new(ADMIN)));
    assert_eq!(state.clients.len(), 1);
}

#[test_log::test(tokio::test(start_paused = true))]
async fn resumed_peers_keep_or_refresh_their_stored_offer() {
    let mesh = TestMesh::new();
    let admin_offer = SessionDescription::offer("v=0 admin before restart");
    let client_offer = SessionDescription::offer("v=0 client before restart");

    let client_store = PeerStore::new(MemoryBackend::new());
    preload(
        &client_store,
        vec![StoredPeer {
            last_offer: Some(admin_offer.clone()),
            ..stored(ADMIN, 1)
        }],
    )
    .await;
    let node = mesh.node("client-1", Role::Client, client_store.clone());
    let mut client_events = node.subscribe();
    let client = node.start();
    mesh.registered(&["client-1"]).await;

    let admin_store = PeerStore::new(MemoryBackend::new());
    preload(
        &admin_store,
        vec![StoredPeer {
            last_offer: Some(client_offer.clone()),
            ..stored("client-1", 1)
        }],
    )
    .await;
    let admin = mesh.node(ADMIN, Role::Admin, admin_store.clone()).start();
    connected(&admin, "client-1").await;
    connected(&client, ADMIN).await;

    let seen = drain(&mut client_events);
    assert!(
        resumed(&seen).contains(&(PeerId::new(ADMIN), FailureReason::ConnectionLost, 1)),
        "{seen:?}"
    );

    // the answering side carries its stored offer through the reconnection
    eventually(|| stored_offer(&client_store, ADMIN) == Some((0, Some(admin_offer.clone())))).await;
    // the offering side replaces it with the offer that reconnected
    eventually(|| {
        matches!(
            stored_offer(&admin_store, "client-1"),
            Some((0, Some(offer))) if offer != client_offer
        )
    })
    .await;
}
