//! Two registry nodes sharing an in-process bus.
//!
//! Each node stores tickets in its own memory backend; writes on one must become visible on
//! the other, and a node must never re-apply its own events.

#![allow(clippy::expect_used, clippy::panic)]

use std::{future::Future, sync::Arc, time::Duration};

use tessera_registry::{
    CipherConfig, MemoryTicketBackend, RegistryConfig, RegistryMetrics, Service, SystemClock, TicketBackend,
    TicketIssuer, TicketKind, TicketRegistry,
    cipher::generate_base64_keys,
    config::ReplicationConfig,
    replication::{BroadcastBus, MessageBus, ReplicationNode},
    testutil::authentication,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

struct Node {
    registry: Arc<TicketRegistry>,
    issuer: TicketIssuer,
    local: Arc<MemoryTicketBackend>,
    metrics: RegistryMetrics,
    _listener: JoinHandle<()>,
}

fn node(name: &str, bus: &Arc<BroadcastBus>, cancel: &CancellationToken, config: &RegistryConfig) -> Node {
    let metrics = RegistryMetrics::new();
    let replication = ReplicationConfig::builder().enabled(true).node_id(name).build();
    let node = ReplicationNode::from_config(&replication, metrics.clone());
    let local = Arc::new(MemoryTicketBackend::new());

    let listener = Arc::new(node.listener(local.clone())).spawn(bus.as_ref(), cancel.clone());
    let bus: Arc<dyn MessageBus> = bus.clone();
    let registry = Arc::new(
        TicketRegistry::from_config(config, Arc::new(node.publisher(Arc::clone(&local), bus)), Arc::new(SystemClock))
            .expect("valid config"),
    );
    let issuer = TicketIssuer::builder().registry(Arc::clone(&registry)).build();
    Node { registry, issuer, local, metrics, _listener: listener }
}

fn pair(config: &RegistryConfig) -> (Node, Node, CancellationToken) {
    let bus = Arc::new(BroadcastBus::default());
    let cancel = CancellationToken::new();
    let a = node("node-a", &bus, &cancel, config);
    let b = node("node-b", &bus, &cancel, config);
    (a, b, cancel)
}

/// Polls `check` until it holds, for up to two seconds.
async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..400 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_created_on_one_node_is_visible_on_the_other() {
    let (a, b, cancel) = pair(&RegistryConfig::default());

    let tgt = a.issuer.create_ticket_granting_ticket(authentication("casuser")).await.expect("create");
    let id = tgt.id().to_owned();

    eventually("session on node b", || {
        let registry = Arc::clone(&b.registry);
        let id = id.clone();
        async move { registry.get_ticket(&id, TicketKind::TicketGranting).await.expect("get").is_some() }
    })
    .await;

    let replica = b.registry.get_ticket(&id, TicketKind::TicketGranting).await.expect("get").expect("replica");
    assert_eq!(replica.as_granting().expect("granting").authentication().principal.id, "casuser");
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn grant_update_and_logout_propagate() {
    let (a, b, cancel) = pair(&RegistryConfig::default());
    let service = Service::from("https://app.example.org");

    let tgt = a.issuer.create_ticket_granting_ticket(authentication("casuser")).await.expect("create");
    let st = a.issuer.grant_service_ticket(tgt.id(), service.clone(), true).await.expect("grant");
    let (tgt_id, st_id) = (tgt.id().to_owned(), st.id().to_owned());

    // The session update recording the grant reaches node b.
    eventually("grant recorded on node b", || {
        let registry = Arc::clone(&b.registry);
        let (tgt_id, st_id) = (tgt_id.clone(), st_id.clone());
        async move {
            registry
                .find_ticket(&tgt_id)
                .await
                .expect("find")
                .and_then(|t| t.as_granting().map(|g| g.services().contains_key(&st_id)))
                .unwrap_or(false)
        }
    })
    .await;

    // Logging out on node b removes the whole tree on node a.
    let deletion = b.registry.delete_ticket(&tgt_id).await.expect("logout");
    assert_eq!(deletion.removed(), 2);

    eventually("logout applied on node a", || {
        let local = Arc::clone(&a.local);
        async move { local.is_empty() }
    })
    .await;
    assert!(a.registry.find_ticket(&st_id).await.expect("find").is_none());
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_all_propagates() {
    let (a, b, cancel) = pair(&RegistryConfig::default());
    for principal in ["alice", "bob", "carol"] {
        a.issuer.create_ticket_granting_ticket(authentication(principal)).await.expect("create");
    }
    eventually("sessions on node b", || {
        let local = Arc::clone(&b.local);
        async move { local.len() == 3 }
    })
    .await;

    b.registry.delete_all().await.expect("delete_all");
    eventually("clear applied on node a", || {
        let local = Arc::clone(&a.local);
        async move { local.is_empty() }
    })
    .await;
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nodes_ignore_their_own_events() {
    let (a, b, cancel) = pair(&RegistryConfig::default());
    a.issuer.create_ticket_granting_ticket(authentication("casuser")).await.expect("create");

    eventually("event applied on node b", || {
        let metrics = b.metrics.clone();
        async move { metrics.snapshot().events_applied == 1 }
    })
    .await;
    eventually("echo ignored on node a", || {
        let metrics = a.metrics.clone();
        async move { metrics.snapshot().events_ignored == 1 }
    })
    .await;

    let a_snapshot = a.metrics.snapshot();
    assert_eq!(a_snapshot.events_published, 1);
    assert_eq!(a_snapshot.events_applied, 0);
    assert_eq!(b.metrics.snapshot().events_published, 0, "applying an event publishes nothing");
    cancel.cancel();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn encrypted_tickets_replicate_between_nodes_sharing_keys() {
    let (encryption, signing) = generate_base64_keys();
    let config = RegistryConfig::builder()
        .cipher(CipherConfig::builder().enabled(true).encryption_key(encryption).signing_key(signing).build())
        .build()
        .expect("valid config");
    let (a, b, cancel) = pair(&config);

    let tgt = a.issuer.create_ticket_granting_ticket(authentication("casuser")).await.expect("create");
    let id = tgt.id().to_owned();
    eventually("encrypted session on node b", || {
        let registry = Arc::clone(&b.registry);
        let id = id.clone();
        async move { registry.find_ticket(&id).await.expect("find").is_some() }
    })
    .await;

    assert!(b.local.get(&id).await.expect("get").is_none(), "replica is stored under the digest");
    cancel.cancel();
}
