//! Conformance test suite for [`TicketBackend`] implementations.
//!
//! Every function drives a [`TicketRegistry`] over the given backend and asserts one part of
//! the registry contract. A backend that passes the suite can be swapped for any other without
//! changing registry behavior.
//!
//! # Usage
//!
//! Enable the `testutil` feature and call each function with a backend:
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use tessera_registry::{MemoryTicketBackend, conformance};
//!
//! #[tokio::test]
//! async fn lookup_missing_returns_none() {
//!     conformance::lookup_missing_returns_none(Arc::new(MemoryTicketBackend::new())).await;
//! }
//! ```
//!
//! Each function starts by clearing the backend, so one backend may be reused across calls.
//!
//! # Test Categories
//!
//! | Category | Functions | Contract aspect |
//! |----------|-----------|-----------------|
//! | Round-trip | 3 tests | Stored tickets come back equal, with and without the cipher |
//! | Lookup | 4 tests | Missing ids, kind checks, expiry on read |
//! | Write | 4 tests | Duplicate rejection, conditional update |
//! | Cascade | 5 tests | Idempotent delete, descendant removal, delete-all |
//! | Query | 4 tests | Counts, listing, unreadable records, principal lookup |
//! | Concurrent | 2 tests | Parallel adds and read-modify-write |
//! | Health | 1 test | Health check |

use std::{sync::Arc, time::Duration};

use bytes::Bytes;

use crate::{
    assert_registry_error,
    backend::{TicketBackend, TicketRecord},
    cipher::TicketCipherExecutor,
    clock::{Clock, ManualClock},
    codec::TicketCodec,
    config::RetryConfig,
    expiration::ExpirationPolicy,
    registry::{Deletion, TicketRegistry},
    testutil::{TEST_SERVICE, authentication, service_ticket, session_tree, test_registry, ticket_granting_ticket},
    ticket::{Service, ServiceTicket, Ticket, TicketGrantingTicket, TicketKind},
};

async fn fresh<B: TicketBackend + 'static>(backend: Arc<B>) -> (TicketRegistry, ManualClock) {
    let (registry, clock) = test_registry(backend);
    registry.delete_all().await.expect("clear backend before test");
    (registry, clock)
}

// ============================================================================
// Round-trip: stored tickets come back equal (3 tests)
// ============================================================================

/// A session is read back exactly as stored.
pub async fn roundtrip_ticket_granting_ticket<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, clock) = fresh(backend).await;
    let ticket = ticket_granting_ticket("TGT-roundtrip", &clock);
    registry.add_ticket(&ticket).await.expect("add");

    let stored = registry.get_ticket("TGT-roundtrip", TicketKind::TicketGranting).await.expect("get");
    assert_eq!(stored, Some(ticket));
}

/// A service ticket keeps its parent link and service.
pub async fn roundtrip_service_ticket<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, clock) = fresh(backend).await;
    let ticket = service_ticket("ST-roundtrip", "TGT-parent", &clock);
    registry.add_ticket(&ticket).await.expect("add");

    let stored = registry.get_ticket("ST-roundtrip", TicketKind::Service).await.expect("get").expect("present");
    assert_eq!(stored, ticket);
    assert_eq!(stored.granted_by(), Some("TGT-parent"));
    assert_eq!(stored.as_service().map(|st| st.service().as_str()), Some(TEST_SERVICE));
}

/// With the cipher enabled, tickets still round-trip and the backend never sees the raw id.
pub async fn roundtrip_with_cipher<B: TicketBackend + 'static>(backend: Arc<B>) {
    let clock = ManualClock::default();
    let registry = TicketRegistry::builder()
        .backend(Arc::clone(&backend) as Arc<dyn TicketBackend>)
        .codec(TicketCodec::new(Arc::new(TicketCipherExecutor::generate())))
        .clock(Arc::new(clock.clone()))
        .retry(RetryConfig::disabled())
        .build();
    registry.delete_all().await.expect("clear");

    let ticket = ticket_granting_ticket("TGT-sealed", &clock);
    registry.add_ticket(&ticket).await.expect("add");

    assert_eq!(registry.find_ticket("TGT-sealed").await.expect("find"), Some(ticket));
    let records = backend.scan().await.expect("scan");
    assert_eq!(records.len(), 1);
    assert_ne!(records[0].key, "TGT-sealed", "key must be the digest");
    let payload = String::from_utf8_lossy(&records[0].payload);
    assert!(!payload.contains("casuser"), "payload must not expose the principal");
}

// ============================================================================
// Lookup: missing ids, kind checks, expiry on read (4 tests)
// ============================================================================

/// Unknown and empty ids resolve to `None`, not an error.
pub async fn lookup_missing_returns_none<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, _clock) = fresh(backend).await;
    assert_eq!(registry.get_ticket("TGT-missing", TicketKind::TicketGranting).await.expect("get"), None);
    assert_eq!(registry.find_ticket("").await.expect("find empty"), None);
}

/// Asking for the wrong kind is a type mismatch.
pub async fn lookup_kind_mismatch_is_error<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, clock) = fresh(backend).await;
    registry.add_ticket(&service_ticket("ST-kind", "TGT-parent", &clock)).await.expect("add");

    let result = registry.get_ticket("ST-kind", TicketKind::TicketGranting).await;
    assert_registry_error!(result, TicketTypeMismatch);
}

/// Proxy tickets satisfy a service-ticket lookup; proxy-granting tickets satisfy a session
/// lookup.
pub async fn lookup_accepts_proxy_kinds<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, _clock) = fresh(backend).await;
    let tree = session_tree(&registry, "TGT-proxy", 0, 1).await;

    let pt = registry.get_ticket(&tree.proxies[0], TicketKind::Service).await.expect("get proxy ticket");
    assert_eq!(pt.map(|t| t.kind()), Some(TicketKind::Proxy));
    let pgt_id = tree.proxy_granting.expect("proxy-granting ticket");
    let pgt = registry.get_ticket(&pgt_id, TicketKind::TicketGranting).await.expect("get pgt");
    assert_eq!(pgt.map(|t| t.kind()), Some(TicketKind::ProxyGranting));
}

/// `MultiUseOrTimeout(1, 60s)` is valid when issued, gone after one use, and gone after 61
/// seconds without use.
pub async fn lookup_hides_expired_tickets<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, clock) = fresh(backend).await;
    let policy = ExpirationPolicy::single_use(Duration::from_secs(60));
    let service = Service::from(TEST_SERVICE);

    let used: Ticket = ServiceTicket::new("ST-used", "TGT-1", service.clone(), false, policy, clock.now()).into();
    let idle: Ticket = ServiceTicket::new("ST-idle", "TGT-1", service, false, policy, clock.now()).into();
    registry.add_ticket(&used).await.expect("add used");
    registry.add_ticket(&idle).await.expect("add idle");
    assert!(registry.find_ticket("ST-used").await.expect("find").is_some(), "valid at creation");

    let consumed = registry
        .update_with("ST-used", TicketKind::Service, |ticket| {
            ticket.record_use(clock.now());
            Ok(())
        })
        .await
        .expect("record use");
    assert!(consumed.is_some());
    assert_eq!(registry.find_ticket("ST-used").await.expect("find"), None, "expired after one use");

    clock.advance(Duration::from_secs(61));
    assert_eq!(registry.find_ticket("ST-idle").await.expect("find"), None, "expired after timeout");
    assert!(registry.get_tickets().await.expect("list").is_empty(), "expired tickets are removed on read");
}

// ============================================================================
// Write: duplicate rejection, conditional update (4 tests)
// ============================================================================

/// A second add of the same id fails; a fresh id succeeds.
pub async fn add_duplicate_is_rejected<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, clock) = fresh(backend).await;
    registry.add_ticket(&ticket_granting_ticket("TGT-dup", &clock)).await.expect("first add");

    let result = registry.add_ticket(&ticket_granting_ticket("TGT-dup", &clock)).await;
    assert_registry_error!(result, DuplicateTicket);
    registry.add_ticket(&ticket_granting_ticket("TGT-dup-2", &clock)).await.expect("fresh id");
}

/// The rejected duplicate leaves the original untouched.
pub async fn add_duplicate_keeps_original<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, clock) = fresh(backend).await;
    let original: Ticket =
        TicketGrantingTicket::new("TGT-keep", authentication("alice"), ExpirationPolicy::NeverExpires, clock.now()).into();
    registry.add_ticket(&original).await.expect("add");

    let impostor: Ticket =
        TicketGrantingTicket::new("TGT-keep", authentication("mallory"), ExpirationPolicy::NeverExpires, clock.now())
            .into();
    assert!(registry.add_ticket(&impostor).await.is_err());
    assert_eq!(registry.find_ticket("TGT-keep").await.expect("find"), Some(original));
}

/// `update_ticket` replaces a stored ticket.
pub async fn update_replaces_existing<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, clock) = fresh(backend).await;
    let mut ticket = ticket_granting_ticket("TGT-update", &clock);
    registry.add_ticket(&ticket).await.expect("add");

    clock.advance(Duration::from_secs(5));
    ticket.record_use(clock.now());
    assert!(registry.update_ticket(&ticket).await.expect("update"));

    let stored = registry.find_ticket("TGT-update").await.expect("find").expect("present");
    assert_eq!(stored.state().count_of_uses(), 1);
    assert_eq!(stored, ticket);
}

/// `update_ticket` of an absent ticket writes nothing.
pub async fn update_missing_returns_false<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, clock) = fresh(backend).await;
    let ticket = ticket_granting_ticket("TGT-ghost", &clock);
    assert!(!registry.update_ticket(&ticket).await.expect("update"));
    assert_eq!(registry.find_ticket("TGT-ghost").await.expect("find"), None, "update must not create");
}

// ============================================================================
// Cascade: idempotent delete, descendant removal, delete-all (5 tests)
// ============================================================================

/// Two deletes yield deleted then not-found, neither an error.
pub async fn delete_is_idempotent<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, clock) = fresh(backend).await;
    registry.add_ticket(&service_ticket("ST-twice", "TGT-parent", &clock)).await.expect("add");

    let first = registry.delete_ticket("ST-twice").await.expect("first delete");
    assert!(matches!(first, Deletion::Deleted { removed: 1 }), "got {first:?}");
    let second = registry.delete_ticket("ST-twice").await.expect("second delete");
    assert!(matches!(second, Deletion::NotFound), "got {second:?}");
}

/// Deleting a session with 3 service tickets and a proxy-granting ticket carrying 2 proxy
/// tickets leaves none of the 7 reachable.
pub async fn delete_cascades_to_descendants<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, _clock) = fresh(backend).await;
    let tree = session_tree(&registry, "TGT-tree", 3, 2).await;
    let unrelated = session_tree(&registry, "TGT-other", 1, 0).await;

    let deletion = registry.delete_ticket(&tree.root).await.expect("delete");
    assert_eq!(deletion.removed(), 7, "got {deletion:?}");

    for id in tree.descendants().iter().chain(std::iter::once(&tree.root)) {
        assert_eq!(registry.find_ticket(id).await.expect("find"), None, "{id} survived the cascade");
    }
    assert!(registry.find_ticket(&unrelated.root).await.expect("find").is_some());
    assert!(registry.find_ticket(&unrelated.services[0]).await.expect("find").is_some());
}

/// A session `TGT-abc` with `ST-1` for the app: the service ticket resolves to its parent and
/// disappears with it.
pub async fn delete_session_removes_its_service_ticket<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, clock) = fresh(backend).await;
    let mut tgt = ticket_granting_ticket("TGT-abc", &clock);
    if let Some(granting) = tgt.as_granting_mut() {
        granting.grant_service_ticket("ST-1", Service::from(TEST_SERVICE), clock.now());
    }
    registry.add_ticket(&tgt).await.expect("add session");
    registry.add_ticket(&service_ticket("ST-1", "TGT-abc", &clock)).await.expect("add service ticket");

    let st = registry.get_ticket("ST-1", TicketKind::Service).await.expect("get").expect("present");
    let parent = registry.find_ticket(st.granted_by().expect("parent")).await.expect("find parent");
    assert_eq!(parent.as_ref().map(Ticket::id), Some("TGT-abc"));

    assert!(registry.delete_ticket("TGT-abc").await.expect("delete").is_deleted());
    assert_eq!(registry.find_ticket("ST-1").await.expect("find"), None);
}

/// Children already gone do not fail the cascade.
pub async fn delete_tolerates_missing_children<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, _clock) = fresh(backend).await;
    let tree = session_tree(&registry, "TGT-partial", 2, 0).await;
    assert!(registry.delete_ticket(&tree.services[0]).await.expect("delete child").is_deleted());

    let deletion = registry.delete_ticket(&tree.root).await.expect("delete session");
    assert!(matches!(deletion, Deletion::Deleted { removed: 2 }), "got {deletion:?}");
}

/// `delete_all` removes every ticket and reports how many.
pub async fn delete_all_removes_everything<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, _clock) = fresh(backend).await;
    session_tree(&registry, "TGT-all-1", 2, 1).await;
    session_tree(&registry, "TGT-all-2", 1, 0).await;

    assert_eq!(registry.delete_all().await.expect("delete all"), 7);
    assert!(registry.get_tickets().await.expect("list").is_empty());
    assert_eq!(registry.delete_all().await.expect("delete all again"), 0);
}

// ============================================================================
// Query: counts, listing, principal lookup (3 tests)
// ============================================================================

/// Counts, where supported, separate sessions from service and proxy tickets.
pub async fn counts_by_kind<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, _clock) = fresh(backend).await;
    session_tree(&registry, "TGT-count-1", 2, 1).await;
    session_tree(&registry, "TGT-count-2", 1, 0).await;

    if let Some(sessions) = registry.session_count().await.expect("session count") {
        assert_eq!(sessions, 2, "proxy-granting tickets are not sessions");
    }
    if let Some(services) = registry.service_ticket_count().await.expect("service count") {
        assert_eq!(services, 4, "proxy tickets count as service tickets");
    }
}

/// Listing returns every stored ticket, optionally filtered.
pub async fn list_returns_all_tickets<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, _clock) = fresh(backend).await;
    let tree = session_tree(&registry, "TGT-list", 2, 1).await;

    let mut ids: Vec<String> = registry.get_tickets().await.expect("list").iter().map(|t| t.id().to_owned()).collect();
    ids.sort();
    let mut expected = tree.descendants();
    expected.push(tree.root.clone());
    expected.sort();
    assert_eq!(ids, expected);

    let services = registry.get_tickets_matching(|t| t.kind() == TicketKind::Service).await.expect("filter");
    assert_eq!(services.len(), 2);
}

/// Listing skips records that cannot be decoded instead of failing.
pub async fn list_skips_unreadable_records<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, clock) = fresh(Arc::clone(&backend)).await;
    registry.add_ticket(&ticket_granting_ticket("TGT-readable", &clock)).await.expect("add");
    registry.add_ticket(&service_ticket("ST-readable", "TGT-readable", &clock)).await.expect("add");
    backend
        .insert(TicketRecord {
            key: "TGT-garbled".to_owned(),
            kind: TicketKind::TicketGranting,
            parent_key: None,
            principal_key: None,
            expires_at: None,
            payload: Bytes::from_static(b"\x00not a ticket"),
        })
        .await
        .expect("plant unreadable record");

    let mut ids: Vec<String> = registry.get_tickets().await.expect("list").iter().map(|t| t.id().to_owned()).collect();
    ids.sort();
    assert_eq!(ids, vec!["ST-readable", "TGT-readable"]);

    let sessions = registry.get_tickets_matching(|t| t.kind() == TicketKind::TicketGranting).await.expect("filter");
    assert_eq!(sessions.len(), 1);
    assert_eq!(registry.find_ticket("TGT-garbled").await.expect("find"), None, "unreadable records read as missing");
}

/// Sessions are found and revoked by principal.
pub async fn sessions_by_principal<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, clock) = fresh(backend).await;
    for (id, principal) in [("TGT-p1", "alice"), ("TGT-p2", "alice"), ("TGT-p3", "bob")] {
        let ticket: Ticket =
            TicketGrantingTicket::new(id, authentication(principal), ExpirationPolicy::NeverExpires, clock.now()).into();
        registry.add_ticket(&ticket).await.expect("add");
    }

    assert_eq!(registry.count_sessions_for("alice").await.expect("count"), 2);
    assert_eq!(registry.count_sessions_for("nobody").await.expect("count"), 0);
    assert_eq!(registry.delete_sessions_for("alice").await.expect("delete"), 2);
    assert_eq!(registry.count_sessions_for("alice").await.expect("count"), 0);
    assert!(registry.find_ticket("TGT-p3").await.expect("find").is_some());
}

// ============================================================================
// Concurrent: parallel adds and read-modify-write (2 tests)
// ============================================================================

/// Parallel adds of distinct ids all land.
pub async fn concurrent_adds_all_land<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, clock) = fresh(backend).await;
    let registry = Arc::new(registry);

    let mut handles = Vec::new();
    for task in 0..8 {
        let registry = Arc::clone(&registry);
        let clock = clock.clone();
        handles.push(tokio::spawn(async move {
            for i in 0..10 {
                let ticket = ticket_granting_ticket(&format!("TGT-c{task}-{i}"), &clock);
                registry.add_ticket(&ticket).await.expect("concurrent add");
            }
        }));
    }
    for handle in handles {
        handle.await.expect("task panicked");
    }
    assert_eq!(registry.get_tickets().await.expect("list").len(), 80);
}

/// Concurrent `update_with` calls on one ticket do not lose updates.
pub async fn concurrent_updates_are_serialized<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, clock) = fresh(backend).await;
    let registry = Arc::new(registry);
    registry.add_ticket(&ticket_granting_ticket("TGT-rmw", &clock)).await.expect("add");

    let mut handles = Vec::new();
    for i in 0..16 {
        let registry = Arc::clone(&registry);
        let now = clock.now();
        handles.push(tokio::spawn(async move {
            registry
                .update_with("TGT-rmw", TicketKind::TicketGranting, move |ticket| {
                    if let Some(granting) = ticket.as_granting_mut() {
                        granting.grant_service_ticket(format!("ST-rmw-{i}"), Service::from(TEST_SERVICE), now);
                    }
                    Ok(())
                })
                .await
                .expect("update")
        }));
    }
    for handle in handles {
        assert!(handle.await.expect("task panicked").is_some());
    }

    let stored = registry.find_ticket("TGT-rmw").await.expect("find").expect("present");
    assert_eq!(stored.as_granting().map(|g| g.services().len()), Some(16));
    assert_eq!(stored.state().count_of_uses(), 16);
}

// ============================================================================
// Health (1 test)
// ============================================================================

/// A working backend reports healthy.
pub async fn health_check_succeeds<B: TicketBackend + 'static>(backend: Arc<B>) {
    let (registry, _clock) = fresh(backend).await;
    registry.health_check().await.expect("healthy backend");
}

// ============================================================================
// Convenience runner
// ============================================================================

/// Runs the full suite against one backend.
///
/// ```no_run
/// use std::sync::Arc;
/// use tessera_registry::{MemoryTicketBackend, conformance};
///
/// #[tokio::test]
/// async fn memory_backend_conformance() {
///     conformance::run_all(Arc::new(MemoryTicketBackend::new())).await;
/// }
/// ```
pub async fn run_all<B: TicketBackend + 'static>(backend: Arc<B>) {
    // Round-trip
    roundtrip_ticket_granting_ticket(Arc::clone(&backend)).await;
    roundtrip_service_ticket(Arc::clone(&backend)).await;
    roundtrip_with_cipher(Arc::clone(&backend)).await;

    // Lookup
    lookup_missing_returns_none(Arc::clone(&backend)).await;
    lookup_kind_mismatch_is_error(Arc::clone(&backend)).await;
    lookup_accepts_proxy_kinds(Arc::clone(&backend)).await;
    lookup_hides_expired_tickets(Arc::clone(&backend)).await;

    // Write
    add_duplicate_is_rejected(Arc::clone(&backend)).await;
    add_duplicate_keeps_original(Arc::clone(&backend)).await;
    update_replaces_existing(Arc::clone(&backend)).await;
    update_missing_returns_false(Arc::clone(&backend)).await;

    // Cascade
    delete_is_idempotent(Arc::clone(&backend)).await;
    delete_cascades_to_descendants(Arc::clone(&backend)).await;
    delete_session_removes_its_service_ticket(Arc::clone(&backend)).await;
    delete_tolerates_missing_children(Arc::clone(&backend)).await;
    delete_all_removes_everything(Arc::clone(&backend)).await;

    // Query
    counts_by_kind(Arc::clone(&backend)).await;
    list_returns_all_tickets(Arc::clone(&backend)).await;
    list_skips_unreadable_records(Arc::clone(&backend)).await;
    sessions_by_principal(Arc::clone(&backend)).await;

    // Concurrent
    concurrent_adds_all_land(Arc::clone(&backend)).await;
    concurrent_updates_are_serialized(Arc::clone(&backend)).await;

    // Health
    health_check_succeeds(backend).await;
}
