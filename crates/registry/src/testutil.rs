//! Shared test utilities for registry and backend tests.
//!
//! Feature-gated behind `testutil` so fixtures never reach production builds.
//!
//! ```toml
//! [dev-dependencies]
//! tessera-registry = { path = "../registry", features = ["testutil"] }
//! ```
//!
//! ```no_run
//! // Requires the `testutil` feature to be enabled.
//! use tessera_registry::testutil::{session_tree, test_registry};
//! ```

use std::{collections::HashSet, fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{
    MemoryTicketBackend,
    backend::{CascadeRemoval, TicketBackend, TicketRecord},
    clock::{Clock, ManualClock},
    config::RetryConfig,
    error::{StorageError, StorageResult},
    expiration::ExpirationPolicy,
    registry::TicketRegistry,
    ticket::{Authentication, Principal, Service, ServiceTicket, Ticket, TicketGrantingTicket, TicketKind},
};

/// Default service used by fixtures.
pub const TEST_SERVICE: &str = "https://app.example.org";

/// An authentication for `principal`.
#[must_use]
pub fn authentication(principal: &str) -> Authentication {
    Authentication::builder().principal(Principal::new(principal)).build()
}

/// A never-expiring session for `casuser`.
#[must_use]
pub fn ticket_granting_ticket(id: &str, clock: &dyn Clock) -> Ticket {
    TicketGrantingTicket::new(id, authentication("casuser"), ExpirationPolicy::NeverExpires, clock.now()).into()
}

/// A never-expiring service ticket for [`TEST_SERVICE`] issued by `parent`.
#[must_use]
pub fn service_ticket(id: &str, parent: &str, clock: &dyn Clock) -> Ticket {
    ServiceTicket::new(id, parent, Service::from(TEST_SERVICE), false, ExpirationPolicy::NeverExpires, clock.now())
        .into()
}

/// A registry over `backend` driven by a [`ManualClock`], with retries disabled and a short
/// operation timeout.
#[must_use]
pub fn test_registry(backend: Arc<dyn TicketBackend>) -> (TicketRegistry, ManualClock) {
    let clock = ManualClock::default();
    let registry = TicketRegistry::builder()
        .backend(backend)
        .clock(Arc::new(clock.clone()))
        .retry(RetryConfig::disabled())
        .operation_timeout(Duration::from_secs(2))
        .build();
    (registry, clock)
}

/// A registry over a fresh [`MemoryTicketBackend`].
#[must_use]
pub fn memory_registry() -> (TicketRegistry, ManualClock, MemoryTicketBackend) {
    let backend = MemoryTicketBackend::new();
    let (registry, clock) = test_registry(Arc::new(backend.clone()));
    (registry, clock, backend)
}

/// Ids created by [`session_tree`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionTree {
    /// The session id.
    pub root: String,
    /// Service tickets issued by the session.
    pub services: Vec<String>,
    /// The proxy-granting ticket issued from the first service ticket.
    pub proxy_granting: Option<String>,
    /// Proxy tickets issued by the proxy-granting ticket.
    pub proxies: Vec<String>,
}

impl SessionTree {
    /// Every id except the root.
    #[must_use]
    pub fn descendants(&self) -> Vec<String> {
        self.services.iter().chain(self.proxy_granting.iter()).chain(self.proxies.iter()).cloned().collect()
    }
}

/// Stores a session `root` with `services` service tickets and, if `proxies > 0`, one
/// proxy-granting ticket carrying `proxies` proxy tickets.
///
/// Ids are derived from `root` (`ST-<root>-0`, `PGT-<root>`, `PT-<root>-0`, ...).
///
/// # Panics
///
/// Panics if any ticket cannot be stored.
pub async fn session_tree(registry: &TicketRegistry, root: &str, services: usize, proxies: usize) -> SessionTree {
    let now = registry.clock().now();
    let suffix = root.trim_start_matches("TGT-");
    let service = Service::from(TEST_SERVICE);

    let mut tgt = TicketGrantingTicket::new(root, authentication("casuser"), ExpirationPolicy::NeverExpires, now);
    let mut tree = SessionTree { root: root.to_owned(), services: Vec::new(), proxy_granting: None, proxies: Vec::new() };

    for i in 0..services {
        let id = format!("ST-{suffix}-{i}");
        tgt.grant_service_ticket(id.as_str(), service.clone(), now);
        registry.add_ticket(&service_ticket(&id, root, registry.clock().as_ref())).await.expect("add service ticket");
        tree.services.push(id);
    }

    if proxies > 0 {
        let pgt_id = format!("PGT-{suffix}");
        let mut pgt = TicketGrantingTicket::new_proxy_granting(
            pgt_id.as_str(),
            authentication("casuser"),
            root,
            Service::from("https://proxy.example.org/callback"),
            ExpirationPolicy::NeverExpires,
            now,
        );
        for i in 0..proxies {
            let id = format!("PT-{suffix}-{i}");
            pgt.grant_service_ticket(id.as_str(), service.clone(), now);
            let pt = ServiceTicket::new_proxy(id.as_str(), pgt_id.as_str(), service.clone(), ExpirationPolicy::NeverExpires, now);
            registry.add_ticket(&pt.into()).await.expect("add proxy ticket");
            tree.proxies.push(id);
        }
        registry.add_ticket(&pgt.into()).await.expect("add proxy-granting ticket");
        tgt.add_proxy_granting_ticket(pgt_id.as_str());
        tree.proxy_granting = Some(pgt_id);
    }

    registry.add_ticket(&tgt.into()).await.expect("add session");
    tree
}

/// Backend decorator that fails selected operations on demand.
///
/// Keys given to [`fail_key`](Self::fail_key) fail on every per-key operation, including
/// inside [`remove_cascade`](TicketBackend::remove_cascade). [`set_unavailable`](Self::set_unavailable)
/// fails everything with a transient connection error.
pub struct FaultyBackend<B> {
    inner: B,
    failing_keys: Mutex<HashSet<String>>,
    unavailable: Mutex<bool>,
}

impl<B: TicketBackend> FaultyBackend<B> {
    /// Wraps `inner` with no faults armed.
    #[must_use]
    pub fn new(inner: B) -> Self {
        Self { inner, failing_keys: Mutex::new(HashSet::new()), unavailable: Mutex::new(false) }
    }

    /// Makes every operation on `key` fail.
    pub fn fail_key(&self, key: impl Into<String>) {
        self.failing_keys.lock().insert(key.into());
    }

    /// Toggles whole-backend failure.
    pub fn set_unavailable(&self, unavailable: bool) {
        *self.unavailable.lock() = unavailable;
    }

    /// The wrapped backend.
    #[must_use]
    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn check(&self, key: Option<&str>) -> StorageResult<()> {
        if *self.unavailable.lock() {
            return Err(StorageError::connection("injected outage"));
        }
        if let Some(key) = key
            && self.failing_keys.lock().contains(key)
        {
            return Err(StorageError::internal(format!("injected failure for {key}")));
        }
        Ok(())
    }
}

impl<B: fmt::Debug> fmt::Debug for FaultyBackend<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FaultyBackend").field("inner", &self.inner).finish_non_exhaustive()
    }
}

#[async_trait]
impl<B: TicketBackend> TicketBackend for FaultyBackend<B> {
    fn name(&self) -> &'static str {
        "faulty"
    }

    async fn insert(&self, record: TicketRecord) -> StorageResult<()> {
        self.check(Some(&record.key))?;
        self.inner.insert(record).await
    }

    async fn update(&self, record: TicketRecord) -> StorageResult<bool> {
        self.check(Some(&record.key))?;
        self.inner.update(record).await
    }

    async fn upsert(&self, record: TicketRecord) -> StorageResult<()> {
        self.check(Some(&record.key))?;
        self.inner.upsert(record).await
    }

    async fn get(&self, key: &str) -> StorageResult<Option<TicketRecord>> {
        self.check(Some(key))?;
        self.inner.get(key).await
    }

    async fn remove(&self, key: &str) -> StorageResult<bool> {
        self.check(Some(key))?;
        self.inner.remove(key).await
    }

    async fn remove_cascade(&self, descendants: &[String], parent: &str) -> CascadeRemoval {
        let mut results = Vec::with_capacity(descendants.len());
        for key in descendants {
            results.push((key.clone(), self.remove(key).await));
        }
        CascadeRemoval { descendants: results, parent: self.remove(parent).await }
    }

    async fn scan(&self) -> StorageResult<Vec<TicketRecord>> {
        self.check(None)?;
        self.inner.scan().await
    }

    async fn clear(&self) -> StorageResult<u64> {
        self.check(None)?;
        self.inner.clear().await
    }

    async fn count(&self, kind: TicketKind) -> StorageResult<Option<u64>> {
        self.check(None)?;
        self.inner.count(kind).await
    }

    async fn find_by_principal(&self, principal_key: &str) -> StorageResult<Vec<TicketRecord>> {
        self.check(None)?;
        self.inner.find_by_principal(principal_key).await
    }

    async fn remove_expired(&self, now: DateTime<Utc>) -> StorageResult<Option<u64>> {
        self.check(None)?;
        self.inner.remove_expired(now).await
    }

    async fn health_check(&self) -> StorageResult<()> {
        self.check(None)?;
        self.inner.health_check().await
    }
}

/// Assert that a [`RegistryResult`](crate::RegistryResult) is an error of the given
/// [`RegistryError`](crate::RegistryError) variant.
///
/// ```no_run
/// // Requires the `testutil` feature to be enabled.
/// use tessera_registry::{RegistryError, RegistryResult, assert_registry_error};
///
/// let result: RegistryResult<()> = Err(RegistryError::DuplicateTicket { id: "TGT-1".into() });
/// assert_registry_error!(result, DuplicateTicket);
/// ```
#[macro_export]
macro_rules! assert_registry_error {
    ($result:expr, $variant:ident) => {
        assert!(
            matches!($result, Err($crate::error::RegistryError::$variant { .. })),
            "expected RegistryError::{}, got: {:?}",
            stringify!($variant),
            $result,
        );
    };
    ($result:expr, $variant:ident, $msg:expr) => {
        assert!(
            matches!($result, Err($crate::error::RegistryError::$variant { .. })),
            "{}: expected RegistryError::{}, got: {:?}",
            $msg,
            stringify!($variant),
            $result,
        );
    };
}

/// Assert that a [`RegistryResult`](crate::RegistryResult) is
/// [`RegistryError::Unavailable`](crate::RegistryError::Unavailable), optionally for a given
/// operation name.
#[macro_export]
macro_rules! assert_unavailable {
    ($result:expr) => {
        assert!(
            matches!($result, Err($crate::error::RegistryError::Unavailable { .. })),
            "expected RegistryError::Unavailable, got: {:?}",
            $result,
        );
    };
    ($result:expr, $operation:expr) => {
        assert!(
            matches!($result, Err($crate::error::RegistryError::Unavailable { operation, .. }) if operation == $operation),
            "expected RegistryError::Unavailable for {}, got: {:?}",
            $operation,
            $result,
        );
    };
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::{RegistryError, RegistryResult};

    #[tokio::test]
    async fn session_tree_links_children() {
        let (registry, _clock, backend) = memory_registry();
        let tree = session_tree(&registry, "TGT-a", 2, 1).await;

        assert_eq!(tree.services, vec!["ST-a-0", "ST-a-1"]);
        assert_eq!(tree.proxy_granting.as_deref(), Some("PGT-a"));
        assert_eq!(tree.descendants().len(), 4);
        assert_eq!(backend.len(), 5);

        let root = registry.find_ticket("TGT-a").await.unwrap().unwrap();
        let granting = root.as_granting().unwrap();
        assert_eq!(granting.services().len(), 2);
        assert!(granting.proxy_granting_tickets().contains("PGT-a"));
    }

    #[tokio::test]
    async fn faulty_backend_injects_failures() {
        let faulty = FaultyBackend::new(MemoryTicketBackend::new());
        faulty.fail_key("ST-1");
        assert!(faulty.get("ST-1").await.is_err());
        assert!(faulty.get("ST-2").await.unwrap().is_none());

        faulty.set_unavailable(true);
        assert!(faulty.get("ST-2").await.unwrap_err().is_transient());
    }

    #[test]
    fn registry_error_macros() {
        let duplicate: RegistryResult<()> = Err(RegistryError::DuplicateTicket { id: "TGT-1".into() });
        assert_registry_error!(duplicate, DuplicateTicket);

        let unavailable: RegistryResult<()> = Err(RegistryError::unavailable("get", StorageError::timeout()));
        assert_unavailable!(unavailable);
        assert_unavailable!(unavailable, "get");
    }
}
