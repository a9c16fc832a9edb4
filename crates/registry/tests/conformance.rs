//! Conformance suite run against every backend shipped in this crate.
//!
//! Each backend gets one test per conformance check for fine-grained failure reporting, plus a
//! `run_all` test that reuses a single backend across the whole suite.

#![allow(clippy::expect_used, clippy::panic)]

use std::sync::Arc;

use tessera_registry::{
    MemoryTicketBackend, RegistryMetrics, conformance,
    kv::{KeyValueTicketBackend, MemoryKeyValueStore},
    replication::{BroadcastBus, PublishedEvents, PublisherIdentifier, ReplicatingBackend},
};

fn memory() -> Arc<MemoryTicketBackend> {
    Arc::new(MemoryTicketBackend::new())
}

fn key_value() -> Arc<KeyValueTicketBackend<MemoryKeyValueStore>> {
    Arc::new(KeyValueTicketBackend::new(MemoryKeyValueStore::new()))
}

fn replicating() -> Arc<ReplicatingBackend<MemoryTicketBackend>> {
    Arc::new(ReplicatingBackend::new(
        MemoryTicketBackend::new(),
        Arc::new(BroadcastBus::default()),
        PublisherIdentifier::random(),
        PublishedEvents::new(1_000, std::time::Duration::from_secs(60)),
        RegistryMetrics::new(),
    ))
}

macro_rules! conformance_tests {
    ($module:ident, $factory:ident) => {
        mod $module {
            use super::*;

            #[tokio::test]
            async fn roundtrip_ticket_granting_ticket() {
                conformance::roundtrip_ticket_granting_ticket($factory()).await;
            }

            #[tokio::test]
            async fn roundtrip_service_ticket() {
                conformance::roundtrip_service_ticket($factory()).await;
            }

            #[tokio::test]
            async fn roundtrip_with_cipher() {
                conformance::roundtrip_with_cipher($factory()).await;
            }

            #[tokio::test]
            async fn lookup_missing_returns_none() {
                conformance::lookup_missing_returns_none($factory()).await;
            }

            #[tokio::test]
            async fn lookup_kind_mismatch_is_error() {
                conformance::lookup_kind_mismatch_is_error($factory()).await;
            }

            #[tokio::test]
            async fn lookup_accepts_proxy_kinds() {
                conformance::lookup_accepts_proxy_kinds($factory()).await;
            }

            #[tokio::test]
            async fn lookup_hides_expired_tickets() {
                conformance::lookup_hides_expired_tickets($factory()).await;
            }

            #[tokio::test]
            async fn add_duplicate_is_rejected() {
                conformance::add_duplicate_is_rejected($factory()).await;
            }

            #[tokio::test]
            async fn add_duplicate_keeps_original() {
                conformance::add_duplicate_keeps_original($factory()).await;
            }

            #[tokio::test]
            async fn update_replaces_existing() {
                conformance::update_replaces_existing($factory()).await;
            }

            #[tokio::test]
            async fn update_missing_returns_false() {
                conformance::update_missing_returns_false($factory()).await;
            }

            #[tokio::test]
            async fn delete_is_idempotent() {
                conformance::delete_is_idempotent($factory()).await;
            }

            #[tokio::test]
            async fn delete_cascades_to_descendants() {
                conformance::delete_cascades_to_descendants($factory()).await;
            }

            #[tokio::test]
            async fn delete_session_removes_its_service_ticket() {
                conformance::delete_session_removes_its_service_ticket($factory()).await;
            }

            #[tokio::test]
            async fn delete_tolerates_missing_children() {
                conformance::delete_tolerates_missing_children($factory()).await;
            }

            #[tokio::test]
            async fn delete_all_removes_everything() {
                conformance::delete_all_removes_everything($factory()).await;
            }

            #[tokio::test]
            async fn counts_by_kind() {
                conformance::counts_by_kind($factory()).await;
            }

            #[tokio::test]
            async fn list_returns_all_tickets() {
                conformance::list_returns_all_tickets($factory()).await;
            }

            #[tokio::test]
            async fn list_skips_unreadable_records() {
                conformance::list_skips_unreadable_records($factory()).await;
            }

            #[tokio::test]
            async fn sessions_by_principal() {
                conformance::sessions_by_principal($factory()).await;
            }

            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn concurrent_adds_all_land() {
                conformance::concurrent_adds_all_land($factory()).await;
            }

            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn concurrent_updates_are_serialized() {
                conformance::concurrent_updates_are_serialized($factory()).await;
            }

            #[tokio::test]
            async fn health_check_succeeds() {
                conformance::health_check_succeeds($factory()).await;
            }

            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn run_all() {
                conformance::run_all($factory()).await;
            }
        }
    };
}

conformance_tests!(memory_backend, memory);
conformance_tests!(key_value_backend, key_value);
conformance_tests!(replicating_backend, replicating);
