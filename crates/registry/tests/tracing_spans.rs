//! Integration test verifying that `#[instrument]` annotations produce the expected spans on
//! registry, issuer and backend operations.

#![allow(clippy::expect_used)]

use std::sync::{Arc, Mutex};

use tessera_registry::{
    MemoryTicketBackend, Service, TicketIssuer, TicketKind, TicketRegistry, TicketRegistryCleaner,
    config::CleanerConfig, testutil::authentication,
};
use tracing::Subscriber;
use tracing_subscriber::{layer::SubscriberExt, registry::LookupSpan};

// ---------------------------------------------------------------------------
// Collecting layer: records span names as they are created
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct SpanCollector {
    spans: Arc<Mutex<Vec<String>>>,
}

impl<S> tracing_subscriber::Layer<S> for SpanCollector
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        _attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        if let Some(span) = ctx.span(id) {
            self.spans.lock().expect("lock poisoned").push(span.name().to_owned());
        }
    }
}

impl SpanCollector {
    fn assert_recorded(&self, expected: &[&str]) {
        let recorded = self.spans.lock().expect("lock poisoned");
        for name in expected {
            assert!(recorded.iter().any(|s| s == name), "missing span '{name}', recorded: {recorded:?}");
        }
    }
}

fn registry() -> Arc<TicketRegistry> {
    Arc::new(TicketRegistry::builder().backend(Arc::new(MemoryTicketBackend::new())).build())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn registry_operations_create_spans() {
    let collector = SpanCollector::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(collector.clone()));

    let registry = registry();
    let issuer = TicketIssuer::builder().registry(Arc::clone(&registry)).build();
    let tgt = issuer.create_ticket_granting_ticket(authentication("casuser")).await.expect("create");

    let _ = registry.get_ticket(tgt.id(), TicketKind::TicketGranting).await;
    let _ = registry.find_ticket("TGT-missing").await;
    let _ = registry.delete_ticket(tgt.id()).await.expect("delete");
    let _ = registry.delete_all().await.expect("delete_all");

    collector.assert_recorded(&["add_ticket", "get_ticket", "find_ticket", "delete_ticket", "delete_all"]);
}

#[tokio::test]
async fn backend_operations_create_spans() {
    let collector = SpanCollector::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(collector.clone()));

    let registry = registry();
    let issuer = TicketIssuer::builder().registry(Arc::clone(&registry)).build();
    let tgt = issuer.create_ticket_granting_ticket(authentication("casuser")).await.expect("create");
    let _ = registry.find_ticket(tgt.id()).await;
    let _ = registry.delete_ticket(tgt.id()).await.expect("delete");
    let _ = registry.delete_all().await.expect("delete_all");

    collector.assert_recorded(&["insert", "get", "remove_cascade", "clear"]);
}

#[tokio::test]
async fn issuer_operations_create_spans() {
    let collector = SpanCollector::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(collector.clone()));

    let registry = registry();
    let issuer = TicketIssuer::builder().registry(Arc::clone(&registry)).build();
    let service = Service::from("https://app.example.org");

    let tgt = issuer.create_ticket_granting_ticket(authentication("casuser")).await.expect("create");
    let st = issuer.grant_service_ticket(tgt.id(), service.clone(), true).await.expect("grant");
    issuer.consume_service_ticket(st.id(), &service).await.expect("consume");

    collector.assert_recorded(&[
        "create_ticket_granting_ticket",
        "grant_service_ticket",
        "consume_service_ticket",
        "update",
    ]);
}

#[tokio::test]
async fn cleaner_run_creates_span() {
    let collector = SpanCollector::default();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(collector.clone()));

    let cleaner = TicketRegistryCleaner::new(registry(), CleanerConfig::default());
    let _ = cleaner.clean().await.expect("clean");

    collector.assert_recorded(&["clean"]);
}
