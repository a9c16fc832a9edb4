//! Periodic removal of expired and orphaned tickets.
//!
//! Lookups already hide expired tickets, so the cleaner exists to reclaim space in backends
//! without native TTL and to revoke whole sessions promptly: an expired granting ticket is
//! deleted with cascade. A pass also prunes tickets whose issuing ticket is gone, which
//! happens when a backend's bulk expiry removed the parent without its children.

use std::{
    collections::HashSet,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    audit::AuditAction,
    config::CleanerConfig,
    error::RegistryResult,
    registry::{Deletion, TicketRegistry},
};

/// Records removed by one cleaner pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Expired tickets, descendants removed with them included.
    pub expired: u64,
    /// Tickets whose issuing ticket no longer existed.
    pub orphans: u64,
}

impl CleanupReport {
    /// Total records removed.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.expired + self.orphans
    }
}

/// Result of [`TicketRegistryCleaner::clean`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    /// The pass ran.
    Completed(CleanupReport),
    /// Another pass was still running.
    Skipped,
}

/// Removes expired tickets from a [`TicketRegistry`].
#[derive(Debug)]
pub struct TicketRegistryCleaner {
    registry: Arc<TicketRegistry>,
    config: CleanerConfig,
    running: AtomicBool,
}

/// Clears the running flag when a pass ends, however it ends.
struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl TicketRegistryCleaner {
    /// Creates a cleaner for `registry`.
    #[must_use]
    pub fn new(registry: Arc<TicketRegistry>, config: CleanerConfig) -> Self {
        Self { registry, config, running: AtomicBool::new(false) }
    }

    /// Runs one pass.
    ///
    /// Returns [`CleanupOutcome::Skipped`] without touching the backend if a pass is already
    /// in progress.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`](crate::RegistryError::Unavailable) if the backend
    /// cannot be scanned. Failures to remove individual tickets are logged and skipped.
    #[tracing::instrument(skip(self))]
    pub async fn clean(&self) -> RegistryResult<CleanupOutcome> {
        if self.running.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_err() {
            tracing::debug!("cleaner pass already running, skipping");
            return Ok(CleanupOutcome::Skipped);
        }
        let _guard = RunningGuard(&self.running);

        let now = self.registry.now();
        let mut report = CleanupReport::default();
        if let Some(removed) = self.registry.remove_expired(now).await? {
            report.expired += removed;
        }

        let records = self.registry.scan_records().await?;
        let mut gone: HashSet<String> = HashSet::new();
        for record in &records {
            if gone.contains(&record.key) {
                continue;
            }
            let expired = record.is_past_expiry(now)
                || self.registry.decode(record).is_some_and(|ticket| ticket.is_expired(now));
            if !expired {
                continue;
            }
            match self.registry.delete_key(&record.key, AuditAction::ExpireTicket).await {
                Ok(deletion) => {
                    report.expired += deletion.removed() as u64;
                    gone.insert(record.key.clone());
                    if let Deletion::PartiallyDeleted { failure, .. } = deletion {
                        tracing::warn!(key = %record.key, failures = failure.failures.len(), "expired ticket only partially removed");
                    }
                },
                Err(e) => tracing::warn!(key = %record.key, error = %e, "failed to remove expired ticket"),
            }
        }

        let present: HashSet<&str> =
            records.iter().map(|r| r.key.as_str()).filter(|key| !gone.contains(*key)).collect();
        for record in &records {
            let Some(parent) = record.parent_key.as_deref() else {
                continue;
            };
            if gone.contains(&record.key) || present.contains(parent) {
                continue;
            }
            // The parent may have been added after the scan; confirm before pruning.
            match self.registry.get_record(parent).await {
                Ok(Some(_)) => continue,
                Ok(None) => {},
                Err(e) => {
                    tracing::warn!(key = %record.key, error = %e, "failed to check ticket parent");
                    continue;
                },
            }
            match self.registry.delete_key(&record.key, AuditAction::ExpireTicket).await {
                Ok(deletion) => {
                    report.orphans += deletion.removed() as u64;
                    gone.insert(record.key.clone());
                },
                Err(e) => tracing::warn!(key = %record.key, error = %e, "failed to prune orphaned ticket"),
            }
        }

        self.registry.metrics().record_cleaner_run(report.total());
        if report.total() > 0 {
            tracing::info!(expired = report.expired, orphans = report.orphans, "cleaner pass removed tickets");
        } else {
            tracing::debug!("cleaner pass found nothing to remove");
        }
        Ok(CleanupOutcome::Completed(report))
    }

    /// Runs [`clean`](Self::clean) on the configured schedule until `cancel` fires.
    ///
    /// Returns `None` if the cleaner is disabled. Ticks missed while a pass is running are
    /// dropped rather than replayed.
    #[must_use]
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            tracing::info!("ticket registry cleaner is disabled");
            return None;
        }

        Some(tokio::spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => return,
                () = tokio::time::sleep(self.config.start_delay) => {},
            }

            let mut ticker = tokio::time::interval(self.config.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            tracing::info!(interval_secs = self.config.interval.as_secs(), "ticket registry cleaner started");

            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = self.clean().await {
                            tracing::error!(error = %e, "ticket registry cleaner pass failed");
                        }
                    },
                }
            }
            tracing::info!("ticket registry cleaner stopped");
        }))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        MemoryTicketBackend,
        clock::{Clock, ManualClock},
        expiration::ExpirationPolicy,
        ticket::{Authentication, Principal, ServiceTicket, Ticket, TicketGrantingTicket},
    };

    fn registry(clock: &ManualClock) -> Arc<TicketRegistry> {
        Arc::new(
            TicketRegistry::builder()
                .backend(Arc::new(MemoryTicketBackend::new()))
                .clock(Arc::new(clock.clone()))
                .build(),
        )
    }

    fn tgt(id: &str, policy: ExpirationPolicy, clock: &ManualClock) -> Ticket {
        let auth = Authentication::builder().principal(Principal::new("casuser")).build();
        TicketGrantingTicket::new(id, auth, policy, clock.now()).into()
    }

    #[tokio::test]
    async fn expired_session_is_removed_with_children() {
        let clock = ManualClock::default();
        let registry = registry(&clock);
        let mut session = tgt("TGT-1", ExpirationPolicy::HardTimeout { time_to_kill: Duration::from_secs(60) }, &clock);
        let st: Ticket =
            ServiceTicket::new("ST-1", "TGT-1", "https://app.example.org".into(), false, ExpirationPolicy::NeverExpires, clock.now())
                .into();
        session.as_granting_mut().unwrap().grant_service_ticket("ST-1", "https://app.example.org".into(), clock.now());
        registry.add_ticket(&session).await.unwrap();
        registry.add_ticket(&st).await.unwrap();
        registry.add_ticket(&tgt("TGT-2", ExpirationPolicy::NeverExpires, &clock)).await.unwrap();

        let cleaner = TicketRegistryCleaner::new(Arc::clone(&registry), CleanerConfig::default());
        assert_eq!(cleaner.clean().await.unwrap(), CleanupOutcome::Completed(CleanupReport::default()));

        clock.advance(Duration::from_secs(61));
        let outcome = cleaner.clean().await.unwrap();
        assert_eq!(outcome, CleanupOutcome::Completed(CleanupReport { expired: 2, orphans: 0 }));
        assert!(registry.find_ticket("TGT-2").await.unwrap().is_some());
        assert_eq!(registry.metrics().snapshot().cleaner_removed, 2);
    }

    #[tokio::test]
    async fn orphans_are_pruned() {
        let clock = ManualClock::default();
        let registry = registry(&clock);
        let st: Ticket =
            ServiceTicket::new("ST-1", "TGT-gone", "https://app.example.org".into(), false, ExpirationPolicy::NeverExpires, clock.now())
                .into();
        registry.add_ticket(&st).await.unwrap();

        let cleaner = TicketRegistryCleaner::new(Arc::clone(&registry), CleanerConfig::default());
        let outcome = cleaner.clean().await.unwrap();
        assert_eq!(outcome, CleanupOutcome::Completed(CleanupReport { expired: 0, orphans: 1 }));
        assert!(registry.find_ticket("ST-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn concurrent_pass_is_skipped() {
        let clock = ManualClock::default();
        let cleaner = TicketRegistryCleaner::new(registry(&clock), CleanerConfig::default());
        cleaner.running.store(true, Ordering::Release);
        assert_eq!(cleaner.clean().await.unwrap(), CleanupOutcome::Skipped);
        cleaner.running.store(false, Ordering::Release);
        assert!(matches!(cleaner.clean().await.unwrap(), CleanupOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn disabled_cleaner_does_not_spawn() {
        let clock = ManualClock::default();
        let config = CleanerConfig::builder().enabled(false).build();
        let cleaner = Arc::new(TicketRegistryCleaner::new(registry(&clock), config));
        assert!(cleaner.spawn(CancellationToken::new()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn scheduled_passes_run_after_start_delay() {
        let clock = ManualClock::default();
        let registry = registry(&clock);
        let config = CleanerConfig::builder()
            .start_delay(Duration::from_secs(20))
            .interval(Duration::from_secs(120))
            .build();
        let cleaner = Arc::new(TicketRegistryCleaner::new(Arc::clone(&registry), config));
        let cancel = CancellationToken::new();
        let task = Arc::clone(&cleaner).spawn(cancel.clone()).unwrap();
        tokio::task::yield_now().await;

        tokio::time::advance(Duration::from_secs(19)).await;
        tokio::task::yield_now().await;
        assert_eq!(registry.metrics().snapshot().cleaner_runs, 0);

        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::task::yield_now().await;
        assert_eq!(registry.metrics().snapshot().cleaner_runs, 1);

        tokio::time::advance(Duration::from_secs(120)).await;
        tokio::task::yield_now().await;
        assert_eq!(registry.metrics().snapshot().cleaner_runs, 2);

        cancel.cancel();
        task.await.unwrap();
    }
}
