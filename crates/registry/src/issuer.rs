//! Ticket issuance on top of the registry.
//!
//! [`TicketIssuer`] creates sessions and grants tickets from them, keeping the parent's child
//! map in step with the registry. Every creation generates a fresh id and retries on
//! [`RegistryError::DuplicateTicket`] up to the configured bound.

use std::{sync::Arc, time::Duration};

use crate::{
    config::{DEFAULT_ID_GENERATION_RETRIES, TicketIdConfig},
    error::{ConfigError, RegistryError, RegistryResult},
    expiration::ExpirationPolicy,
    registry::{Deletion, TicketRegistry},
    ticket::{Authentication, Service, ServiceTicket, Ticket, TicketGrantingTicket, TicketKind},
    ticket_id::{TicketIdGenerator, UniqueTicketIdGenerator},
};

/// Policies attached to newly issued tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, bon::Builder)]
pub struct IssuancePolicies {
    /// Sessions (default: 8 hours hard, 2 hours idle).
    #[builder(default = IssuancePolicies::DEFAULT_GRANTING)]
    pub ticket_granting: ExpirationPolicy,
    /// Service tickets (default: single use within 10 seconds).
    #[builder(default = IssuancePolicies::DEFAULT_SERVICE)]
    pub service: ExpirationPolicy,
    /// Proxy-granting tickets (default: same as sessions).
    #[builder(default = IssuancePolicies::DEFAULT_GRANTING)]
    pub proxy_granting: ExpirationPolicy,
    /// Proxy tickets (default: single use within 10 seconds).
    #[builder(default = IssuancePolicies::DEFAULT_SERVICE)]
    pub proxy: ExpirationPolicy,
}

impl IssuancePolicies {
    const DEFAULT_GRANTING: ExpirationPolicy = ExpirationPolicy::TicketGranting {
        max_time_to_live: Duration::from_secs(8 * 60 * 60),
        time_to_kill: Duration::from_secs(2 * 60 * 60),
    };
    const DEFAULT_SERVICE: ExpirationPolicy =
        ExpirationPolicy::MultiUseOrTimeout { max_uses: 1, time_to_kill: Duration::from_secs(10) };
}

impl Default for IssuancePolicies {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Creates and grants tickets.
pub struct TicketIssuer {
    registry: Arc<TicketRegistry>,
    ids: Arc<dyn TicketIdGenerator>,
    policies: IssuancePolicies,
    max_attempts: u32,
}

#[bon::bon]
impl TicketIssuer {
    /// Creates an issuer over `registry`.
    #[builder]
    pub fn new(
        registry: Arc<TicketRegistry>,
        #[builder(default = Arc::new(UniqueTicketIdGenerator::default()))] ids: Arc<dyn TicketIdGenerator>,
        #[builder(default)] policies: IssuancePolicies,
        #[builder(default = DEFAULT_ID_GENERATION_RETRIES)] max_attempts: u32,
    ) -> Self {
        Self { registry, ids, policies, max_attempts: max_attempts.max(1) }
    }
}

impl TicketIssuer {
    /// Creates an issuer whose id generation follows `config`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the id configuration is invalid.
    pub fn from_config(
        config: &TicketIdConfig,
        registry: Arc<TicketRegistry>,
        policies: IssuancePolicies,
    ) -> Result<Self, ConfigError> {
        Ok(Self::builder()
            .registry(registry)
            .ids(Arc::new(config.generator()?))
            .policies(policies)
            .max_attempts(config.max_retries)
            .build())
    }

    /// The registry tickets are stored in.
    #[must_use]
    pub fn registry(&self) -> &Arc<TicketRegistry> {
        &self.registry
    }

    /// Starts a session for `authentication`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::IdGenerationExhausted`] if every generated id collided, or the
    /// registry's error.
    #[tracing::instrument(skip(self, authentication), fields(principal = %authentication.principal.id))]
    pub async fn create_ticket_granting_ticket(
        &self,
        authentication: Authentication,
    ) -> RegistryResult<TicketGrantingTicket> {
        let now = self.registry.now();
        let policy = self.policies.ticket_granting;
        let ticket = self
            .add_with_fresh_id(TicketKind::TicketGranting, |id| {
                TicketGrantingTicket::new(id, authentication.clone(), policy, now).into()
            })
            .await?;
        ticket.into_granting().ok_or_else(|| unexpected_kind(TicketKind::TicketGranting))
    }

    /// Grants a service ticket for `service` from the session `tgt_id`.
    ///
    /// The ticket is stored first and then recorded on the session. If the session disappears
    /// in between, the new ticket is removed again.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::TicketNotFound`] if the session does not exist or has expired
    /// - [`RegistryError::InvalidTicket`] if `tgt_id` is a proxy-granting ticket
    #[tracing::instrument(skip(self))]
    pub async fn grant_service_ticket(
        &self,
        tgt_id: &str,
        service: Service,
        from_new_login: bool,
    ) -> RegistryResult<ServiceTicket> {
        let tgt = self
            .registry
            .get_ticket(tgt_id, TicketKind::TicketGranting)
            .await?
            .ok_or_else(|| not_found(tgt_id))?;
        if tgt.kind() != TicketKind::TicketGranting {
            return Err(RegistryError::InvalidTicket {
                id: tgt_id.to_owned(),
                reason: "proxy-granting tickets issue proxy tickets".to_owned(),
            });
        }

        let now = self.registry.now();
        let policy = self.policies.service;
        let st = self
            .add_with_fresh_id(TicketKind::Service, |id| {
                ServiceTicket::new(id, tgt_id, service.clone(), from_new_login, policy, now).into()
            })
            .await?;
        self.attach_child(tgt_id, TicketKind::TicketGranting, &st, |parent| {
            parent.grant_service_ticket(st.id(), service.clone(), now);
        })
        .await?;
        st.into_service().ok_or_else(|| unexpected_kind(TicketKind::Service))
    }

    /// Grants a proxy-granting ticket to `proxied_by`, which presented the service ticket
    /// `st_id`.
    ///
    /// The new ticket is recorded on the granting ticket that issued `st_id`, so revoking that
    /// session also revokes the proxy chain.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::TicketNotFound`] if the service ticket or its granting ticket
    /// does not exist.
    #[tracing::instrument(skip(self))]
    pub async fn grant_proxy_granting_ticket(
        &self,
        st_id: &str,
        proxied_by: Service,
    ) -> RegistryResult<TicketGrantingTicket> {
        let st = self.registry.get_ticket(st_id, TicketKind::Service).await?.ok_or_else(|| not_found(st_id))?;
        let parent_id = st.granted_by().map(ToOwned::to_owned).ok_or_else(|| not_found(st_id))?;
        let parent = self
            .registry
            .get_ticket(&parent_id, TicketKind::TicketGranting)
            .await?
            .ok_or_else(|| not_found(&parent_id))?;
        let authentication = parent.as_granting().map(|g| g.authentication().clone()).ok_or_else(|| not_found(&parent_id))?;

        let now = self.registry.now();
        let policy = self.policies.proxy_granting;
        let pgt = self
            .add_with_fresh_id(TicketKind::ProxyGranting, |id| {
                TicketGrantingTicket::new_proxy_granting(
                    id,
                    authentication.clone(),
                    parent_id.as_str(),
                    proxied_by.clone(),
                    policy,
                    now,
                )
                .into()
            })
            .await?;
        self.attach_child(&parent_id, TicketKind::TicketGranting, &pgt, |granting| {
            granting.add_proxy_granting_ticket(pgt.id());
        })
        .await?;
        pgt.into_granting().ok_or_else(|| unexpected_kind(TicketKind::ProxyGranting))
    }

    /// Grants a proxy ticket for `service` from the proxy-granting ticket `pgt_id`.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::TicketNotFound`] if the proxy-granting ticket does not exist
    /// - [`RegistryError::TicketTypeMismatch`] if `pgt_id` is not a proxy-granting ticket
    #[tracing::instrument(skip(self))]
    pub async fn grant_proxy_ticket(&self, pgt_id: &str, service: Service) -> RegistryResult<ServiceTicket> {
        self.registry.get_ticket(pgt_id, TicketKind::ProxyGranting).await?.ok_or_else(|| not_found(pgt_id))?;

        let now = self.registry.now();
        let policy = self.policies.proxy;
        let pt = self
            .add_with_fresh_id(TicketKind::Proxy, |id| {
                ServiceTicket::new_proxy(id, pgt_id, service.clone(), policy, now).into()
            })
            .await?;
        self.attach_child(pgt_id, TicketKind::ProxyGranting, &pt, |pgt| {
            pgt.grant_service_ticket(pt.id(), service.clone(), now);
        })
        .await?;
        pt.into_service().ok_or_else(|| unexpected_kind(TicketKind::Proxy))
    }

    /// Validates and uses the service (or proxy) ticket `st_id` for `service`.
    ///
    /// The use is recorded; once the ticket's policy reports it expired it is deleted,
    /// otherwise the new use count is stored. Concurrent consumers of one ticket in this
    /// process are serialized, so a single-use ticket is accepted at most once.
    ///
    /// # Errors
    ///
    /// - [`RegistryError::TicketNotFound`] if the ticket does not exist or has expired
    /// - [`RegistryError::InvalidTicket`] if it was issued for another service (it is deleted)
    #[tracing::instrument(skip(self))]
    pub async fn consume_service_ticket(&self, st_id: &str, service: &Service) -> RegistryResult<ServiceTicket> {
        let _guard = self.registry.lock_for(st_id).lock().await;

        let mut ticket =
            self.registry.get_ticket(st_id, TicketKind::Service).await?.ok_or_else(|| not_found(st_id))?;
        let issued_for = ticket.as_service().map(|st| st.service().clone());
        if issued_for.as_ref() != Some(service) {
            self.discard(st_id, "presented for another service").await?;
            return Err(RegistryError::InvalidTicket {
                id: st_id.to_owned(),
                reason: format!("issued for {}", issued_for.map(|s| s.to_string()).unwrap_or_default()),
            });
        }

        let now = self.registry.now();
        ticket.record_use(now);
        if ticket.is_expired(now) {
            self.discard(st_id, "used up").await?;
        } else if !self.registry.update_ticket(&ticket).await? {
            return Err(not_found(st_id));
        }
        ticket.into_service().ok_or_else(|| unexpected_kind(TicketKind::Service))
    }

    async fn add_with_fresh_id<F>(&self, kind: TicketKind, build: F) -> RegistryResult<Ticket>
    where
        F: Fn(String) -> Ticket + Send + Sync,
    {
        for attempt in 1..=self.max_attempts {
            let ticket = build(self.ids.new_ticket_id(kind));
            match self.registry.add_ticket(&ticket).await {
                Ok(()) => return Ok(ticket),
                Err(e) if e.is_duplicate() => {
                    tracing::warn!(attempt, %kind, "generated ticket id collided, retrying");
                },
                Err(e) => return Err(e),
            }
        }
        Err(RegistryError::IdGenerationExhausted { attempts: self.max_attempts })
    }

    /// Deletes a ticket the issuer no longer wants, logging anything short of a clean removal.
    async fn discard(&self, id: &str, reason: &'static str) -> RegistryResult<()> {
        match self.registry.delete_ticket(id).await? {
            Deletion::Deleted { removed } => {
                tracing::debug!(id, reason, removed, "discarded ticket");
            },
            Deletion::NotFound => {
                tracing::debug!(id, reason, "ticket to discard was already gone");
            },
            Deletion::PartiallyDeleted { removed, failure } => {
                tracing::debug!(id, reason, removed, failures = failure.failures.len(), "ticket discarded, descendants left behind");
            },
        }
        Ok(())
    }

    /// Records `child` on its parent. Removes `child` again if the parent is gone.
    async fn attach_child<F>(&self, parent_id: &str, parent_kind: TicketKind, child: &Ticket, attach: F) -> RegistryResult<()>
    where
        F: FnOnce(&mut TicketGrantingTicket) + Send,
    {
        let updated = self
            .registry
            .update_with(parent_id, parent_kind, |parent| {
                if let Some(granting) = parent.as_granting_mut() {
                    attach(granting);
                }
                Ok(())
            })
            .await;

        match updated {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                self.discard(child.id(), "parent vanished while granting").await?;
                Err(not_found(parent_id))
            },
            Err(e) => {
                if let Err(cleanup) = self.registry.delete_ticket(child.id()).await {
                    tracing::warn!(child = child.id(), error = %cleanup, "failed to remove ungranted child");
                }
                Err(e)
            },
        }
    }
}

impl std::fmt::Debug for TicketIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TicketIssuer")
            .field("policies", &self.policies)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

fn not_found(id: &str) -> RegistryError {
    RegistryError::TicketNotFound { id: id.to_owned() }
}

fn unexpected_kind(expected: TicketKind) -> RegistryError {
    RegistryError::InvalidTicket { id: String::new(), reason: format!("issued ticket is not a {expected}") }
}
