//! Ticket model.
//!
//! Four kinds of ticket exist. Granting tickets (TGT, PGT) own an authentication and record the
//! tickets they issued; service tickets (ST, PT) hold the id of the granting ticket that issued
//! them, never the ticket itself.
//!
//! ```text
//! TGT ─┬─ ST, ST, ...            (services map: child id -> service)
//!      └─ PGT ─┬─ PT, PT, ...    (proxy_granting_tickets: ids)
//!              └─ PGT ─ ...
//! ```
//!
//! Ticket identity (`id`, `creation_time`, expiration policy) is fixed at construction. The only
//! lifecycle mutations are recording a use and attaching or forgetting a child.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
    str::FromStr,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::expiration::ExpirationPolicy;

/// The concrete kind of a ticket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TicketKind {
    /// Ticket-granting ticket: an authenticated single-sign-on session.
    #[serde(rename = "TGT")]
    TicketGranting,
    /// Service ticket issued to one service.
    #[serde(rename = "ST")]
    Service,
    /// Proxy-granting ticket issued to a proxying service.
    #[serde(rename = "PGT")]
    ProxyGranting,
    /// Proxy ticket issued from a proxy-granting ticket.
    #[serde(rename = "PT")]
    Proxy,
}

impl TicketKind {
    /// Every kind, in prefix order.
    pub const ALL: [Self; 4] = [Self::TicketGranting, Self::Service, Self::ProxyGranting, Self::Proxy];

    /// The id prefix for this kind.
    #[must_use]
    pub const fn prefix(self) -> &'static str {
        match self {
            Self::TicketGranting => "TGT",
            Self::Service => "ST",
            Self::ProxyGranting => "PGT",
            Self::Proxy => "PT",
        }
    }

    /// Infers the kind from a ticket id prefix (`TGT-...`).
    #[must_use]
    pub fn from_id(id: &str) -> Option<Self> {
        let (prefix, _) = id.split_once('-')?;
        prefix.parse().ok()
    }

    /// Returns `true` if a ticket of this kind may be returned where `expected` was requested.
    ///
    /// A proxy-granting ticket is a granting ticket and a proxy ticket is a service ticket.
    #[must_use]
    pub const fn is_assignable_to(self, expected: Self) -> bool {
        matches!(
            (self, expected),
            (Self::TicketGranting, Self::TicketGranting)
                | (Self::ProxyGranting, Self::ProxyGranting | Self::TicketGranting)
                | (Self::Service, Self::Service)
                | (Self::Proxy, Self::Proxy | Self::Service)
        )
    }

    /// Returns `true` for kinds that can issue other tickets.
    #[must_use]
    pub const fn is_granting(self) -> bool {
        matches!(self, Self::TicketGranting | Self::ProxyGranting)
    }
}

impl fmt::Display for TicketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl FromStr for TicketKind {
    type Err = UnknownTicketKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL.into_iter().find(|kind| kind.prefix() == s).ok_or_else(|| UnknownTicketKind(s.to_owned()))
    }
}

/// A string that is not a ticket kind prefix.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown ticket kind: {0}")]
pub struct UnknownTicketKind(pub String);

/// The authenticated subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    /// Stable principal identifier (user name, subject id).
    pub id: String,
    /// Resolved principal attributes.
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl Principal {
    /// Creates a principal with no attributes.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), attributes: BTreeMap::new() }
    }
}

/// The result of a successful authentication, owned by a granting ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bon::Builder)]
pub struct Authentication {
    /// Who authenticated.
    pub principal: Principal,
    /// When the authentication happened.
    #[builder(default = Utc::now())]
    pub authentication_date: DateTime<Utc>,
    /// Authentication metadata (methods, handlers, credential types).
    #[serde(default)]
    #[builder(default)]
    pub attributes: BTreeMap<String, Vec<String>>,
}

/// Identifier of a relying service, usually its URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Service(String);

impl Service {
    /// Creates a service identifier.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Service {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for Service {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identity and lifecycle state shared by every ticket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketState {
    id: String,
    creation_time: DateTime<Utc>,
    last_time_used: DateTime<Utc>,
    #[serde(default)]
    previous_time_used: Option<DateTime<Utc>>,
    #[serde(default)]
    count_of_uses: u32,
    expiration_policy: ExpirationPolicy,
}

impl TicketState {
    /// Creates the state of a ticket created at `now`.
    #[must_use]
    pub fn new(id: impl Into<String>, now: DateTime<Utc>, expiration_policy: ExpirationPolicy) -> Self {
        Self {
            id: id.into(),
            creation_time: now,
            last_time_used: now,
            previous_time_used: None,
            count_of_uses: 0,
            expiration_policy,
        }
    }

    /// The ticket id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// When the ticket was created.
    #[must_use]
    pub fn creation_time(&self) -> DateTime<Utc> {
        self.creation_time
    }

    /// When the ticket was last used (creation time if never used).
    #[must_use]
    pub fn last_time_used(&self) -> DateTime<Utc> {
        self.last_time_used
    }

    /// When the ticket was used before the last use.
    #[must_use]
    pub fn previous_time_used(&self) -> Option<DateTime<Utc>> {
        self.previous_time_used
    }

    /// How many times the ticket has been used.
    #[must_use]
    pub fn count_of_uses(&self) -> u32 {
        self.count_of_uses
    }

    /// The policy attached at creation.
    #[must_use]
    pub fn expiration_policy(&self) -> &ExpirationPolicy {
        &self.expiration_policy
    }

    /// Returns `true` if the ticket is expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration_policy.is_expired(self, now)
    }

    /// Last instant at which the ticket is valid, if time-bounded.
    #[must_use]
    pub fn expiration_instant(&self) -> Option<DateTime<Utc>> {
        self.expiration_policy.expiration_instant(self)
    }

    /// Records one successful use at `now`.
    pub fn record_use(&mut self, now: DateTime<Utc>) {
        self.previous_time_used = Some(self.last_time_used);
        self.last_time_used = now;
        self.count_of_uses = self.count_of_uses.saturating_add(1);
    }
}

/// A granting ticket: the root of a session (TGT) or a proxy-granting ticket (PGT).
///
/// A PGT is a TGT with a `granted_by` parent and the service it was issued to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TicketGrantingTicket {
    state: TicketState,
    authentication: Authentication,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    granted_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    proxied_by: Option<Service>,
    #[serde(default)]
    services: BTreeMap<String, Service>,
    #[serde(default)]
    proxy_granting_tickets: BTreeSet<String>,
}

impl TicketGrantingTicket {
    /// Creates a session root ticket.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        authentication: Authentication,
        expiration_policy: ExpirationPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            state: TicketState::new(id, now, expiration_policy),
            authentication,
            granted_by: None,
            proxied_by: None,
            services: BTreeMap::new(),
            proxy_granting_tickets: BTreeSet::new(),
        }
    }

    /// Creates a proxy-granting ticket issued by `granted_by` to `proxied_by`.
    #[must_use]
    pub fn new_proxy_granting(
        id: impl Into<String>,
        authentication: Authentication,
        granted_by: impl Into<String>,
        proxied_by: Service,
        expiration_policy: ExpirationPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            granted_by: Some(granted_by.into()),
            proxied_by: Some(proxied_by),
            ..Self::new(id, authentication, expiration_policy, now)
        }
    }

    /// The ticket id.
    #[must_use]
    pub fn id(&self) -> &str {
        self.state.id()
    }

    /// Identity and lifecycle state.
    #[must_use]
    pub fn state(&self) -> &TicketState {
        &self.state
    }

    /// The authentication this session represents.
    #[must_use]
    pub fn authentication(&self) -> &Authentication {
        &self.authentication
    }

    /// Parent granting ticket, for proxy-granting tickets.
    #[must_use]
    pub fn granted_by(&self) -> Option<&str> {
        self.granted_by.as_deref()
    }

    /// The proxying service, for proxy-granting tickets.
    #[must_use]
    pub fn proxied_by(&self) -> Option<&Service> {
        self.proxied_by.as_ref()
    }

    /// Returns `true` for a proxy-granting ticket.
    #[must_use]
    pub fn is_proxy_granting(&self) -> bool {
        self.granted_by.is_some()
    }

    /// Child service/proxy tickets, keyed by id.
    #[must_use]
    pub fn services(&self) -> &BTreeMap<String, Service> {
        &self.services
    }

    /// Ids of proxy-granting tickets issued from this ticket.
    #[must_use]
    pub fn proxy_granting_tickets(&self) -> &BTreeSet<String> {
        &self.proxy_granting_tickets
    }

    /// Records that a service ticket was issued at `now`. Counts as a use.
    pub fn grant_service_ticket(&mut self, ticket_id: impl Into<String>, service: Service, now: DateTime<Utc>) {
        self.state.record_use(now);
        self.services.insert(ticket_id.into(), service);
    }

    /// Records that a proxy-granting ticket was issued.
    pub fn add_proxy_granting_ticket(&mut self, ticket_id: impl Into<String>) {
        self.proxy_granting_tickets.insert(ticket_id.into());
    }

    /// Forgets a child ticket. Returns `true` if it was known.
    pub fn forget(&mut self, ticket_id: &str) -> bool {
        self.services.remove(ticket_id).is_some() | self.proxy_granting_tickets.remove(ticket_id)
    }

    /// Records a use at `now`.
    pub fn record_use(&mut self, now: DateTime<Utc>) {
        self.state.record_use(now);
    }
}

/// A ticket presented to one service: a service ticket (ST) or proxy ticket (PT).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTicket {
    state: TicketState,
    granted_by: String,
    service: Service,
    #[serde(default)]
    from_new_login: bool,
    #[serde(default)]
    proxy: bool,
}

impl ServiceTicket {
    /// Creates a service ticket issued by the granting ticket `granted_by`.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        granted_by: impl Into<String>,
        service: Service,
        from_new_login: bool,
        expiration_policy: ExpirationPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            state: TicketState::new(id, now, expiration_policy),
            granted_by: granted_by.into(),
            service,
            from_new_login,
            proxy: false,
        }
    }

    /// Creates a proxy ticket issued by the proxy-granting ticket `granted_by`.
    #[must_use]
    pub fn new_proxy(
        id: impl Into<String>,
        granted_by: impl Into<String>,
        service: Service,
        expiration_policy: ExpirationPolicy,
        now: DateTime<Utc>,
    ) -> Self {
        Self { proxy: true, ..Self::new(id, granted_by, service, false, expiration_policy, now) }
    }

    /// The ticket id.
    #[must_use]
    pub fn id(&self) -> &str {
        self.state.id()
    }

    /// Identity and lifecycle state.
    #[must_use]
    pub fn state(&self) -> &TicketState {
        &self.state
    }

    /// Id of the granting ticket that issued this ticket.
    #[must_use]
    pub fn granted_by(&self) -> &str {
        &self.granted_by
    }

    /// The service this ticket was issued to.
    #[must_use]
    pub fn service(&self) -> &Service {
        &self.service
    }

    /// Whether the ticket was issued as part of a fresh login.
    #[must_use]
    pub fn is_from_new_login(&self) -> bool {
        self.from_new_login
    }

    /// Returns `true` for a proxy ticket.
    #[must_use]
    pub fn is_proxy(&self) -> bool {
        self.proxy
    }

    /// Returns `true` if the ticket was issued for `service`.
    #[must_use]
    pub fn is_valid_for(&self, service: &Service) -> bool {
        &self.service == service
    }

    /// Records a use at `now`.
    pub fn record_use(&mut self, now: DateTime<Utc>) {
        self.state.record_use(now);
    }
}

/// Any ticket the registry stores.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Ticket {
    /// A session root.
    #[serde(rename = "TGT")]
    TicketGranting(TicketGrantingTicket),
    /// A service ticket.
    #[serde(rename = "ST")]
    Service(ServiceTicket),
    /// A proxy-granting ticket.
    #[serde(rename = "PGT")]
    ProxyGranting(TicketGrantingTicket),
    /// A proxy ticket.
    #[serde(rename = "PT")]
    Proxy(ServiceTicket),
}

impl Ticket {
    /// The concrete kind.
    #[must_use]
    pub fn kind(&self) -> TicketKind {
        match self {
            Self::TicketGranting(_) => TicketKind::TicketGranting,
            Self::Service(_) => TicketKind::Service,
            Self::ProxyGranting(_) => TicketKind::ProxyGranting,
            Self::Proxy(_) => TicketKind::Proxy,
        }
    }

    /// The ticket id.
    #[must_use]
    pub fn id(&self) -> &str {
        self.state().id()
    }

    /// Identity and lifecycle state.
    #[must_use]
    pub fn state(&self) -> &TicketState {
        match self {
            Self::TicketGranting(t) | Self::ProxyGranting(t) => t.state(),
            Self::Service(t) | Self::Proxy(t) => t.state(),
        }
    }

    /// Returns `true` if the ticket is expired at `now`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.state().is_expired(now)
    }

    /// Id of the ticket that issued this one, if any.
    #[must_use]
    pub fn granted_by(&self) -> Option<&str> {
        match self {
            Self::TicketGranting(t) | Self::ProxyGranting(t) => t.granted_by(),
            Self::Service(t) | Self::Proxy(t) => Some(t.granted_by()),
        }
    }

    /// Principal id, for granting tickets.
    #[must_use]
    pub fn principal_id(&self) -> Option<&str> {
        self.as_granting().map(|t| t.authentication().principal.id.as_str())
    }

    /// The granting ticket, for TGTs and PGTs.
    #[must_use]
    pub fn as_granting(&self) -> Option<&TicketGrantingTicket> {
        match self {
            Self::TicketGranting(t) | Self::ProxyGranting(t) => Some(t),
            Self::Service(_) | Self::Proxy(_) => None,
        }
    }

    /// Mutable access to the granting ticket, for TGTs and PGTs.
    pub fn as_granting_mut(&mut self) -> Option<&mut TicketGrantingTicket> {
        match self {
            Self::TicketGranting(t) | Self::ProxyGranting(t) => Some(t),
            Self::Service(_) | Self::Proxy(_) => None,
        }
    }

    /// The service ticket, for STs and PTs.
    #[must_use]
    pub fn as_service(&self) -> Option<&ServiceTicket> {
        match self {
            Self::Service(t) | Self::Proxy(t) => Some(t),
            Self::TicketGranting(_) | Self::ProxyGranting(_) => None,
        }
    }

    /// Consumes the ticket, returning the granting ticket for TGTs and PGTs.
    #[must_use]
    pub fn into_granting(self) -> Option<TicketGrantingTicket> {
        match self {
            Self::TicketGranting(t) | Self::ProxyGranting(t) => Some(t),
            Self::Service(_) | Self::Proxy(_) => None,
        }
    }

    /// Consumes the ticket, returning the service ticket for STs and PTs.
    #[must_use]
    pub fn into_service(self) -> Option<ServiceTicket> {
        match self {
            Self::Service(t) | Self::Proxy(t) => Some(t),
            Self::TicketGranting(_) | Self::ProxyGranting(_) => None,
        }
    }

    /// Records a use at `now`.
    pub fn record_use(&mut self, now: DateTime<Utc>) {
        match self {
            Self::TicketGranting(t) | Self::ProxyGranting(t) => t.record_use(now),
            Self::Service(t) | Self::Proxy(t) => t.record_use(now),
        }
    }
}

impl From<TicketGrantingTicket> for Ticket {
    fn from(ticket: TicketGrantingTicket) -> Self {
        if ticket.is_proxy_granting() { Self::ProxyGranting(ticket) } else { Self::TicketGranting(ticket) }
    }
}

impl From<ServiceTicket> for Ticket {
    fn from(ticket: ServiceTicket) -> Self {
        if ticket.is_proxy() { Self::Proxy(ticket) } else { Self::Service(ticket) }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn authentication() -> Authentication {
        Authentication::builder().principal(Principal::new("casuser")).build()
    }

    #[test]
    fn kind_prefixes_round_trip() {
        for kind in TicketKind::ALL {
            assert_eq!(kind.prefix().parse::<TicketKind>().unwrap(), kind);
            assert_eq!(TicketKind::from_id(&format!("{kind}-abc-123")), Some(kind));
        }
        assert_eq!(TicketKind::from_id("XYZ-1"), None);
        assert_eq!(TicketKind::from_id("TGT"), None);
    }

    #[test]
    fn assignability() {
        use TicketKind::*;
        assert!(ProxyGranting.is_assignable_to(TicketGranting));
        assert!(Proxy.is_assignable_to(Service));
        assert!(!TicketGranting.is_assignable_to(ProxyGranting));
        assert!(!Service.is_assignable_to(Proxy));
        assert!(!Service.is_assignable_to(TicketGranting));
        assert!(!TicketGranting.is_assignable_to(Service));
    }

    #[test]
    fn conversions_pick_variant_from_content() {
        let now = Utc::now();
        let tgt = TicketGrantingTicket::new("TGT-1", authentication(), ExpirationPolicy::NeverExpires, now);
        let pgt = TicketGrantingTicket::new_proxy_granting(
            "PGT-1",
            authentication(),
            "TGT-1",
            Service::new("https://proxy.example.org"),
            ExpirationPolicy::NeverExpires,
            now,
        );
        let st = ServiceTicket::new("ST-1", "TGT-1", "https://a".into(), true, ExpirationPolicy::NeverExpires, now);
        let pt = ServiceTicket::new_proxy("PT-1", "PGT-1", "https://b".into(), ExpirationPolicy::NeverExpires, now);

        assert_eq!(Ticket::from(tgt).kind(), TicketKind::TicketGranting);
        assert_eq!(Ticket::from(pgt).kind(), TicketKind::ProxyGranting);
        assert_eq!(Ticket::from(st).kind(), TicketKind::Service);
        assert_eq!(Ticket::from(pt).kind(), TicketKind::Proxy);
    }

    #[test]
    fn granting_service_ticket_records_use_and_child() {
        let now = Utc::now();
        let mut tgt = TicketGrantingTicket::new("TGT-1", authentication(), ExpirationPolicy::NeverExpires, now);
        let later = now + chrono::TimeDelta::seconds(5);

        tgt.grant_service_ticket("ST-1", Service::new("https://app.example.org"), later);

        assert_eq!(tgt.state().count_of_uses(), 1);
        assert_eq!(tgt.state().last_time_used(), later);
        assert_eq!(tgt.state().previous_time_used(), Some(now));
        assert_eq!(tgt.services().get("ST-1").map(Service::as_str), Some("https://app.example.org"));
        assert!(tgt.forget("ST-1"));
        assert!(!tgt.forget("ST-1"));
    }

    #[test]
    fn serde_round_trip_preserves_every_field() {
        let now = Utc::now();
        let mut tgt = TicketGrantingTicket::new(
            "TGT-1",
            authentication(),
            ExpirationPolicy::TicketGranting {
                max_time_to_live: Duration::from_secs(28_800),
                time_to_kill: Duration::from_secs(7_200),
            },
            now,
        );
        tgt.grant_service_ticket("ST-1", "https://a".into(), now);
        tgt.add_proxy_granting_ticket("PGT-1");
        let ticket = Ticket::from(tgt);

        let json = serde_json::to_vec(&ticket).unwrap();
        let decoded: Ticket = serde_json::from_slice(&json).unwrap();

        assert_eq!(decoded, ticket);
    }
}
