//! Expiration policies.
//!
//! A policy is attached to a ticket when it is created and never changes afterwards. It is a
//! pure function of the ticket's lifecycle state and the current instant, so two nodes with
//! the same clock agree on whether a ticket is expired.
//!
//! All time bounds are exclusive: a ticket created at `t` with a 60 second bound is still
//! valid at exactly `t + 60s` and expired one instant later.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{clock::checked_add, ticket::TicketState};

/// Decides whether a ticket is still valid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExpirationPolicy {
    /// The ticket never expires on its own.
    #[default]
    NeverExpires,

    /// Expires once `time_to_kill` has elapsed since creation, regardless of use.
    HardTimeout {
        /// Lifetime measured from creation.
        #[serde(with = "humantime_serde")]
        time_to_kill: Duration,
    },

    /// Expires after `max_uses` uses or once `time_to_kill` has elapsed since creation,
    /// whichever comes first.
    MultiUseOrTimeout {
        /// Number of permitted uses.
        max_uses: u32,
        /// Lifetime measured from creation.
        #[serde(with = "humantime_serde")]
        time_to_kill: Duration,
    },

    /// Expires after `time_to_kill` without use.
    Timeout {
        /// Idle lifetime measured from the last use.
        #[serde(with = "humantime_serde")]
        time_to_kill: Duration,
    },

    /// Expires after `max_time_to_live` since creation or `time_to_kill` without use.
    TicketGranting {
        /// Hard lifetime measured from creation.
        #[serde(with = "humantime_serde")]
        max_time_to_live: Duration,
        /// Idle lifetime measured from the last use.
        #[serde(with = "humantime_serde")]
        time_to_kill: Duration,
    },
}

impl ExpirationPolicy {
    /// Single-use service ticket policy.
    #[must_use]
    pub fn single_use(time_to_kill: Duration) -> Self {
        Self::MultiUseOrTimeout { max_uses: 1, time_to_kill }
    }

    /// Returns `true` if a ticket in `state` is expired at `now`.
    ///
    /// The use count is compared as recorded: a ticket at its last permitted use has not yet
    /// consumed it, so it is still valid.
    #[must_use]
    pub fn is_expired(&self, state: &TicketState, now: DateTime<Utc>) -> bool {
        if let Self::MultiUseOrTimeout { max_uses, .. } = self
            && state.count_of_uses() >= *max_uses
        {
            return true;
        }
        self.expiration_instant(state).is_some_and(|deadline| now > deadline)
    }

    /// The last instant at which the ticket is valid, ignoring use counts.
    ///
    /// `None` means the policy imposes no time bound (or the bound overflows the calendar).
    #[must_use]
    pub fn expiration_instant(&self, state: &TicketState) -> Option<DateTime<Utc>> {
        match *self {
            Self::NeverExpires => None,
            Self::HardTimeout { time_to_kill } | Self::MultiUseOrTimeout { time_to_kill, .. } => {
                checked_add(state.creation_time(), time_to_kill)
            },
            Self::Timeout { time_to_kill } => checked_add(state.last_time_used(), time_to_kill),
            Self::TicketGranting { max_time_to_live, time_to_kill } => {
                let hard = checked_add(state.creation_time(), max_time_to_live);
                let idle = checked_add(state.last_time_used(), time_to_kill);
                match (hard, idle) {
                    (Some(hard), Some(idle)) => Some(hard.min(idle)),
                    (hard, idle) => hard.or(idle),
                }
            },
        }
    }

    /// Lifetime hint for stores with native TTL support.
    #[must_use]
    pub fn time_to_live(&self) -> Option<Duration> {
        match *self {
            Self::NeverExpires => None,
            Self::HardTimeout { time_to_kill }
            | Self::MultiUseOrTimeout { time_to_kill, .. }
            | Self::Timeout { time_to_kill } => Some(time_to_kill),
            Self::TicketGranting { max_time_to_live, .. } => Some(max_time_to_live),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use chrono::TimeDelta;
    use proptest::prelude::*;

    use super::*;

    fn state(policy: ExpirationPolicy, created: DateTime<Utc>) -> TicketState {
        TicketState::new("ST-1", created, policy)
    }

    #[test]
    fn never_expires() {
        let now = Utc::now();
        let mut s = state(ExpirationPolicy::NeverExpires, now);
        for _ in 0..100 {
            s.record_use(now);
        }
        assert!(!ExpirationPolicy::NeverExpires.is_expired(&s, now + TimeDelta::days(3650)));
        assert_eq!(ExpirationPolicy::NeverExpires.time_to_live(), None);
    }

    #[test]
    fn hard_timeout_is_exclusive() {
        let policy = ExpirationPolicy::HardTimeout { time_to_kill: Duration::from_secs(60) };
        let now = Utc::now();
        let s = state(policy, now);

        assert!(!policy.is_expired(&s, now + TimeDelta::seconds(60)));
        assert!(policy.is_expired(&s, now + TimeDelta::seconds(60) + TimeDelta::nanoseconds(1)));
    }

    #[test]
    fn multi_use_boundary() {
        let policy = ExpirationPolicy::single_use(Duration::from_secs(60));
        let now = Utc::now();
        let mut s = state(policy, now);

        assert!(!policy.is_expired(&s, now), "valid immediately after creation");

        s.record_use(now);
        assert!(policy.is_expired(&s, now), "invalid after one recorded use");

        let fresh = state(policy, now);
        assert!(policy.is_expired(&fresh, now + TimeDelta::seconds(61)), "invalid after 61s");
    }

    #[test]
    fn last_permitted_use_is_not_expired() {
        let policy = ExpirationPolicy::MultiUseOrTimeout {
            max_uses: 3,
            time_to_kill: Duration::from_secs(60),
        };
        let now = Utc::now();
        let mut s = state(policy, now);
        s.record_use(now);
        s.record_use(now);
        assert!(!policy.is_expired(&s, now));
        s.record_use(now);
        assert!(policy.is_expired(&s, now));
    }

    #[test]
    fn sliding_timeout_extends_with_use() {
        let policy = ExpirationPolicy::Timeout { time_to_kill: Duration::from_secs(30) };
        let now = Utc::now();
        let mut s = state(policy, now);

        s.record_use(now + TimeDelta::seconds(20));
        assert!(!policy.is_expired(&s, now + TimeDelta::seconds(45)));
        assert!(policy.is_expired(&s, now + TimeDelta::seconds(51)));
    }

    #[test]
    fn ticket_granting_takes_earliest_bound() {
        let policy = ExpirationPolicy::TicketGranting {
            max_time_to_live: Duration::from_secs(100),
            time_to_kill: Duration::from_secs(30),
        };
        let now = Utc::now();
        let mut s = state(policy, now);

        assert_eq!(policy.expiration_instant(&s), Some(now + TimeDelta::seconds(30)));
        for offset in [25, 50, 75, 95] {
            s.record_use(now + TimeDelta::seconds(offset));
        }
        assert_eq!(policy.expiration_instant(&s), Some(now + TimeDelta::seconds(100)));
        assert!(policy.is_expired(&s, now + TimeDelta::seconds(101)));
    }

    #[test]
    fn policy_serde_uses_humantime() {
        let json = r#"{"type":"multi_use_or_timeout","max_uses":1,"time_to_kill":"10s"}"#;
        let policy: ExpirationPolicy = serde_json::from_str(json).unwrap();
        assert_eq!(policy, ExpirationPolicy::single_use(Duration::from_secs(10)));
    }

    proptest! {
        #[test]
        fn hard_timeout_boundary(ttl_secs in 1u64..1_000_000, probe in 0i64..2_000_000) {
            let policy = ExpirationPolicy::HardTimeout { time_to_kill: Duration::from_secs(ttl_secs) };
            let now = Utc::now();
            let s = state(policy, now);
            let expected = probe > ttl_secs as i64;
            prop_assert_eq!(policy.is_expired(&s, now + TimeDelta::seconds(probe)), expected);
        }
    }
}
