//! Per-name request budgets.
//!
//! One `governor` direct limiter is kept per `(kind, name)`. A budget of
//! `limit` requests per `interval` allows a burst of `limit` and replenishes
//! one request every `interval / limit`.

use crate::config::RateLimit;
use crate::error::RpcError;
use crate::locks;
use governor::clock::{Clock, DefaultClock};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as Governor};
use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// What a budget applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LimitKind {
    Method,
    Subscription,
}

impl fmt::Display for LimitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LimitKind::Method => write!(f, "method"),
            LimitKind::Subscription => write!(f, "subscription"),
        }
    }
}

/// Budgets keyed by `(kind, name)`.
pub struct RateLimiter {
    limiters: RwLock<HashMap<(LimitKind, String), Arc<DefaultDirectRateLimiter>>>,
    clock: DefaultClock,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            limiters: RwLock::new(HashMap::new()),
            clock: DefaultClock::default(),
        }
    }

    /// Install (or replace) the budget for `name`.
    pub fn configure(&self, kind: LimitKind, name: &str, limit: RateLimit) -> Result<(), RpcError> {
        let quota = quota(name, limit)?;
        debug!(
            "Rate limit for {} {}: {} per {:?}",
            kind, name, limit.limit, limit.interval
        );
        locks::write(&self.limiters).insert(
            (kind, name.to_string()),
            Arc::new(Governor::direct(quota)),
        );
        Ok(())
    }

    /// Reject budgets that cannot be turned into a quota, without installing
    /// anything.
    pub fn validate(name: &str, limit: RateLimit) -> Result<(), RpcError> {
        quota(name, limit).map(|_| ())
    }

    pub fn remove(&self, kind: LimitKind, name: &str) {
        locks::write(&self.limiters).remove(&(kind, name.to_string()));
    }

    pub fn is_configured(&self, kind: LimitKind, name: &str) -> bool {
        locks::read(&self.limiters).contains_key(&(kind, name.to_string()))
    }

    /// Consume one request of `name`'s budget. Unconfigured names always pass.
    pub fn check(&self, kind: LimitKind, name: &str) -> Result<(), RpcError> {
        let limiter = match locks::read(&self.limiters).get(&(kind, name.to_string())) {
            Some(limiter) => limiter.clone(),
            None => return Ok(()),
        };

        limiter.check().map_err(|not_until| {
            let wait = not_until.wait_time_from(self.clock.now());
            warn!("Rate limit exceeded for {} {}", kind, name);
            RpcError::RateLimitExceeded {
                name: name.to_string(),
                retry_after_ms: wait.as_millis() as u64,
            }
        })
    }
}

fn quota(name: &str, limit: RateLimit) -> Result<Quota, RpcError> {
    let invalid = || RpcError::Validation {
        message: format!(
            "Invalid rate limit for {}: {} per {:?}",
            name, limit.limit, limit.interval
        ),
    };
    let burst = NonZeroU32::new(limit.limit).ok_or_else(invalid)?;
    let period = limit.interval / limit.limit;
    Quota::with_period(period)
        .map(|quota| quota.allow_burst(burst))
        .ok_or_else(invalid)
}
