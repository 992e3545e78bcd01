//! Centralized configuration for liverpc.
//!
//! Constant holders for the registry, IPC and HTTP transports and the client
//! query cache, plus the small value types passed through procedure and
//! registry setup.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Registry naming and built-in procedure configuration.
pub struct RegistryConfig;

impl RegistryConfig {
    /// Names starting with this prefix are reserved for built-ins.
    pub const RESERVED_PREFIX: &'static str = "__";
    pub const HEALTH_METHOD: &'static str = "__health";
    pub const MIRROR_NAME_METHOD: &'static str = "__mirror_name";
    pub const SUBSCRIBE_METHOD: &'static str = "__subscribe";
    pub const UNSUBSCRIBE_METHOD: &'static str = "__unsubscribe";
    /// Method name of server-to-client publication notifications.
    pub const PUBLICATION_NOTIFICATION: &'static str = "publication";
    pub const NAME_SEPARATOR: char = '.';
}

/// Local IPC transport configuration.
pub struct IpcConfig;

impl IpcConfig {
    pub const MAX_IPC_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
    pub const MAX_IPC_CONNECTIONS: usize = 64;
    pub const IPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
}

/// HTTP adapter configuration.
pub struct HttpConfig;

impl HttpConfig {
    pub const MAX_CONCURRENT_REQUESTS: usize = 256;
    /// Response header carrying the mirror container of a subscription.
    pub const MIRROR_HEADER: &'static str = "x-liverpc-mirror";
}

/// Client-side query cache configuration.
pub struct QueryConfig;

impl QueryConfig {
    pub const DEFAULT_TTL: Duration = Duration::from_secs(300);
    pub const MAX_CAPACITY: u64 = 1_000;
}

/// Request budget for a procedure or publication.
///
/// At most `limit` invocations are admitted per `interval`. On the wire the
/// interval is expressed in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    #[serde(with = "interval_ms")]
    pub interval: Duration,
    pub limit: u32,
}

impl RateLimit {
    pub fn new(interval: Duration, limit: u32) -> Self {
        Self { interval, limit }
    }
}

mod interval_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(interval: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(interval.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// What a registry does when a name is registered twice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverwritePolicy {
    /// Last registration wins; the replacement is logged.
    #[default]
    Replace,
    /// The second registration fails with `DuplicateName`.
    Reject,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_interval_is_milliseconds() {
        let limit = RateLimit::new(Duration::from_secs(2), 5);
        let json = serde_json::to_value(limit).unwrap();
        assert_eq!(json, serde_json::json!({"interval": 2000, "limit": 5}));

        let parsed: RateLimit = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, limit);
    }

    #[test]
    fn test_default_overwrite_policy() {
        assert_eq!(OverwritePolicy::default(), OverwritePolicy::Replace);
    }

    #[test]
    fn test_reserved_names_share_prefix() {
        for name in [
            RegistryConfig::HEALTH_METHOD,
            RegistryConfig::MIRROR_NAME_METHOD,
            RegistryConfig::SUBSCRIBE_METHOD,
            RegistryConfig::UNSUBSCRIBE_METHOD,
        ] {
            assert!(name.starts_with(RegistryConfig::RESERVED_PREFIX));
        }
    }
}
