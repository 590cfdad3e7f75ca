//! Subscription-system configuration

use serde::{Deserialize, Serialize};

/// Query parsing limits and defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryConfig {
    /// Maximum filters per subscription
    pub max_filters: usize,
    /// Whether custom (callable) filters are accepted
    pub allow_custom_filters: bool,
    /// Batch size applied when the query names none
    pub default_batch_size: usize,
    /// Upper bound on the per-query batch size
    pub max_batch_size: usize,
    /// Throttle applied when the query names none
    pub default_throttle_ms: u64,
    /// Upper bound on the per-query throttle
    pub max_throttle_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        QueryConfig {
            max_filters: 10,
            allow_custom_filters: true,
            default_batch_size: 50,
            max_batch_size: 500,
            default_throttle_ms: 0,
            max_throttle_ms: 60_000,
        }
    }
}

/// Permission-cache settings for the change filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FilteringConfig {
    /// Cache permission decisions at all
    pub enable_caching: bool,
    /// Decision lifetime
    pub cache_ttl_ms: u64,
    /// LRU capacity
    pub max_cache_size: usize,
}

impl Default for FilteringConfig {
    fn default() -> Self {
        FilteringConfig {
            enable_caching: true,
            cache_ttl_ms: 30_000,
            max_cache_size: 1_000,
        }
    }
}

/// Dispatcher batching and retry settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationsConfig {
    /// Flush a connection's batch at this size
    pub batch_size: usize,
    /// Flush a connection's batch at this age
    pub batch_timeout_ms: u64,
    /// Transport retries before a notification is dropped
    pub max_retries: u32,
    /// Linear backoff step between retries
    pub retry_delay_ms: u64,
}

impl Default for NotificationsConfig {
    fn default() -> Self {
        NotificationsConfig {
            batch_size: 25,
            batch_timeout_ms: 100,
            max_retries: 3,
            retry_delay_ms: 50,
        }
    }
}

/// Connection-registry caps and housekeeping intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionsConfig {
    /// Total connection cap
    pub max_connections: usize,
    /// Per-user connection cap
    pub max_connections_per_user: usize,
    /// Idle window after which a subscription is considered orphaned
    pub connection_timeout_ms: u64,
    /// Maintenance tick period
    pub cleanup_interval_ms: u64,
}

impl Default for ConnectionsConfig {
    fn default() -> Self {
        ConnectionsConfig {
            max_connections: 1_000,
            max_connections_per_user: 10,
            connection_timeout_ms: 300_000,
            cleanup_interval_ms: 60_000,
        }
    }
}

/// Subscription-count caps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LimitsConfig {
    /// Total live-subscription cap
    pub max_subscriptions_total: usize,
    /// Per-user live-subscription cap
    pub max_subscriptions_per_user: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_subscriptions_total: 10_000,
            max_subscriptions_per_user: 100,
        }
    }
}

/// Top-level subscription-system configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SubscriptionsConfig {
    /// Query parsing section
    pub query: QueryConfig,
    /// Permission-cache section
    pub filtering: FilteringConfig,
    /// Dispatcher section
    pub notifications: NotificationsConfig,
    /// Connection-registry section
    pub connections: ConnectionsConfig,
    /// Subscription caps
    pub limits: LimitsConfig,
}
