//! Cache engine configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::store::Store;

/// Predicate deciding whether a value is worth caching.
pub type CacheableFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Per-entry TTL derivation from `(key, value)`.
pub type TtlFn = Arc<dyn Fn(&str, &Value) -> Duration + Send + Sync>;

/// Entry weight derivation from `(key, value)`, in bytes.
///
/// The default weighs entries by their serialized JSON length; a custom
/// weigher supports values whose in-memory cost differs from their wire size.
pub type WeighFn = Arc<dyn Fn(&str, &Value) -> usize + Send + Sync>;

/// How entry TTLs are derived when `set` is called without an override.
#[derive(Clone, Default)]
pub enum TtlPolicy {
    /// Entries never expire
    #[default]
    Unbounded,
    /// Every entry gets the same TTL
    Fixed(Duration),
    /// TTL computed per entry from `(key, value)` at set time
    PerEntry(TtlFn),
}

impl fmt::Debug for TtlPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TtlPolicy::Unbounded => write!(f, "Unbounded"),
            TtlPolicy::Fixed(d) => write!(f, "Fixed({d:?})"),
            TtlPolicy::PerEntry(_) => write!(f, "PerEntry(..)"),
        }
    }
}

/// Configuration for a [`Cache`](crate::engine::Cache) instance.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use stratacache::CacheConfig;
///
/// let config = CacheConfig::new()
///     .with_max_weight(1_000_000)
///     .with_ttl(Duration::from_secs(300))
///     .with_stale_while_refreshing(true);
/// ```
#[derive(Clone)]
pub struct CacheConfig {
    /// Maximum total weight of the bounded tier
    pub max_weight: usize,
    /// Maximum total weight of the backup tier
    pub backup_max_weight: usize,
    /// Default TTL policy (overridable per `set` call)
    pub ttl: TtlPolicy,
    /// Return the current local value immediately while a refresh runs
    pub return_stale_while_refreshing: bool,
    /// Values failing this predicate bypass storage (default: `null` values)
    pub cacheable: CacheableFn,
    /// Custom entry weigher; serialized JSON byte length when absent
    pub weigher: Option<WeighFn>,
    /// Backing stores; at most one should flag itself primary
    pub stores: Vec<Arc<dyn Store>>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_weight: 300_000,
            backup_max_weight: 600_000,
            ttl: TtlPolicy::Unbounded,
            return_stale_while_refreshing: true,
            cacheable: Arc::new(|value| !value.is_null()),
            weigher: None,
            stores: Vec::new(),
        }
    }
}

impl CacheConfig {
    /// Create a configuration with default limits and no stores.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the bounded tier's maximum total weight.
    pub fn with_max_weight(mut self, weight: usize) -> Self {
        self.max_weight = weight;
        self
    }

    /// Set the backup tier's maximum total weight.
    pub fn with_backup_max_weight(mut self, weight: usize) -> Self {
        self.backup_max_weight = weight;
        self
    }

    /// Apply a fixed TTL to every entry.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = TtlPolicy::Fixed(ttl);
        self
    }

    /// Derive TTLs per entry from `(key, value)`.
    pub fn with_ttl_fn(
        mut self,
        ttl: impl Fn(&str, &Value) -> Duration + Send + Sync + 'static,
    ) -> Self {
        self.ttl = TtlPolicy::PerEntry(Arc::new(ttl));
        self
    }

    /// Control the stale-while-revalidate read policy.
    pub fn with_stale_while_refreshing(mut self, enabled: bool) -> Self {
        self.return_stale_while_refreshing = enabled;
        self
    }

    /// Replace the cacheable-value predicate.
    pub fn with_cacheable(
        mut self,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.cacheable = Arc::new(predicate);
        self
    }

    /// Replace the entry weigher.
    pub fn with_weigher(
        mut self,
        weigher: impl Fn(&str, &Value) -> usize + Send + Sync + 'static,
    ) -> Self {
        self.weigher = Some(Arc::new(weigher));
        self
    }

    /// Add a backing store.
    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.stores.push(store);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn default_config() {
        let config = CacheConfig::default();
        assert_eq!(config.max_weight, 300_000);
        assert_eq!(config.backup_max_weight, 600_000);
        assert!(config.return_stale_while_refreshing);
        assert!(config.stores.is_empty());
        assert!(matches!(config.ttl, TtlPolicy::Unbounded));
    }

    #[test]
    fn default_cacheable_rejects_null() {
        let config = CacheConfig::default();
        assert!((config.cacheable)(&json!("bar")));
        assert!((config.cacheable)(&json!(0)));
        assert!((config.cacheable)(&json!(false)));
        assert!(!(config.cacheable)(&Value::Null));
    }

    #[test]
    fn builder_chain() {
        let config = CacheConfig::new()
            .with_max_weight(1_000)
            .with_backup_max_weight(4_000)
            .with_ttl(Duration::from_secs(60))
            .with_stale_while_refreshing(false)
            .with_cacheable(|v| v.is_string());

        assert_eq!(config.max_weight, 1_000);
        assert_eq!(config.backup_max_weight, 4_000);
        assert!(!config.return_stale_while_refreshing);
        assert!(matches!(config.ttl, TtlPolicy::Fixed(d) if d == Duration::from_secs(60)));
        assert!((config.cacheable)(&json!("s")));
        assert!(!(config.cacheable)(&json!(1)));
    }

    #[test]
    fn ttl_fn_is_evaluated_with_key_and_value() {
        let config = CacheConfig::new()
            .with_ttl_fn(|_, value| {
                if value == &json!("bar") {
                    Duration::from_secs(60)
                } else {
                    Duration::from_secs(120)
                }
            });

        match &config.ttl {
            TtlPolicy::PerEntry(f) => {
                assert_eq!(f("foo", &json!("bar")), Duration::from_secs(60));
                assert_eq!(f("foo", &json!("baz")), Duration::from_secs(120));
            }
            other => panic!("expected PerEntry policy, got {other:?}"),
        }
    }
}
