//! # stratacache
//!
//! A multi-tier cache with pluggable backing stores and remote-state
//! reconciliation.
//!
//! Values live in a bounded, weight-limited in-memory tier; entries
//! leaving it through eviction or expiry drop into a backup tier that
//! serves as a last-good fallback for read-through fetchers. Zero or more
//! [`Store`] backends persist records behind the memory tiers, and when
//! one of them is flagged primary, every instance sharing it reconciles
//! its local state against the primary's per-key timestamps: remote
//! changes are pulled, remote deletions are honored, and local mutations
//! are flushed back in coalesced batches.
//!
//! ### Modules
//!
//! - [`engine`]: the [`Cache`] itself — get/set/wrap/del and lifecycle
//! - [`config`]: [`CacheConfig`] builder, TTL policy, weigher, predicate
//! - [`store`]: the [`Store`] contract plus the file and memory backends
//! - [`reconcile`]: remote-state classification ([`RemoteState`])
//! - [`record`]: the persisted wire types ([`Record`], [`Metadata`])
//! - [`error`]: [`CacheError`] and [`StoreError`]
//! - [`glob`]: glob-style key pattern matching
//! - [`logging`]: tracing subscriber setup for host processes
//!
//! ### Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use stratacache::{Cache, CacheConfig, FileStore};
//!
//! # async fn demo() -> Result<(), stratacache::CacheError> {
//! let store = Arc::new(FileStore::new("/var/cache/strata").with_primary(true));
//! let cache = Cache::new(CacheConfig::new().with_store(store));
//! cache.init().await?;
//!
//! cache.set("greeting", json!("hello"), None).await?;
//! assert_eq!(cache.get("greeting").await?, Some(json!("hello")));
//! cache.wait_for_flush().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod engine;
pub mod error;
pub mod glob;
pub mod logging;
pub mod reconcile;
pub mod record;
pub mod store;
pub mod time;

mod flush;
mod tier;

pub use config::{CacheConfig, CacheableFn, TtlFn, TtlPolicy, WeighFn};
pub use engine::Cache;
pub use error::{CacheError, StoreError};
pub use reconcile::RemoteState;
pub use record::{Metadata, Record};
pub use store::{FileStore, MemoryStore, Store};
