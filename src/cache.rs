use std::sync::Arc;
use std::time::Instant;

use hickory_proto::op::Message;
use moka::sync::Cache;
use once_cell::sync::OnceCell;
use tracing::info;

use crate::error::CacheError;
use crate::key::CacheKey;

/// Stale answers are served with this TTL while upstream is unreachable.
pub const STALE_RESPONSE_TTL: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct CachedEntry {
    pub expiration: Instant,
    /// Immutable snapshot; readers clone before touching it.
    pub message: Arc<Message>,
}

impl CachedEntry {
    pub fn new(message: Message, expiration: Instant) -> Self {
        Self {
            expiration,
            message: Arc::new(message),
        }
    }

    #[inline]
    pub fn is_fresh(&self, now: Instant) -> bool {
        now < self.expiration
    }
}

/// 容量受限的响应缓存 / Capacity-bounded response store, evicts on its own when full.
///
/// No time-based expiry is configured: expired entries must stay readable for
/// stale serving until capacity pressure pushes them out.
pub type DnsCache = Cache<CacheKey, CachedEntry>;

#[inline]
pub fn new_cache(max_capacity: usize) -> Result<DnsCache, CacheError> {
    if max_capacity == 0 {
        return Err(CacheError::InvalidCapacity(max_capacity));
    }
    Ok(Cache::builder().max_capacity(max_capacity as u64).build())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Uninitialized,
    Ready { capacity: u64 },
}

/// Process-wide response cache, built lazily by the first writer.
///
/// Construction happens at most once successfully. Writers racing on first
/// use block on the cell while one of them builds; the others then observe
/// the winner's store, or retry construction themselves if it failed.
pub struct SharedCache {
    store: OnceCell<DnsCache>,
}

static GLOBAL: SharedCache = SharedCache::new();

/// The single cache instance used by the proxy.
#[inline]
pub fn global() -> &'static SharedCache {
    &GLOBAL
}

impl SharedCache {
    pub const fn new() -> Self {
        Self {
            store: OnceCell::new(),
        }
    }

    /// The store, if some writer already built it.
    #[inline]
    pub fn get(&self) -> Option<&DnsCache> {
        self.store.get()
    }

    /// Return the store, building it with `capacity` when nobody has yet.
    /// A capacity passed after construction is ignored.
    pub fn get_or_init(&self, capacity: usize) -> Result<&DnsCache, CacheError> {
        self.store.get_or_try_init(|| {
            let store = new_cache(capacity)?;
            info!(target = "cache", capacity, "response cache constructed");
            Ok(store)
        })
    }

    pub fn state(&self) -> HandleState {
        match self.store.get() {
            Some(store) => HandleState::Ready {
                capacity: store.policy().max_capacity().unwrap_or_default(),
            },
            None => HandleState::Uninitialized,
        }
    }
}

impl Default for SharedCache {
    fn default() -> Self {
        Self::new()
    }
}
