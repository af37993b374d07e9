//! Time-bucketed validated-user cache.
//!
//! Entries are never expired explicitly. The key carries a time bucket that
//! advances every `duration` seconds, so once the bucket rolls over the old
//! entries are simply no longer addressed and age out through LRU eviction.

use crate::user::ValidatedUser;
use lru::LruCache;
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Key of one cached validation result.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    scope: String,
    login: String,
    raw_token: String,
    bucket: u64,
}

impl fmt::Debug for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheKey")
            .field("scope", &self.scope)
            .field("login", &self.login)
            .field("raw_token", &"[REDACTED]")
            .field("bucket", &self.bucket)
            .finish()
    }
}

impl CacheKey {
    #[must_use]
    pub fn new(scope: &str, login: &str, raw_token: &str, bucket: u64) -> Self {
        Self {
            scope: scope.to_string(),
            login: login.to_string(),
            raw_token: raw_token.to_string(),
            bucket,
        }
    }

    #[must_use]
    pub fn bucket(&self) -> u64 {
        self.bucket
    }
}

/// `ceil(ceil(now) / duration)` for `now` in Unix epoch seconds.
///
/// A zero duration is treated as one second.
#[must_use]
pub fn time_bucket(now: f64, duration: Duration) -> u64 {
    let duration_secs = duration.as_secs().max(1);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let now_secs = now.ceil().max(0.0) as u64;
    now_secs.div_ceil(duration_secs)
}

/// Bounded LRU map from [`CacheKey`] to validated users.
///
/// Shared by every concurrent validation. Concurrent misses on the same key
/// may both store; the later write wins and both results are equivalent.
pub struct AuthCache {
    entries: Mutex<LruCache<CacheKey, Arc<ValidatedUser>>>,
    duration: Duration,
}

impl fmt::Debug for AuthCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthCache")
            .field("duration", &self.duration)
            .finish_non_exhaustive()
    }
}

impl AuthCache {
    /// Create a cache holding at most `capacity` users (minimum one).
    #[must_use]
    pub fn new(capacity: usize, duration: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            duration,
        }
    }

    /// Bucket width.
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Build the key for a lookup at `now` (Unix epoch seconds).
    #[must_use]
    pub fn key_at(&self, scope: &str, login: &str, raw_token: &str, now: f64) -> CacheKey {
        CacheKey::new(scope, login, raw_token, time_bucket(now, self.duration))
    }

    /// Look up a user, marking it most recently used.
    pub async fn get(&self, key: &CacheKey) -> Option<Arc<ValidatedUser>> {
        let mut entries = self.entries.lock().await;
        let hit = entries.get(key).cloned();
        debug!(
            target: "auth_gateway.cache",
            login = %key.login,
            bucket = key.bucket,
            hit = hit.is_some(),
            "Validated user cache lookup"
        );
        hit
    }

    /// Store a user, evicting the least recently used entry when full.
    pub async fn insert(&self, key: CacheKey, user: Arc<ValidatedUser>) {
        let mut entries = self.entries.lock().await;
        // push also hands back the previous value of a replaced key
        let replaced = key.clone();
        if let Some((evicted, _)) = entries.push(key, user).filter(|(k, _)| *k != replaced) {
            debug!(
                target: "auth_gateway.cache",
                login = %evicted.login,
                "Evicted validated user"
            );
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
