use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant, SystemTime};

use cached::Cached;
use cached::stores::{CanExpire, ExpiringValueCache};
use tracing::debug;

use crate::github::CopilotAccessToken;
use crate::headers::sha256_hex;

/// Access tokens are dropped this long before the expiry Copilot reports.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// Upper bound on distinct user tokens held at once; the least recently used
/// entry is evicted past it.
const MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone)]
struct Entry {
    token: String,
    valid_until: Instant,
}

impl CanExpire for Entry {
    fn is_expired(&self) -> bool {
        self.valid_until <= Instant::now()
    }
}

/// Maps a GitHub user token to its exchanged Copilot access token.
///
/// Keys are SHA-256 digests of the user token. Each entry lives for the
/// configured ttl, or until shortly before the access token's own expiry,
/// whichever comes first.
pub struct TokenCache {
    ttl: Duration,
    store: Mutex<ExpiringValueCache<String, Entry>>,
}

impl std::fmt::Debug for TokenCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCache")
            .field("ttl", &self.ttl)
            .field("len", &self.len())
            .finish()
    }
}

impl TokenCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            store: Mutex::new(ExpiringValueCache::with_size(MAX_ENTRIES)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ExpiringValueCache<String, Entry>> {
        match self.store.lock() {
            Ok(g) => g,
            Err(e) => e.into_inner(),
        }
    }

    fn key(user_token: &str) -> String {
        sha256_hex(user_token.as_bytes())
    }

    fn lifetime_for(&self, token: &CopilotAccessToken, now: SystemTime) -> Duration {
        match token.expires_at {
            Some(expires_at) => {
                let remaining = expires_at
                    .duration_since(now)
                    .unwrap_or(Duration::ZERO)
                    .saturating_sub(EXPIRY_MARGIN);
                remaining.min(self.ttl)
            }
            None => self.ttl,
        }
    }

    /// Expired entries read as misses and are dropped.
    pub fn get(&self, user_token: &str) -> Option<String> {
        let key = Self::key(user_token);
        let mut store = self.lock();
        let hit = store.cache_get(&key).map(|e| e.token.clone());
        if hit.is_none() {
            store.cache_remove(&key);
        }
        hit
    }

    /// Returns `false` when the token is already too close to expiry to be worth keeping.
    pub fn insert(&self, user_token: &str, token: &CopilotAccessToken) -> bool {
        let lifetime = self.lifetime_for(token, SystemTime::now());
        if lifetime.is_zero() {
            return false;
        }
        self.insert_entry(
            Self::key(user_token),
            Entry {
                token: token.token.clone(),
                valid_until: Instant::now() + lifetime,
            },
        );
        true
    }

    fn insert_entry(&self, key: String, entry: Entry) {
        self.lock().cache_set(key, entry);
    }

    pub fn remove(&self, user_token: &str) -> bool {
        self.lock().cache_remove(&Self::key(user_token)).is_some()
    }

    /// Drop every expired entry; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let mut store = self.lock();
        let before = store.cache_size();
        store.flush();
        before - store.cache_size()
    }

    pub fn len(&self) -> usize {
        self.lock().cache_size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Periodically purge expired entries. The task ends once the cache is dropped.
    pub fn spawn_sweeper(cache: &Arc<TokenCache>, every: Duration) -> tokio::task::JoinHandle<()> {
        let weak: Weak<TokenCache> = Arc::downgrade(cache);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cache) = weak.upgrade() else {
                    break;
                };
                let removed = cache.purge_expired();
                if removed > 0 {
                    debug!("token cache sweep removed {} expired entries", removed);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn access(token: &str, expires_in: Option<Duration>) -> CopilotAccessToken {
        CopilotAccessToken {
            token: token.to_string(),
            expires_at: expires_in.map(|d| SystemTime::now() + d),
        }
    }

    fn stale(token: &str) -> Entry {
        Entry {
            token: token.to_string(),
            valid_until: Instant::now() - Duration::from_secs(1),
        }
    }

    #[test]
    fn hit_and_miss() {
        let cache = TokenCache::new(Duration::from_secs(60));
        assert!(cache.insert("ghu_a", &access("acc-a", None)));
        assert_eq!(cache.get("ghu_a").as_deref(), Some("acc-a"));
        assert_eq!(cache.get("ghu_b"), None);
    }

    #[test]
    fn expired_entry_reads_as_miss_and_is_dropped() {
        let cache = TokenCache::new(Duration::from_secs(60));
        cache.insert_entry(TokenCache::key("ghu_a"), stale("acc-a"));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("ghu_a"), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn entry_expiry_follows_valid_until() {
        assert!(stale("x").is_expired());
        let fresh = Entry {
            token: "x".to_string(),
            valid_until: Instant::now() + Duration::from_secs(60),
        };
        assert!(!fresh.is_expired());
    }

    #[test]
    fn lifetime_is_capped_by_reported_expiry() {
        let cache = TokenCache::new(Duration::from_secs(14 * 60));
        let now = SystemTime::now();
        let token = CopilotAccessToken {
            token: "acc".to_string(),
            expires_at: Some(now + Duration::from_secs(5 * 60)),
        };
        assert_eq!(cache.lifetime_for(&token, now), Duration::from_secs(4 * 60));

        let long_lived = CopilotAccessToken {
            token: "acc".to_string(),
            expires_at: Some(now + Duration::from_secs(60 * 60)),
        };
        assert_eq!(
            cache.lifetime_for(&long_lived, now),
            Duration::from_secs(14 * 60)
        );
    }

    #[test]
    fn nearly_expired_tokens_are_not_stored() {
        let cache = TokenCache::new(Duration::from_secs(60));
        assert!(!cache.insert("ghu_a", &access("acc", Some(Duration::from_secs(30)))));
        assert!(cache.is_empty());
    }

    #[test]
    fn remove_evicts() {
        let cache = TokenCache::new(Duration::from_secs(60));
        cache.insert("ghu_a", &access("acc", None));
        assert!(cache.remove("ghu_a"));
        assert!(!cache.remove("ghu_a"));
        assert_eq!(cache.get("ghu_a"), None);
    }

    #[test]
    fn purge_only_drops_expired() {
        let cache = TokenCache::new(Duration::from_secs(60));
        cache.insert("ghu_a", &access("a", None));
        cache.insert("ghu_b", &access("b", Some(Duration::from_secs(10 * 60))));
        assert_eq!(cache.purge_expired(), 0);
        assert_eq!(cache.len(), 2);

        cache.insert_entry(TokenCache::key("ghu_c"), stale("c"));
        cache.insert_entry(TokenCache::key("ghu_d"), stale("d"));
        assert_eq!(cache.purge_expired(), 2);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("ghu_a").as_deref(), Some("a"));
    }

    #[test]
    fn keys_are_digests_not_raw_tokens() {
        let cache = TokenCache::new(Duration::from_secs(60));
        cache.insert("ghu_secret", &access("acc", None));
        let mut store = cache.lock();
        assert!(store.cache_get("ghu_secret").is_none());
        assert!(store.cache_get(&sha256_hex(b"ghu_secret")).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_stops_when_cache_is_dropped() {
        let cache = Arc::new(TokenCache::new(Duration::from_secs(60)));
        let handle = TokenCache::spawn_sweeper(&cache, Duration::from_secs(1));
        drop(cache);
        tokio::time::advance(Duration::from_secs(2)).await;
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("sweeper exits")
            .expect("join");
    }
}
