use crate::prelude::*;
use auto_impl::auto_impl;
use lru_cache::LruCache;
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Identity lookups live outside the core; this is the seam they plug into.
#[auto_impl(&, Arc)]
pub trait UserResolver: Send + Sync {
    /// `Ok(None)` when the identity provider does not know the user;
    /// `Err` for transport failures (never cached).
    fn resolve(&self, id: &UserId) -> Result<Option<User>>;
}

/// Failed lookups are remembered this long before the resolver is asked
/// again.
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(12 * 60 * 60);

enum Slot {
    Found(User),
    Missing(Instant),
}

/// Process-wide user lookup cache: LRU-bounded, with a TTL on negative
/// entries so deprovisioned users don't hammer the identity provider on
/// every permission walk.
pub struct CachingUserResolver<R> {
    inner: R,
    cache: Mutex<LruCache<UserId, Slot>>,
    negative_ttl: Duration,
}

impl<R: UserResolver> CachingUserResolver<R> {
    pub fn new(inner: R, capacity: usize) -> CachingUserResolver<R> {
        CachingUserResolver {
            inner,
            cache: Mutex::new(LruCache::new(capacity)),
            negative_ttl: DEFAULT_NEGATIVE_TTL,
        }
    }

    pub fn with_negative_ttl(mut self, ttl: Duration) -> CachingUserResolver<R> {
        self.negative_ttl = ttl;
        self
    }
}

impl<R: UserResolver> UserResolver for CachingUserResolver<R> {
    fn resolve(&self, id: &UserId) -> Result<Option<User>> {
        enum Hit {
            Found(User),
            MissingFresh,
            Stale,
        }
        let hit = {
            let mut cache = self.cache.lock();
            match cache.get_mut(id) {
                Some(Slot::Found(user)) => Hit::Found(user.clone()),
                Some(Slot::Missing(at)) => {
                    if at.elapsed() < self.negative_ttl {
                        Hit::MissingFresh
                    } else {
                        Hit::Stale
                    }
                }
                None => Hit::Stale,
            }
        };
        match hit {
            Hit::Found(user) => return Ok(Some(user)),
            Hit::MissingFresh => return Ok(None),
            Hit::Stale => {}
        }

        // resolve outside the lock; a dogpile here is harmless
        let resolved = self.inner.resolve(id)?;
        let mut cache = self.cache.lock();
        match &resolved {
            Some(user) => {
                cache.insert(id.clone(), Slot::Found(user.clone()));
            }
            None => {
                debug!(user = %id.opaque_id, "caching failed user lookup");
                cache.insert(id.clone(), Slot::Missing(Instant::now()));
            }
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        known: Option<User>,
        calls: AtomicUsize,
    }

    impl UserResolver for Counting {
        fn resolve(&self, _id: &UserId) -> Result<Option<User>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.known.clone())
        }
    }

    fn uid(name: &str) -> UserId {
        UserId::new(name, "https://idp.test", UserType::Primary)
    }

    #[test]
    fn test_positive_hits_are_cached() {
        let inner = Counting {
            known: Some(User::new(uid("u1"), "u1")),
            calls: AtomicUsize::new(0),
        };
        let cache = CachingUserResolver::new(inner, 8);

        assert!(cache.resolve(&uid("u1")).unwrap().is_some());
        assert!(cache.resolve(&uid("u1")).unwrap().is_some());
        assert_eq!(cache.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_negative_entries_respect_ttl() {
        let inner = Counting {
            known: None,
            calls: AtomicUsize::new(0),
        };
        let cache = CachingUserResolver::new(inner, 8);

        assert!(cache.resolve(&uid("ghost")).unwrap().is_none());
        assert!(cache.resolve(&uid("ghost")).unwrap().is_none());
        // within the TTL, only the first lookup hits the resolver
        assert_eq!(cache.inner.calls.load(Ordering::SeqCst), 1);

        let cache = cache.with_negative_ttl(Duration::ZERO);
        assert!(cache.resolve(&uid("ghost")).unwrap().is_none());
        assert_eq!(cache.inner.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_lru_eviction_is_bounded() {
        let inner = Counting {
            known: Some(User::new(uid("x"), "x")),
            calls: AtomicUsize::new(0),
        };
        let cache = CachingUserResolver::new(inner, 2);

        cache.resolve(&uid("a")).unwrap();
        cache.resolve(&uid("b")).unwrap();
        cache.resolve(&uid("c")).unwrap(); // evicts "a"
        cache.resolve(&uid("a")).unwrap();
        assert_eq!(cache.inner.calls.load(Ordering::SeqCst), 4);
    }
}
