//! Collapses concurrent computations of the same key into one shared future.
//!
//! The first caller for a key starts the computation; everyone who asks while it is in flight
//! awaits the same result. Successes are memoized until [`ChokePoint::forget`] is called, failures
//! are not, so the next caller retries.

use dashmap::DashMap;
use futures::future::{FutureExt, LocalBoxFuture, Shared};
use std::hash::Hash;
use std::rc::Rc;
use std::sync::Arc;

pub struct ChokePoint<K, V, E> {
    cache: Rc<DashMap<K, CacheEntry<V, E>>>,
}

enum CacheEntry<V, E> {
    Computing(Shared<LocalBoxFuture<'static, Result<Arc<V>, E>>>),
    Completed(Arc<V>),
}

impl<K, V, E> Default for ChokePoint<K, V, E>
where
    K: Clone + Eq + Hash + 'static,
    V: 'static,
    E: Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V, E> ChokePoint<K, V, E>
where
    K: Clone + Eq + Hash + 'static,
    V: 'static,
    E: Clone + 'static,
{
    pub fn new() -> Self {
        Self {
            cache: Rc::new(DashMap::new()),
        }
    }

    /// Returns the value for `key`, running `compute` only if nothing is cached or in flight.
    pub async fn get<Fut>(&self, key: K, compute: Fut) -> Result<Arc<V>, E>
    where
        Fut: Future<Output = Result<V, E>> + 'static,
    {
        // the map guard must be gone before anything is awaited
        if let Some(pending) = self.lookup(&key) {
            return match pending {
                Lookup::Done(value) => Ok(value),
                Lookup::Waiting(future) => future.await,
            };
        }

        let key_clone = key.clone();
        let cache = Rc::clone(&self.cache);
        let wrapped = async move {
            let result = compute.await.map(Arc::new);
            match &result {
                Ok(value) => {
                    cache.insert(key_clone, CacheEntry::Completed(Arc::clone(value)));
                }
                Err(_) => {
                    cache.remove(&key_clone);
                }
            }
            result
        }
        .boxed_local()
        .shared();

        let future = match self.cache.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(entry) => match entry.get() {
                CacheEntry::Completed(value) => return Ok(Arc::clone(value)),
                CacheEntry::Computing(future) => future.clone(),
            },
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(CacheEntry::Computing(wrapped.clone()));
                wrapped
            }
        };

        future.await
    }

    fn lookup(&self, key: &K) -> Option<Lookup<V, E>> {
        let entry = self.cache.get(key)?;
        Some(match entry.value() {
            CacheEntry::Completed(value) => Lookup::Done(Arc::clone(value)),
            CacheEntry::Computing(future) => Lookup::Waiting(future.clone()),
        })
    }

    /// Drops a memoized value. An in-flight computation is left alone.
    pub fn forget(&self, key: &K) -> bool {
        self.cache
            .remove_if(key, |_, entry| matches!(entry, CacheEntry::Completed(_)))
            .is_some()
    }

    pub fn is_cached(&self, key: &K) -> bool {
        matches!(
            self.cache.get(key).as_deref(),
            Some(CacheEntry::Completed(_))
        )
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}

enum Lookup<V, E> {
    Done(Arc<V>),
    Waiting(Shared<LocalBoxFuture<'static, Result<Arc<V>, E>>>),
}
