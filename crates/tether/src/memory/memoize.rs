//! Memoizing wrapper over [`MemoryCache`]

use std::marker::PhantomData;
use std::time::Duration;

use blake2::{Blake2s256, Digest};
use log::warn;
use serde::Serialize;

use super::cache::MemoryCache;

/// A function whose results are cached by argument
///
/// Created by [`MemoryCache::memoize`]. Results are keyed by a BLAKE2 hash
/// of the caller-chosen name, the function's type name and the JSON form of
/// the arguments.
pub struct Memoized<'a, A, V, F> {
    cache: &'a MemoryCache<V>,
    name: String,
    ttl: Option<Duration>,
    func: F,
    _args: PhantomData<fn(&A)>,
}

impl<V: Clone + Serialize> MemoryCache<V> {
    pub fn memoize<A, F>(&self, name: &str, ttl: Option<Duration>, func: F) -> Memoized<'_, A, V, F>
    where
        A: Serialize,
        F: Fn(&A) -> V,
    {
        Memoized {
            cache: self,
            name: name.to_string(),
            ttl,
            func,
            _args: PhantomData,
        }
    }
}

impl<A, V, F> Memoized<'_, A, V, F>
where
    A: Serialize,
    V: Clone + Serialize,
    F: Fn(&A) -> V,
{
    /// Cache key for an argument tuple, None if it cannot be serialized
    pub fn key_for(&self, args: &A) -> Option<String> {
        let encoded = match serde_json::to_vec(args) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("[MEMORY] Arguments for {} are not serializable: {}", self.name, e);
                return None;
            }
        };

        let mut hasher = Blake2s256::new();
        hasher.update(self.name.as_bytes());
        hasher.update(b"\0");
        hasher.update(std::any::type_name::<F>().as_bytes());
        hasher.update(b"\0");
        hasher.update(&encoded);
        Some(format!("memo:{}", hex::encode(hasher.finalize())))
    }

    /// Return the cached result for `args`, computing and caching it on a miss
    pub fn call(&self, args: &A) -> V {
        let Some(key) = self.key_for(args) else {
            return (self.func)(args);
        };

        if let Some(hit) = self.cache.get(&key) {
            return hit;
        }

        let value = (self.func)(args);
        self.cache.set(&key, value.clone(), self.ttl);
        value
    }

    /// Drop the cached result for `args`
    pub fn invalidate(&self, args: &A) -> bool {
        self.key_for(args)
            .is_some_and(|key| self.cache.remove(&key))
    }
}
