// src/cache.rs

//! Memoization of dependency lookups.
//!
//! Entries are keyed by a blake3 digest of `(model id, params)` and carry the
//! model's generation at insertion time. A completion (or failure) event for
//! the model bumps its generation, which drops every entry for it regardless
//! of TTL.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::engine::{EventCoordinator, EventKind, ModelEvent, SubscriptionId};
use crate::types::ModelId;

/// Compute the cache key for a model id and a parameter signature.
pub fn cache_key(model: &str, params: &str) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(model.as_bytes());
    hasher.update(&[0]);
    hasher.update(params.as_bytes());
    hasher.finalize()
}

#[derive(Debug)]
struct CacheEntry<V> {
    model: ModelId,
    value: V,
    generation: u64,
    expires_at: Instant,
}

#[derive(Debug)]
struct CacheState<V> {
    entries: HashMap<blake3::Hash, CacheEntry<V>>,
    generations: HashMap<ModelId, u64>,
}

impl<V> Default for CacheState<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            generations: HashMap::new(),
        }
    }
}

impl<V> CacheState<V> {
    fn generation_of(&self, model: &str) -> u64 {
        self.generations.get(model).copied().unwrap_or(0)
    }
}

#[derive(Debug)]
pub struct ExecutionCache<V> {
    state: Mutex<CacheState<V>>,
}

impl<V> Default for ExecutionCache<V> {
    fn default() -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
        }
    }
}

impl<V: Clone> ExecutionCache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a live entry. Expired or superseded entries are evicted.
    pub fn get(&self, model: &str, params: &str) -> Option<V> {
        let key = cache_key(model, params);
        let mut state = self.state.lock();
        let current_generation = state.generation_of(model);

        let live = match state.entries.get(&key) {
            Some(entry) => {
                entry.generation == current_generation && entry.expires_at > Instant::now()
            }
            None => return None,
        };

        if live {
            trace!(model, "cache hit");
            state.entries.get(&key).map(|e| e.value.clone())
        } else {
            trace!(model, "cache entry expired");
            state.entries.remove(&key);
            None
        }
    }

    pub fn put(&self, model: &str, params: &str, value: V, ttl: Duration) {
        let key = cache_key(model, params);
        let mut state = self.state.lock();
        let generation = state.generation_of(model);
        state.entries.insert(
            key,
            CacheEntry {
                model: model.to_string(),
                value,
                generation,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Drop every entry for `model` and bump its generation.
    pub fn invalidate_model(&self, model: &str) {
        let mut state = self.state.lock();
        *state.generations.entry(model.to_string()).or_insert(0) += 1;
        let before = state.entries.len();
        state.entries.retain(|_, e| e.model != model);
        debug!(
            model,
            dropped = before - state.entries.len(),
            "invalidated cache entries"
        );
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<V: Clone + Send + 'static> ExecutionCache<V> {
    /// Invalidate entries on `ModelCompleted` and `ModelFailed` events.
    ///
    /// The subscriptions hold only a weak reference; once the cache is
    /// dropped they become no-ops.
    pub fn attach(self: &Arc<Self>, bus: &EventCoordinator) -> Vec<SubscriptionId> {
        [EventKind::ModelCompleted, EventKind::ModelFailed]
            .into_iter()
            .map(|kind| {
                let weak: Weak<Self> = Arc::downgrade(self);
                bus.subscribe(kind, move |event: &ModelEvent| {
                    if let Some(cache) = weak.upgrade() {
                        cache.invalidate_model(event.model());
                    }
                    Ok(())
                })
            })
            .collect()
    }
}
