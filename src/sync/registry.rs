//! Per-key collection registry with lease-based disposal.
//!
//! Collections are created on the first `acquire` for a key and removed
//! when the last [`CollectionLease`] for that key is dropped.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use tracing::debug;

type Factory<K, C> = Box<dyn Fn(&K) -> C + Send + Sync>;

struct Slot<C> {
    collection: Arc<C>,
    leases: usize,
}

/// Lazily populated map of shared collections
pub struct CollectionRegistry<K, C>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    name: &'static str,
    slots: DashMap<K, Slot<C>>,
    factory: Factory<K, C>,
}

impl<K, C> CollectionRegistry<K, C>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    pub fn new(name: &'static str, factory: impl Fn(&K) -> C + Send + Sync + 'static) -> Self {
        Self {
            name,
            slots: DashMap::new(),
            factory: Box::new(factory),
        }
    }

    /// Get or create the collection for `key` and hold it open
    pub fn acquire(self: &Arc<Self>, key: K) -> CollectionLease<K, C> {
        let collection = match self.slots.entry(key.clone()) {
            Entry::Occupied(mut occupied) => {
                let slot = occupied.get_mut();
                slot.leases += 1;
                slot.collection.clone()
            }
            Entry::Vacant(vacant) => {
                debug!("[{}] Creating collection for {:?}", self.name, key);
                let collection = Arc::new((self.factory)(&key));
                vacant.insert(Slot {
                    collection: collection.clone(),
                    leases: 1,
                });
                collection
            }
        };

        CollectionLease {
            registry: self.clone(),
            key,
            collection,
        }
    }

    /// Collection for `key` if someone holds it open
    pub fn get(&self, key: &K) -> Option<Arc<C>> {
        self.slots.get(key).map(|slot| slot.collection.clone())
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots.contains_key(key)
    }

    pub fn lease_count(&self, key: &K) -> usize {
        self.slots.get(key).map(|slot| slot.leases).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn keys(&self) -> Vec<K> {
        self.slots.iter().map(|slot| slot.key().clone()).collect()
    }

    /// Every open collection
    pub fn collections(&self) -> Vec<Arc<C>> {
        self.slots
            .iter()
            .map(|slot| slot.collection.clone())
            .collect()
    }

    fn release(&self, key: &K) {
        let removed = self
            .slots
            .remove_if_mut(key, |_, slot| {
                slot.leases = slot.leases.saturating_sub(1);
                slot.leases == 0
            })
            .is_some();

        if removed {
            debug!("[{}] Disposed collection for {:?}", self.name, key);
        }
    }
}

/// Keeps one registry entry alive; derefs to the collection
pub struct CollectionLease<K, C>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    registry: Arc<CollectionRegistry<K, C>>,
    key: K,
    collection: Arc<C>,
}

impl<K, C> CollectionLease<K, C>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn collection(&self) -> &Arc<C> {
        &self.collection
    }
}

impl<K, C> std::ops::Deref for CollectionLease<K, C>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    type Target = C;

    fn deref(&self) -> &C {
        &self.collection
    }
}

impl<K, C> Drop for CollectionLease<K, C>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    C: Send + Sync + 'static,
{
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry() -> (Arc<CollectionRegistry<String, String>>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let registry = CollectionRegistry::new("test", move |key: &String| {
            counter.fetch_add(1, Ordering::SeqCst);
            format!("collection:{}", key)
        });
        (Arc::new(registry), created)
    }

    #[test]
    fn test_shared_until_last_lease() {
        let (registry, created) = registry();

        let first = registry.acquire("c1".to_string());
        let second = registry.acquire("c1".to_string());
        assert_eq!(*first, "collection:c1");
        assert!(Arc::ptr_eq(first.collection(), second.collection()));
        assert_eq!(registry.lease_count(&"c1".to_string()), 2);
        assert_eq!(created.load(Ordering::SeqCst), 1);

        drop(first);
        assert!(registry.contains(&"c1".to_string()));

        drop(second);
        assert!(registry.is_empty());
        assert!(registry.get(&"c1".to_string()).is_none());
    }

    #[test]
    fn test_reacquire_after_disposal_creates_new() {
        let (registry, created) = registry();

        drop(registry.acquire("c1".to_string()));
        let _lease = registry.acquire("c1".to_string());

        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_keys_are_independent() {
        let (registry, _) = registry();

        let a = registry.acquire("a".to_string());
        let b = registry.acquire("b".to_string());
        assert_eq!(registry.len(), 2);

        drop(a);
        assert_eq!(registry.keys(), vec!["b".to_string()]);
        assert_eq!(registry.collections().len(), 1);
        drop(b);
    }
}
