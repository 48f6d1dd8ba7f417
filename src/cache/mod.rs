pub mod names;

use lru::LruCache;
use std::cell::RefCell;
use std::num::NonZeroUsize;

use crate::store::{ObjectId, RawObject};

pub use names::{IdentityLookup, NameCache, SystemIdentities};

/// Fallback capacity when a zero capacity is configured.
const DEFAULT_CAPACITY: NonZeroUsize = NonZeroUsize::new(256).unwrap();

/// In-memory cache for inflated objects.
///
/// Owned by a single store; lookups take `&self` so reads stay shared.
pub struct ObjectCache {
    cache: RefCell<LruCache<ObjectId, RawObject>>,
}

impl ObjectCache {
    /// Create a new object cache with a maximum number of entries
    pub fn new(capacity: usize) -> Self {
        let cache = LruCache::new(NonZeroUsize::new(capacity).unwrap_or(DEFAULT_CAPACITY));
        ObjectCache {
            cache: RefCell::new(cache),
        }
    }

    /// Get an object, marking it most recently used
    pub fn get(&self, id: &ObjectId) -> Option<RawObject> {
        self.cache.borrow_mut().get(id).cloned()
    }

    pub fn put(&self, id: ObjectId, object: RawObject) {
        self.cache.borrow_mut().put(id, object);
    }

    /// Number of cached objects
    pub fn len(&self) -> usize {
        self.cache.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
