//! Shared key-set cache.
//!
//! A key set identifies an offline license that was already negotiated with
//! the license server. Caching it lets later sessions call `restore_keys`
//! instead of paying another server round trip.

use std::sync::{Arc, RwLock};

/// Shared, read-mostly key-set cache.
///
/// Clones share the same slot. The first non-empty publication wins; a lost
/// race costs one redundant license transaction, which the engine tolerates.
/// There is no invalidation: the cache lives as long as its holders do.
#[derive(Debug, Clone, Default)]
pub struct KeySetCache {
    inner: Arc<RwLock<Option<Vec<u8>>>>,
}

impl KeySetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cached key set, if one has been published.
    pub fn get(&self) -> Option<Vec<u8>> {
        match self.inner.read() {
            Ok(guard) => guard.clone(),
            // A poisoned slot reads as empty; re-derivation is idempotent.
            Err(_) => None,
        }
    }

    /// Publish a key set. Returns whether this call won the slot.
    ///
    /// Empty key sets are never published: an empty result means the server
    /// denied the request, and caching it would pin every later session to
    /// a dead key set.
    pub fn publish(&self, key_set_id: &[u8]) -> bool {
        if key_set_id.is_empty() {
            return false;
        }
        let mut guard = match self.inner.write() {
            Ok(guard) => guard,
            Err(_) => return false,
        };
        if guard.is_some() {
            return false;
        }
        *guard = Some(key_set_id.to_vec());
        true
    }
}
