//! In-flight Fetch Coalescing
//!
//! Tracks at most one pending origin fetch per key. The table lives inside
//! each cache's state mutex so that "cached? in flight? else register" is one
//! critical section with no suspension point in between.

use std::collections::HashMap;
use std::hash::Hash;

use bytes::Bytes;
use futures::future::{AbortHandle, Abortable, BoxFuture, FutureExt, Shared};

use crate::error::{Error, Result};

/// Pending result of a block fetch, handed to every joiner
pub type SharedFetch = Shared<BoxFuture<'static, Result<Bytes>>>;

/// What `clear()` does with fetches already dispatched to the origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InflightPolicy {
    /// Stop tracking them and let them run to completion; their results are
    /// still returned to callers that were waiting but are not cached
    #[default]
    Detach,
    /// Abort them; waiting callers receive [`Error::Cancelled`]
    Abort,
}

struct Slot {
    id: u64,
    fetch: SharedFetch,
    abort: AbortHandle,
}

/// Key to pending-fetch table
pub struct Inflight<K> {
    slots: HashMap<K, Slot>,
    next_id: u64,
}

impl<K: Eq + Hash> Default for Inflight<K> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
            next_id: 0,
        }
    }
}

impl<K: Eq + Hash> Inflight<K> {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Pending fetch for `key`, if one is registered
    pub fn join(&self, key: &K) -> Option<SharedFetch> {
        self.slots.get(key).map(|slot| slot.fetch.clone())
    }

    /// Register a fetch for `key`
    ///
    /// `make` receives the slot id, which the future must pass to
    /// [`Inflight::complete`] once it has stored its result. The returned
    /// future is lazy; the caller is responsible for driving it.
    pub fn register<F>(&mut self, key: K, make: F) -> SharedFetch
    where
        F: FnOnce(u64) -> BoxFuture<'static, Result<Bytes>>,
    {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);

        let (abort, registration) = AbortHandle::new_pair();
        let fetch = Abortable::new(make(id), registration)
            .map(|outcome| outcome.unwrap_or(Err(Error::Cancelled)))
            .boxed()
            .shared();

        self.slots.insert(
            key,
            Slot {
                id,
                fetch: fetch.clone(),
                abort,
            },
        );
        fetch
    }

    /// Drop the slot for `key` if it still belongs to fetch `id`
    ///
    /// A slot registered after a `clear()` carries a newer id and is left
    /// alone.
    pub fn complete(&mut self, key: &K, id: u64) -> bool {
        match self.slots.get(key) {
            Some(slot) if slot.id == id => {
                self.slots.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Whether fetch `id` still owns the slot for `key`
    pub fn is_current(&self, key: &K, id: u64) -> bool {
        self.slots.get(key).is_some_and(|slot| slot.id == id)
    }

    /// Forget every slot, aborting the fetches under [`InflightPolicy::Abort`]
    pub fn clear(&mut self, policy: InflightPolicy) -> usize {
        let count = self.slots.len();
        for (_, slot) in self.slots.drain() {
            if policy == InflightPolicy::Abort {
                slot.abort.abort();
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
