use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::trace;

use super::entry::{CacheEntry, Reader};

/// Byte and request accounting shared between the store and its entries.
#[derive(Debug, Default)]
pub(super) struct StoreCounters {
    total_size: AtomicU64,
    request_count: AtomicU64,
}

impl StoreCounters {
    pub(super) fn add_bytes(&self, bytes: usize) {
        let total = self
            .total_size
            .fetch_add(bytes as u64, Ordering::AcqRel)
            .saturating_add(bytes as u64);
        crate::metrics::set_cache_resident_bytes(total);
    }

    pub(super) fn sub_bytes(&self, bytes: usize) {
        if bytes == 0 {
            return;
        }
        let bytes = bytes as u64;
        let previous = self
            .total_size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(bytes))
            })
            .unwrap_or_default();
        crate::metrics::set_cache_resident_bytes(previous.saturating_sub(bytes));
    }

    pub(super) fn total_size(&self) -> u64 {
        self.total_size.load(Ordering::Acquire)
    }

    fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub(super) fn reset_requests(&self) {
        self.request_count.store(0, Ordering::Relaxed);
    }
}

/// Outcome of [`CacheStore::get_or_create`].
#[derive(Debug)]
pub enum Lookup {
    /// A new entry was inserted; the caller is already attached as its first reader and must
    /// start the origin fetch.
    Created(Reader),
    /// The key was already present; the caller attaches separately.
    Existing(Arc<CacheEntry>),
}

#[derive(Debug)]
pub struct CacheStore {
    pub(super) entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    pub(super) counters: Arc<StoreCounters>,
    capacity: u64,
}

impl CacheStore {
    /// `capacity` is the resident size at which keys not already cached bypass the store.
    pub fn new(capacity: u64) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            counters: Arc::new(StoreCounters::default()),
            capacity,
        }
    }

    pub fn get_or_create(&self, key: &str, peer: Option<SocketAddr>) -> Lookup {
        let mut entries = self.entries.write();
        self.counters.record_request();
        if let Some(entry) = entries.get(key) {
            entry.record_hit();
            crate::metrics::record_cache_lookup(true);
            return Lookup::Existing(Arc::clone(entry));
        }

        let entry = Arc::new(CacheEntry::new(key.to_string(), self.counters.clone()));
        entry.record_hit();
        let reader = entry.attach_creator(peer);
        entries.insert(key.to_string(), entry);
        crate::metrics::record_cache_lookup(false);
        trace!(key, "cache entry created");
        Lookup::Created(reader)
    }

    pub fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.entries.read().get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }

    /// Removes an entry and releases its resident bytes from the store total.
    pub fn remove(&self, key: &str) -> Option<Arc<CacheEntry>> {
        let entry = self.entries.write().remove(key)?;
        entry.evict();
        Some(entry)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn total_size(&self) -> u64 {
        self.counters.total_size()
    }

    pub fn request_count(&self) -> u64 {
        self.counters.request_count()
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn is_full(&self) -> bool {
        self.total_size() >= self.capacity
    }

    /// Drops every entry and zeroes the accounting.
    pub fn clear(&self) {
        let drained: Vec<_> = {
            let mut entries = self.entries.write();
            entries.drain().map(|(_, entry)| entry).collect()
        };
        for entry in &drained {
            entry.evict();
        }
        self.counters.reset_requests();
    }
}
