//! Namespace → `$jsonSchema` cache shared by every context of one engine.
//!
//! Entries expire after a fixed TTL. A single [`parking_lot::Mutex`] guards
//! both lookups and inserts; critical sections only clone a document.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bson::Document;
use parking_lot::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
struct CachedSchema {
    schema: Document,
    expires_at: Instant,
}

/// Shared cache of collection schemas keyed by `db.coll`.
#[derive(Debug, Clone)]
pub struct SchemaCache {
    inner: Arc<Mutex<HashMap<String, CachedSchema>>>,
    ttl: Duration,
}

impl SchemaCache {
    /// Create an empty cache whose entries live for `ttl`.
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// How long an entry stays valid.
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Number of entries, expired ones included until the next lookup evicts them.
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Returns `true` if no schemas are cached.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Look up the schema for `ns`. An expired entry is evicted and reported
    /// as absent.
    pub fn get(&self, ns: &str) -> Option<Document> {
        let mut map = self.inner.lock();
        match map.get(ns) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.schema.clone()),
            Some(_) => {
                map.remove(ns);
                debug!(ns, "schema cache entry expired");
                None
            }
            None => None,
        }
    }

    /// Insert or refresh the schema for `ns`.
    pub fn insert(&self, ns: &str, schema: Document) {
        let entry = CachedSchema {
            schema,
            expires_at: Instant::now() + self.ttl,
        };
        self.inner.lock().insert(ns.to_owned(), entry);
        debug!(ns, "schema cached");
    }

    /// Drop every cached schema.
    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use std::thread;

    #[test]
    fn initially_empty() {
        let cache = SchemaCache::new(Duration::from_secs(60));
        assert!(cache.is_empty());
        assert_eq!(cache.len(), 0);
        assert!(cache.get("db.coll").is_none());
    }

    #[test]
    fn insert_and_get() {
        let cache = SchemaCache::new(Duration::from_secs(60));
        cache.insert("db.users", doc! { "bsonType": "object" });
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("db.users"), Some(doc! { "bsonType": "object" }));
        assert!(cache.get("db.other").is_none());
    }

    #[test]
    fn insert_replaces_existing() {
        let cache = SchemaCache::new(Duration::from_secs(60));
        cache.insert("db.users", doc! { "v": 1 });
        cache.insert("db.users", doc! { "v": 2 });
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get("db.users"), Some(doc! { "v": 2 }));
    }

    #[test]
    fn expired_entries_are_evicted() {
        let cache = SchemaCache::new(Duration::from_millis(1));
        cache.insert("db.users", doc! {});
        thread::sleep(Duration::from_millis(10));
        assert!(cache.get("db.users").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn clones_share_entries() {
        let cache = SchemaCache::new(Duration::from_secs(60));
        let other = cache.clone();
        other.insert("db.users", doc! {});
        assert!(cache.get("db.users").is_some());
        cache.clear();
        assert!(other.is_empty());
    }
}
