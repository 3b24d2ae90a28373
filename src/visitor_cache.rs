//! Visitor cache: persistence of per-visitor state between requests.
//!
//! The cache maps a visitor id to a [`VisitorCacheRecord`]. It is read when a visitor fetches its
//! flags and written when the visitor is closed, which normally happens after the response has
//! been sent. A request racing with a still-pending write for the same visitor may observe a stale
//! or missing record.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{context::TargetingContext, FlagValue, Result};

/// Current layout of [`VisitorCacheRecord`]. Records written with another version are ignored.
pub const RECORD_VERSION: u32 = 1;

/// Visitor state persisted by the client between requests.
///
/// Cache backends treat the record as an opaque value: they store whatever they are given under
/// the visitor id and hand it back unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitorCacheRecord {
    pub version: u32,
    pub visitor_id: String,
    #[serde(default)]
    pub context: TargetingContext,
    #[serde(default)]
    pub assignments: HashMap<String, CachedAssignment>,
    pub updated_at: DateTime<Utc>,
}

/// Last value a visitor received for a flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedAssignment {
    pub value: FlagValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocation_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation_key: Option<String>,
}

/// Storage for visitor state.
///
/// Implementations must be safe to call concurrently for different visitor ids.
pub trait VisitorCache {
    /// Stores `data` under `visitor_id`, replacing any previous record.
    fn cache_visitor(&self, visitor_id: &str, data: &VisitorCacheRecord) -> Result<()>;

    /// Returns the record stored under `visitor_id`.
    ///
    /// A missing record is `Ok(None)`, not an error.
    fn lookup_visitor(&self, visitor_id: &str) -> Result<Option<VisitorCacheRecord>>;

    /// Removes the record stored under `visitor_id`. Removing a missing record succeeds.
    fn flush_visitor(&self, visitor_id: &str) -> Result<()>;
}

/// Raw byte storage addressed by string keys, e.g. an edge platform's KV store.
pub trait KeyValueStore {
    /// Returns the value for `key`, or `Ok(None)` if there is none.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Deletes `key`. Deleting a missing key succeeds.
    fn delete(&self, key: &str) -> Result<()>;
}

/// [`VisitorCache`] that stores records as JSON in a [`KeyValueStore`].
pub struct KvVisitorCache<S> {
    store: S,
    key_prefix: String,
}

impl<S: KeyValueStore> KvVisitorCache<S> {
    /// Records are stored under the bare visitor id.
    pub fn new(store: S) -> Self {
        KvVisitorCache {
            store,
            key_prefix: String::new(),
        }
    }

    /// Stores records under `prefix` + visitor id, so the cache can share a store with other data.
    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn key(&self, visitor_id: &str) -> String {
        format!("{}{}", self.key_prefix, visitor_id)
    }
}

impl<S: KeyValueStore> VisitorCache for KvVisitorCache<S> {
    fn cache_visitor(&self, visitor_id: &str, data: &VisitorCacheRecord) -> Result<()> {
        let bytes = serde_json::to_vec(data)?;
        self.store.put(&self.key(visitor_id), bytes)
    }

    fn lookup_visitor(&self, visitor_id: &str) -> Result<Option<VisitorCacheRecord>> {
        match self.store.get(&self.key(visitor_id))? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn flush_visitor(&self, visitor_id: &str) -> Result<()> {
        self.store.delete(&self.key(visitor_id))
    }
}

/// In-process [`VisitorCache`]. Useful for tests and for single-instance deployments.
#[derive(Debug, Default)]
pub struct InMemoryVisitorCache {
    records: RwLock<HashMap<String, VisitorCacheRecord>>,
}

impl InMemoryVisitorCache {
    pub fn new() -> Self {
        InMemoryVisitorCache::default()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .expect("thread holding visitor cache lock should not panic")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl VisitorCache for InMemoryVisitorCache {
    fn cache_visitor(&self, visitor_id: &str, data: &VisitorCacheRecord) -> Result<()> {
        self.records
            .write()
            .expect("thread holding visitor cache lock should not panic")
            .insert(visitor_id.to_owned(), data.clone());
        Ok(())
    }

    fn lookup_visitor(&self, visitor_id: &str) -> Result<Option<VisitorCacheRecord>> {
        Ok(self
            .records
            .read()
            .expect("thread holding visitor cache lock should not panic")
            .get(visitor_id)
            .cloned())
    }

    fn flush_visitor(&self, visitor_id: &str) -> Result<()> {
        self.records
            .write()
            .expect("thread holding visitor cache lock should not panic")
            .remove(visitor_id);
        Ok(())
    }
}

impl<T: VisitorCache + ?Sized> VisitorCache for Box<T> {
    fn cache_visitor(&self, visitor_id: &str, data: &VisitorCacheRecord) -> Result<()> {
        (**self).cache_visitor(visitor_id, data)
    }

    fn lookup_visitor(&self, visitor_id: &str) -> Result<Option<VisitorCacheRecord>> {
        (**self).lookup_visitor(visitor_id)
    }

    fn flush_visitor(&self, visitor_id: &str) -> Result<()> {
        (**self).flush_visitor(visitor_id)
    }
}

impl<T: VisitorCache + ?Sized> VisitorCache for Arc<T> {
    fn cache_visitor(&self, visitor_id: &str, data: &VisitorCacheRecord) -> Result<()> {
        (**self).cache_visitor(visitor_id, data)
    }

    fn lookup_visitor(&self, visitor_id: &str) -> Result<Option<VisitorCacheRecord>> {
        (**self).lookup_visitor(visitor_id)
    }

    fn flush_visitor(&self, visitor_id: &str) -> Result<()> {
        (**self).flush_visitor(visitor_id)
    }
}
