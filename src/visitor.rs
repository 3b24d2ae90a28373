//! A visitor: one end-user session with its context, resolved flags and pending hits.
use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use chrono::Utc;

use crate::{
    context::{to_attributes, validate_visitor_id, ContextValue, TargetingContext},
    flag::{Flag, FlagMetadata, FlagValue, ResolvedFlag},
    hit::{Hit, HitRecord},
    visitor_cache::{CachedAssignment, VisitorCacheRecord, RECORD_VERSION},
    Client, DecisionMode, Error, Result,
};

/// Options for [`Client::new_visitor()`].
#[derive(Debug, Clone)]
pub struct VisitorOptions {
    /// Stable visitor id. A random id is generated when absent or invalid.
    pub visitor_id: Option<String>,
    pub context: TargetingContext,
    /// Without consent no hits are sent and no state is cached.
    pub has_consented: bool,
}

impl Default for VisitorOptions {
    fn default() -> Self {
        VisitorOptions {
            visitor_id: None,
            context: TargetingContext::new(),
            has_consented: true,
        }
    }
}

impl VisitorOptions {
    pub fn with_visitor_id(mut self, visitor_id: impl Into<String>) -> Self {
        self.visitor_id = Some(visitor_id.into());
        self
    }

    pub fn with_context(mut self, context: TargetingContext) -> Self {
        self.context = context;
        self
    }
}

/// A visitor created by [`Client::new_visitor()`].
///
/// Typical lifecycle for one request:
/// 1. [`Visitor::fetch_flags()`] reads cached state and resolves flags.
/// 2. [`Visitor::get_flag()`] and [`Visitor::send_hit()`] while building the response.
/// 3. [`Visitor::close()`] once the response is on its way, to write the cache and deliver hits.
pub struct Visitor<'c> {
    client: &'c Client,
    visitor_id: String,
    context: TargetingContext,
    has_consented: bool,
    fetched: bool,
    /// The last cache lookup failed, so the stored record must not be replaced.
    cache_unreadable: bool,
    flags: HashMap<String, ResolvedFlag>,
    exposed: HashSet<String>,
    hits: Vec<Hit>,
}

impl<'c> Visitor<'c> {
    pub(crate) fn new(client: &'c Client, options: VisitorOptions) -> Self {
        let visitor_id = match options.visitor_id {
            Some(id) if validate_visitor_id(&id).is_ok() => id,
            Some(id) => {
                log::warn!(target: "edge_flags", "invalid visitor id {id:?}, generating a new one");
                uuid::Uuid::new_v4().to_string()
            }
            None => uuid::Uuid::new_v4().to_string(),
        };
        Visitor {
            client,
            visitor_id,
            context: options.context,
            has_consented: options.has_consented,
            fetched: false,
            cache_unreadable: false,
            flags: HashMap::new(),
            exposed: HashSet::new(),
            hits: Vec::new(),
        }
    }

    /// Never empty.
    pub fn visitor_id(&self) -> &str {
        &self.visitor_id
    }

    pub fn context(&self) -> &TargetingContext {
        &self.context
    }

    /// Changes one targeting attribute. Takes effect on the next [`Visitor::fetch_flags()`].
    pub fn update_context(&mut self, key: impl Into<String>, value: impl Into<ContextValue>) {
        self.context.insert(key.into(), value.into());
    }

    pub fn has_consented(&self) -> bool {
        self.has_consented
    }

    /// Withdrawing consent drops queued hits.
    pub fn set_consent(&mut self, has_consented: bool) {
        self.has_consented = has_consented;
        if !has_consented {
            self.hits.clear();
        }
    }

    /// Resolve every flag of the bucketing dataset for this visitor.
    ///
    /// Flags the engine reports as not applicable are absent. A flag whose evaluation fails is
    /// served from the visitor cache if a cached assignment exists, and is absent otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Evaluation`] if the dataset has flags and none of them could be evaluated
    /// or served from the cache. Flags resolved so far stay available.
    pub fn fetch_flags(&mut self) -> Result<()> {
        let cached = match self.lookup_cached() {
            Ok(cached) => {
                self.cache_unreadable = false;
                cached
            }
            Err(err) => {
                log::warn!(target: "edge_flags", "visitor cache lookup failed: {err}");
                self.cache_unreadable = true;
                None
            }
        };
        let attributes = Arc::new(to_attributes(&self.context));
        let decision_mode = self.client.decision_mode();

        let mut flags = HashMap::new();
        let mut first_error: Option<Error> = None;
        let mut failures = 0usize;

        for key in self.client.flag_keys() {
            let cached_assignment = cached
                .as_ref()
                .and_then(|record| record.assignments.get(key));

            if decision_mode == DecisionMode::Edge {
                if let Some(assignment) = cached_assignment {
                    flags.insert(key.clone(), from_cache(assignment));
                    continue;
                }
            }

            match self.client.evaluate(key, &self.visitor_id, &attributes) {
                Ok(Some(resolved)) => {
                    flags.insert(key.clone(), resolved);
                }
                Ok(None) => {}
                Err(err) => {
                    log::warn!(target: "edge_flags", "failed to evaluate flag {key}: {err}");
                    match cached_assignment {
                        Some(assignment) => {
                            flags.insert(key.clone(), from_cache(assignment));
                        }
                        None => {
                            failures += 1;
                            first_error.get_or_insert(err);
                        }
                    }
                }
            }
        }

        self.flags = flags;
        self.fetched = true;

        match first_error {
            Some(err) if failures == self.client.flag_keys().len() => Err(err),
            _ => Ok(()),
        }
    }

    /// Handle to the flag `key`. `default` is returned when the flag is unknown for this visitor or
    /// its value is of another kind.
    pub fn get_flag(&mut self, key: &str, default: impl Into<FlagValue>) -> Flag<'_, 'c> {
        if !self.fetched {
            log::warn!(target: "edge_flags", "flag {key} read before fetch_flags, default will be used");
        }
        Flag::new(self, key.to_owned(), default.into())
    }

    /// Queue a tracking hit. Hits are delivered by [`Visitor::close()`].
    pub fn send_hit(&mut self, hit: Hit) {
        if self.has_consented {
            self.hits.push(hit);
        } else {
            log::debug!(target: "edge_flags", "hit dropped, visitor has not consented");
        }
    }

    /// Removes this visitor's cached state.
    pub fn clear_cache(&self) -> Result<()> {
        match self.client.visitor_cache() {
            Some(cache) => cache.flush_visitor(&self.visitor_id),
            None => Ok(()),
        }
    }

    /// Write the visitor state to the cache and deliver queued hits.
    ///
    /// Cache failures are logged and otherwise ignored. Without consent the cached state is
    /// removed instead. If the cached state could not be read, it is left untouched.
    pub fn close(self) {
        if let Some(cache) = self.client.visitor_cache() {
            let result = if !self.has_consented {
                cache.flush_visitor(&self.visitor_id)
            } else if self.cache_unreadable {
                log::debug!(target: "edge_flags", "keeping unreadable visitor record");
                Ok(())
            } else {
                cache.cache_visitor(&self.visitor_id, &self.to_record())
            };
            if let Err(err) = result {
                log::warn!(target: "edge_flags", "visitor cache write failed: {err}");
            }
        }

        let timestamp = Utc::now();
        for hit in self.hits {
            self.client.deliver(HitRecord {
                environment_id: self.client.environment_id().to_owned(),
                visitor_id: self.visitor_id.clone(),
                hit,
                timestamp,
            });
        }
    }

    pub(crate) fn resolved_flag(&self, key: &str) -> Option<&ResolvedFlag> {
        self.flags.get(key)
    }

    /// Exposure is reported once per flag and visitor.
    pub(crate) fn queue_exposure(&mut self, key: &str, metadata: FlagMetadata) {
        if self.exposed.insert(key.to_owned()) {
            self.send_hit(Hit::Exposure {
                flag_key: key.to_owned(),
                allocation_key: metadata.allocation_key,
                variation_key: metadata.variation_key,
            });
        }
    }

    fn lookup_cached(&self) -> Result<Option<VisitorCacheRecord>> {
        let Some(cache) = self.client.visitor_cache() else {
            return Ok(None);
        };
        match cache.lookup_visitor(&self.visitor_id)? {
            Some(record) if record.version == RECORD_VERSION => Ok(Some(record)),
            Some(record) => {
                log::debug!(
                    target: "edge_flags",
                    "ignoring cached visitor record version {}",
                    record.version
                );
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn to_record(&self) -> VisitorCacheRecord {
        VisitorCacheRecord {
            version: RECORD_VERSION,
            visitor_id: self.visitor_id.clone(),
            context: self.context.clone(),
            assignments: self
                .flags
                .iter()
                .map(|(key, resolved)| {
                    (
                        key.clone(),
                        CachedAssignment {
                            value: resolved.value.clone(),
                            allocation_key: resolved.metadata.allocation_key.clone(),
                            variation_key: resolved.metadata.variation_key.clone(),
                        },
                    )
                })
                .collect(),
            updated_at: Utc::now(),
        }
    }
}

fn from_cache(assignment: &CachedAssignment) -> ResolvedFlag {
    ResolvedFlag {
        value: assignment.value.clone(),
        metadata: FlagMetadata {
            allocation_key: assignment.allocation_key.clone(),
            variation_key: assignment.variation_key.clone(),
            from_cache: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{ClientConfig, InMemoryVisitorCache, VisitorCache};

    /// Stores records but fails every read.
    #[derive(Default)]
    struct WriteOnlyCache {
        inner: InMemoryVisitorCache,
    }

    impl VisitorCache for WriteOnlyCache {
        fn cache_visitor(&self, visitor_id: &str, data: &VisitorCacheRecord) -> Result<()> {
            self.inner.cache_visitor(visitor_id, data)
        }

        fn lookup_visitor(&self, _visitor_id: &str) -> Result<Option<VisitorCacheRecord>> {
            Err(Error::Store("timeout".to_owned()))
        }

        fn flush_visitor(&self, visitor_id: &str) -> Result<()> {
            self.inner.flush_visitor(visitor_id)
        }
    }

    const BUCKETING: &str = r#"{
        "createdAt": "2024-07-18T00:00:00Z",
        "format": "SERVER",
        "environment": {"name": "Test"},
        "flags": {
            "js": {
                "key": "js",
                "enabled": true,
                "variationType": "STRING",
                "variations": {"on": {"key": "on", "value": "flag-on"}},
                "allocations": [
                    {"key": "everyone", "splits": [{"variationKey": "on", "shards": []}], "doLog": true}
                ],
                "totalShards": 10000
            },
            "limit": {
                "key": "limit",
                "enabled": true,
                "variationType": "NUMERIC",
                "variations": {"three": {"key": "three", "value": 3.0}},
                "allocations": [
                    {"key": "everyone", "splits": [{"variationKey": "three", "shards": []}], "doLog": true}
                ],
                "totalShards": 10000
            },
            "banner": {
                "key": "banner",
                "enabled": true,
                "variationType": "STRING",
                "variations": {
                    "blue": {"key": "blue", "value": "blue"},
                    "grey": {"key": "grey", "value": "grey"}
                },
                "allocations": [
                    {
                        "key": "france",
                        "rules": [{"conditions": [{"attribute": "country", "operator": "ONE_OF", "value": ["FR"]}]}],
                        "splits": [{"variationKey": "blue", "shards": []}],
                        "doLog": true
                    },
                    {"key": "rest", "splits": [{"variationKey": "grey", "shards": []}], "doLog": true}
                ],
                "totalShards": 10000
            }
        }
    }"#;

    fn client(
        mode: DecisionMode,
        cache: &Arc<InMemoryVisitorCache>,
        hits: &Arc<Mutex<Vec<HitRecord>>>,
    ) -> Client {
        let hits = hits.clone();
        ClientConfig::from_credentials("env", "key")
            .bucketing(BUCKETING)
            .decision_mode(mode)
            .visitor_cache(Arc::clone(cache))
            .hit_logger(move |hit: HitRecord| hits.lock().unwrap().push(hit))
            .to_client()
            .unwrap()
    }

    fn cached_record(visitor_id: &str, banner: &str) -> VisitorCacheRecord {
        VisitorCacheRecord {
            version: RECORD_VERSION,
            visitor_id: visitor_id.to_owned(),
            context: TargetingContext::new(),
            assignments: [(
                "banner".to_owned(),
                CachedAssignment {
                    value: FlagValue::from(banner),
                    allocation_key: None,
                    variation_key: None,
                },
            )]
            .into_iter()
            .collect(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn generated_visitor_id_is_not_empty() {
        let cache = Arc::new(InMemoryVisitorCache::new());
        let client = client(DecisionMode::Bucketing, &cache, &Default::default());
        let visitor = client.new_visitor(VisitorOptions::default()).unwrap();
        assert!(!visitor.visitor_id().is_empty());

        let visitor = client
            .new_visitor(VisitorOptions::default().with_visitor_id(""))
            .unwrap();
        assert!(!visitor.visitor_id().is_empty());
    }

    #[test]
    fn invalid_visitor_id_is_replaced() {
        let cache = Arc::new(InMemoryVisitorCache::new());
        let client = client(DecisionMode::Bucketing, &cache, &Default::default());

        let options = VisitorOptions::default().with_visitor_id("abc;\r\nSet-Cookie: x=1");
        let visitor = client.new_visitor(options).unwrap();
        assert!(validate_visitor_id(visitor.visitor_id()).is_ok());
        assert!(!visitor.visitor_id().contains(';'));

        let visitor = client
            .new_visitor(VisitorOptions::default().with_visitor_id("abc123"))
            .unwrap();
        assert_eq!(visitor.visitor_id(), "abc123");
    }

    #[test]
    fn numbers_take_the_kind_of_the_default() {
        let cache = Arc::new(InMemoryVisitorCache::new());
        let client = client(DecisionMode::Bucketing, &cache, &Default::default());
        let mut visitor = client
            .new_visitor(VisitorOptions::default().with_visitor_id("abc123"))
            .unwrap();
        visitor.fetch_flags().unwrap();

        assert_eq!(
            visitor.get_flag("limit", 0i64).value(false),
            FlagValue::Integer(3)
        );
        assert_eq!(
            visitor.get_flag("limit", 0.5).value(false),
            FlagValue::Numeric(3.0)
        );
    }

    #[test]
    fn targeting_selects_allocation() {
        let cache = Arc::new(InMemoryVisitorCache::new());
        let client = client(DecisionMode::Bucketing, &cache, &Default::default());

        let mut visitor = client
            .new_visitor(VisitorOptions::default().with_visitor_id("abc123"))
            .unwrap();
        visitor.update_context("country", "FR");
        visitor.fetch_flags().unwrap();
        assert_eq!(
            visitor.get_flag("banner", "none").value(false),
            FlagValue::from("blue")
        );

        visitor.update_context("country", "DE");
        visitor.fetch_flags().unwrap();
        assert_eq!(
            visitor.get_flag("banner", "none").value(false),
            FlagValue::from("grey")
        );
    }

    #[test]
    fn default_is_used_for_unknown_or_mistyped_flags() {
        let cache = Arc::new(InMemoryVisitorCache::new());
        let client = client(DecisionMode::Bucketing, &cache, &Default::default());
        let mut visitor = client
            .new_visitor(VisitorOptions::default().with_visitor_id("abc123"))
            .unwrap();
        visitor.fetch_flags().unwrap();

        assert_eq!(
            visitor.get_flag("missing", "fallback").value(true),
            FlagValue::from("fallback")
        );
        assert_eq!(
            visitor.get_flag("js", 7i64).value(true),
            FlagValue::Integer(7)
        );
        assert!(!visitor.get_flag("js", false).exists());
        assert!(visitor.get_flag("js", "x").exists());
    }

    #[test]
    fn close_writes_cache_and_delivers_hits() {
        let cache = Arc::new(InMemoryVisitorCache::new());
        let hits = Arc::new(Mutex::new(Vec::new()));
        let client = client(DecisionMode::Bucketing, &cache, &hits);

        let mut visitor = client
            .new_visitor(VisitorOptions::default().with_visitor_id("abc123"))
            .unwrap();
        visitor.fetch_flags().unwrap();
        assert_eq!(
            visitor.get_flag("js", "default-value").value(true),
            FlagValue::from("flag-on")
        );
        visitor.get_flag("js", "default-value").visitor_exposed();
        visitor.send_hit(Hit::page("page"));
        visitor.close();

        let record = cache.lookup_visitor("abc123").unwrap().unwrap();
        assert_eq!(
            record.assignments.get("js").map(|a| a.value.clone()),
            Some(FlagValue::from("flag-on"))
        );

        let hits = hits.lock().unwrap();
        assert_eq!(hits.len(), 2, "exposure is reported once, plus the page hit");
        assert!(matches!(&hits[0].hit, Hit::Exposure { flag_key, .. } if flag_key == "js"));
        assert_eq!(hits[1].hit, Hit::page("page"));
        assert!(hits.iter().all(|hit| hit.visitor_id == "abc123" && hit.environment_id == "env"));
    }

    #[test]
    fn edge_mode_prefers_cached_assignments() {
        let cache = Arc::new(InMemoryVisitorCache::new());
        cache
            .cache_visitor("abc123", &cached_record("abc123", "cached-value"))
            .unwrap();
        let client = client(DecisionMode::Edge, &cache, &Default::default());

        let mut visitor = client
            .new_visitor(VisitorOptions::default().with_visitor_id("abc123"))
            .unwrap();
        visitor.fetch_flags().unwrap();

        let mut flag = visitor.get_flag("banner", "none");
        assert_eq!(flag.value(false), FlagValue::from("cached-value"));
        assert!(flag.metadata().from_cache);
        assert_eq!(
            visitor.get_flag("js", "none").value(false),
            FlagValue::from("flag-on")
        );
    }

    #[test]
    fn unreadable_cache_keeps_stored_record() {
        let cache = Arc::new(WriteOnlyCache::default());
        cache
            .cache_visitor("abc123", &cached_record("abc123", "cached-value"))
            .unwrap();
        let client = ClientConfig::from_credentials("env", "key")
            .bucketing(BUCKETING)
            .decision_mode(DecisionMode::Edge)
            .visitor_cache(Arc::clone(&cache))
            .to_client()
            .unwrap();

        let mut visitor = client
            .new_visitor(VisitorOptions::default().with_visitor_id("abc123"))
            .unwrap();
        visitor.fetch_flags().unwrap();
        assert_eq!(
            visitor.get_flag("banner", "none").value(false),
            FlagValue::from("grey")
        );
        visitor.close();

        let record = cache.inner.lookup_visitor("abc123").unwrap().unwrap();
        assert_eq!(
            record.assignments.get("banner").map(|a| a.value.clone()),
            Some(FlagValue::from("cached-value"))
        );
    }

    #[test]
    fn bucketing_mode_evaluates_despite_cache() {
        let cache = Arc::new(InMemoryVisitorCache::new());
        cache
            .cache_visitor("abc123", &cached_record("abc123", "cached-value"))
            .unwrap();
        let client = client(DecisionMode::Bucketing, &cache, &Default::default());

        let mut visitor = client
            .new_visitor(VisitorOptions::default().with_visitor_id("abc123"))
            .unwrap();
        visitor.fetch_flags().unwrap();
        assert_eq!(
            visitor.get_flag("banner", "none").value(false),
            FlagValue::from("grey")
        );
    }

    #[test]
    fn stale_record_version_is_ignored() {
        let cache = Arc::new(InMemoryVisitorCache::new());
        let mut record = cached_record("abc123", "cached-value");
        record.version = RECORD_VERSION + 1;
        cache.cache_visitor("abc123", &record).unwrap();
        let client = client(DecisionMode::Edge, &cache, &Default::default());

        let mut visitor = client
            .new_visitor(VisitorOptions::default().with_visitor_id("abc123"))
            .unwrap();
        visitor.fetch_flags().unwrap();
        assert_eq!(
            visitor.get_flag("banner", "none").value(false),
            FlagValue::from("grey")
        );
    }

    #[test]
    fn no_consent_means_no_hits_and_no_cache() {
        let cache = Arc::new(InMemoryVisitorCache::new());
        cache
            .cache_visitor("abc123", &cached_record("abc123", "cached-value"))
            .unwrap();
        let hits = Arc::new(Mutex::new(Vec::new()));
        let client = client(DecisionMode::Bucketing, &cache, &hits);

        let mut visitor = client
            .new_visitor(VisitorOptions::default().with_visitor_id("abc123"))
            .unwrap();
        visitor.send_hit(Hit::page("before"));
        visitor.set_consent(false);
        visitor.send_hit(Hit::page("after"));
        visitor.close();

        assert!(hits.lock().unwrap().is_empty());
        assert_eq!(cache.lookup_visitor("abc123").unwrap(), None);
    }

    #[test]
    fn clear_cache_flushes_record() {
        let cache = Arc::new(InMemoryVisitorCache::new());
        cache
            .cache_visitor("abc123", &cached_record("abc123", "cached-value"))
            .unwrap();
        let client = client(DecisionMode::Edge, &cache, &Default::default());
        let visitor = client
            .new_visitor(VisitorOptions::default().with_visitor_id("abc123"))
            .unwrap();
        visitor.clear_cache().unwrap();
        assert_eq!(cache.lookup_visitor("abc123").unwrap(), None);
    }
}
