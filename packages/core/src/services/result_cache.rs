//! Window Result Cache
//!
//! LRU cache of normalized window responses keyed by the serialized
//! [`WindowQuery`].
//!
//! # Reuse rules
//!
//! - **Exact**: same key.
//! - **Enclosing**: a complete (non-truncated) entry whose box encloses the
//!   request with the same z-range, LOD and labels flag, and whose inclusion
//!   lists equal the request's (or the request has none). Any LOD difference
//!   is a miss; no equivalence between LOD kinds is assumed.
//!
//! Truncated responses are only reused for the exact query that produced them.
//!
//! # Bounds
//!
//! Entry count (the LRU capacity) and an approximate byte total. An entry
//! larger than the byte bound is never stored.

use crate::config::CacheConfig;
use crate::models::WindowQuery;
use crate::remote::WindowBatch;
use lru::LruCache;
use serde::Serialize;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Outcome of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Exact(Arc<WindowBatch>),
    Enclosing(Arc<WindowBatch>),
    Miss,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub bytes: usize,
    pub exact_hits: u64,
    pub enclosing_hits: u64,
    pub misses: u64,
}

#[derive(Debug)]
struct CacheEntry {
    query: WindowQuery,
    batch: Arc<WindowBatch>,
    bytes: usize,
}

/// Whether a response cached for `cached` may answer `request`
pub fn can_substitute(cached: &WindowQuery, request: &WindowQuery) -> bool {
    let extras_compatible = !request.has_extra_ids()
        || (cached.treenode_ids == request.treenode_ids
            && cached.connector_ids == request.connector_ids);
    cached.bbox.encloses(&request.bbox)
        && cached.z_range == request.z_range
        && cached.lod == request.lod
        && cached.labels == request.labels
        && extras_compatible
}

pub struct ResultCache {
    entries: LruCache<String, CacheEntry>,
    enabled: bool,
    reuse_enclosing: bool,
    max_bytes: usize,
    used_bytes: usize,
    stats: CacheStats,
}

impl ResultCache {
    pub fn new(config: &CacheConfig) -> Self {
        let capacity = NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: LruCache::new(capacity),
            enabled: config.enabled,
            reuse_enclosing: config.reuse_enclosing,
            max_bytes: config.max_bytes,
            used_bytes: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn lookup(&mut self, query: &WindowQuery) -> CacheLookup {
        if !self.enabled {
            return CacheLookup::Miss;
        }

        let key = query.cache_key();
        if let Some(entry) = self.entries.get(&key) {
            self.stats.exact_hits += 1;
            tracing::debug!("Window cache exact hit");
            return CacheLookup::Exact(entry.batch.clone());
        }

        if self.reuse_enclosing {
            let candidate = self
                .entries
                .iter()
                .find(|(_, e)| !e.batch.truncated && can_substitute(&e.query, query))
                .map(|(k, _)| k.clone());
            if let Some(entry) = candidate.and_then(|k| self.entries.get(&k)) {
                self.stats.enclosing_hits += 1;
                tracing::debug!("Window cache hit from enclosing box");
                return CacheLookup::Enclosing(entry.batch.clone());
            }
        }

        self.stats.misses += 1;
        CacheLookup::Miss
    }

    /// Store a response; returns whether it was kept
    pub fn insert(&mut self, query: WindowQuery, batch: Arc<WindowBatch>, bytes: usize) -> bool {
        if !self.enabled || bytes > self.max_bytes {
            return false;
        }
        let key = query.cache_key();
        let entry = CacheEntry {
            query,
            batch,
            bytes,
        };
        if let Some((_, old)) = self.entries.push(key, entry) {
            self.used_bytes -= old.bytes;
        }
        self.used_bytes += bytes;

        while self.used_bytes > self.max_bytes {
            match self.entries.pop_lru() {
                Some((_, evicted)) => self.used_bytes -= evicted.bytes,
                None => break,
            }
        }
        true
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.used_bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            bytes: self.used_bytes,
            ..self.stats.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{BoundingBox, LevelOfDetail, ZRange};

    fn query(left: f64, right: f64, lod: LevelOfDetail) -> WindowQuery {
        WindowQuery::new(
            BoundingBox::new(left, left, right, right),
            ZRange::new(0.0, 1.0),
            lod,
        )
    }

    fn batch(truncated: bool) -> Arc<WindowBatch> {
        Arc::new(WindowBatch {
            truncated,
            ..WindowBatch::default()
        })
    }

    fn cache() -> ResultCache {
        ResultCache::new(&CacheConfig::default())
    }

    #[test]
    fn test_enclosing_box_is_reused() {
        let mut cache = cache();
        let lod = LevelOfDetail::Absolute(1);
        cache.insert(query(0.0, 100.0, lod), batch(false), 10);

        assert!(matches!(cache.lookup(&query(0.0, 100.0, lod)), CacheLookup::Exact(_)));
        assert!(matches!(cache.lookup(&query(10.0, 90.0, lod)), CacheLookup::Enclosing(_)));
        assert_eq!(cache.lookup(&query(-10.0, 90.0, lod)), CacheLookup::Miss);
    }

    #[test]
    fn test_lod_mismatch_is_a_miss() {
        let mut cache = cache();
        cache.insert(query(0.0, 100.0, LevelOfDetail::Absolute(1)), batch(false), 10);
        assert_eq!(
            cache.lookup(&query(10.0, 90.0, LevelOfDetail::Absolute(2))),
            CacheLookup::Miss
        );
        assert_eq!(
            cache.lookup(&query(10.0, 90.0, LevelOfDetail::Percent(1.0))),
            CacheLookup::Miss
        );
    }

    #[test]
    fn test_truncated_entries_only_serve_exact_queries() {
        let mut cache = cache();
        let lod = LevelOfDetail::Absolute(1);
        cache.insert(query(0.0, 100.0, lod), batch(true), 10);
        assert!(matches!(cache.lookup(&query(0.0, 100.0, lod)), CacheLookup::Exact(_)));
        assert_eq!(cache.lookup(&query(10.0, 90.0, lod)), CacheLookup::Miss);
    }

    #[test]
    fn test_extra_ids_must_match_when_requested() {
        let lod = LevelOfDetail::Absolute(1);
        let plain = query(0.0, 100.0, lod);
        let with_extras = query(0.0, 100.0, lod).with_extra_ids(vec![7], vec![]);
        let inner_with_extras = query(10.0, 90.0, lod).with_extra_ids(vec![7], vec![]);

        assert!(!can_substitute(&plain, &inner_with_extras));
        assert!(can_substitute(&with_extras, &inner_with_extras));
        assert!(can_substitute(&with_extras, &query(10.0, 90.0, lod)));
    }

    #[test]
    fn test_labels_flag_must_match() {
        let lod = LevelOfDetail::Absolute(1);
        let labelled = query(0.0, 100.0, lod).with_labels(true);
        assert!(!can_substitute(&labelled, &query(10.0, 90.0, lod)));
    }

    #[test]
    fn test_byte_bound_evicts_oldest_and_rejects_oversized() {
        let mut cache = ResultCache::new(&CacheConfig {
            max_bytes: 100,
            ..CacheConfig::default()
        });
        let lod = LevelOfDetail::Absolute(1);
        assert!(cache.insert(query(0.0, 1.0, lod), batch(false), 60));
        assert!(cache.insert(query(0.0, 2.0, lod), batch(false), 60));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().bytes, 60);
        assert!(!cache.insert(query(0.0, 3.0, lod), batch(false), 101));
    }

    #[test]
    fn test_disabled_cache_never_hits() {
        let mut cache = ResultCache::new(&CacheConfig {
            enabled: false,
            ..CacheConfig::default()
        });
        let q = query(0.0, 1.0, LevelOfDetail::Absolute(1));
        assert!(!cache.insert(q.clone(), batch(false), 1));
        assert_eq!(cache.lookup(&q), CacheLookup::Miss);
    }
}
