//! Shard-to-location cache: a total interval map over the key space.
//!
//! Boundaries are stored in a `BTreeMap` keyed by interval start; an
//! interval runs to the next boundary (the last one runs to the end of the
//! key space). Every interval maps to either a shared [`LocationInfo`] or
//! to "unknown". The map always partitions the whole key space: inserts
//! and invalidations replace coverage, they never punch holes.
//!
//! Admission over budget evicts a bounded number of randomly chosen cached
//! intervals. Random eviction keeps admission O(1) amortized and avoids the
//! thrash an LRU would exhibit under scans of cold regions.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, RwLock};

use meridian_rpc::interface::LocationInfo;
use meridian_rpc::types::{all_keys_begin, all_keys_end, Key, KeyRange};
use rand::seq::IteratorRandom;

pub struct LocationCache {
    inner: RwLock<CacheInner>,
}

struct CacheInner {
    /// Interval start -> location of `[start, next_start)`.
    map: BTreeMap<Key, Option<Arc<LocationInfo>>>,
    /// Number of known (non-`None`) intervals.
    cached: usize,
    max_cached: usize,
    evictions_per_insert: usize,
}

impl LocationCache {
    pub fn new(max_cached: usize, evictions_per_insert: usize) -> Self {
        let mut map = BTreeMap::new();
        map.insert(all_keys_begin(), None);
        Self {
            inner: RwLock::new(CacheInner {
                map,
                cached: 0,
                max_cached,
                evictions_per_insert,
            }),
        }
    }

    pub fn set_max_cached(&self, max_cached: usize) {
        self.inner.write().unwrap().max_cached = max_cached;
    }

    /// Number of known intervals currently cached.
    pub fn cached_len(&self) -> usize {
        self.inner.read().unwrap().cached
    }

    /// The interval containing `key`, or containing the key immediately
    /// before `key` when `reverse`.
    pub fn get(&self, key: &[u8], reverse: bool) -> (KeyRange, Option<Arc<LocationInfo>>) {
        let inner = self.inner.read().unwrap();
        let bound = if reverse {
            Bound::Excluded(key)
        } else {
            Bound::Included(key)
        };
        let (begin, value) = inner
            .map
            .range::<[u8], _>((Bound::Unbounded, bound))
            .next_back()
            .map(|(k, v)| (k.clone(), v.clone()))
            // reverse lookup of the first key has nothing before it; report
            // the first interval as the (unknown-permitted) answer
            .unwrap_or_else(|| {
                let (k, v) = inner.map.iter().next().expect("map is never empty");
                (k.clone(), v.clone())
            });
        let end = inner.next_boundary(&begin);
        (KeyRange::new(begin, end), value)
    }

    /// Known intervals intersecting `range`, in scan order, up to `limit`.
    /// Returns `None` when any intersecting interval within the limit is
    /// unknown, so the caller refreshes from the cluster.
    pub fn get_ranges(
        &self,
        range: &KeyRange,
        limit: usize,
        reverse: bool,
    ) -> Option<Vec<(KeyRange, Arc<LocationInfo>)>> {
        if range.is_empty() {
            return Some(Vec::new());
        }
        let inner = self.inner.read().unwrap();

        let mut intervals = Vec::new();
        let first = inner
            .map
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(range.begin.as_ref())))
            .next_back()
            .map(|(k, _)| k.clone())
            .unwrap_or_else(all_keys_begin);
        let mut starts: Vec<Key> = vec![first.clone()];
        starts.extend(
            inner
                .map
                .range::<[u8], _>((Bound::Excluded(first.as_ref()), Bound::Excluded(range.end.as_ref())))
                .map(|(k, _)| k.clone()),
        );
        if reverse {
            starts.reverse();
        }

        for start in starts.into_iter().take(limit) {
            let end = inner.next_boundary(&start);
            let value = inner.map.get(&start).cloned().flatten()?;
            intervals.push((KeyRange::new(start, end), value));
        }
        Some(intervals)
    }

    /// Replace coverage of `range` with `info`, evicting random cached
    /// intervals first if the cache is over budget.
    pub fn insert(&self, range: KeyRange, info: Arc<LocationInfo>) {
        if range.is_empty() {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        if inner.cached + 1 > inner.max_cached {
            inner.evict(&range.begin);
        }
        inner.replace(range, Some(info));
    }

    /// Forget the interval containing `key` (or the one before, if
    /// `reverse`).
    pub fn invalidate_key(&self, key: &[u8], reverse: bool) {
        let mut inner = self.inner.write().unwrap();
        let bound = if reverse {
            Bound::Excluded(key)
        } else {
            Bound::Included(key)
        };
        let start = inner
            .map
            .range::<[u8], _>((Bound::Unbounded, bound))
            .next_back()
            .map(|(k, _)| k.clone());
        if let Some(start) = start {
            if let Some(slot) = inner.map.get_mut(&start) {
                if slot.take().is_some() {
                    inner.cached -= 1;
                }
            }
        }
    }

    /// Forget every interval intersecting `range`.
    pub fn invalidate_range(&self, range: &KeyRange) {
        if range.is_empty() {
            return;
        }
        let mut inner = self.inner.write().unwrap();
        let mut widened = range.clone();
        let covering = inner
            .map
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(range.begin.as_ref())))
            .next_back()
            .map(|(k, _)| k.clone());
        if let Some(covering) = covering {
            widened.begin = covering;
        }
        widened.end = inner.next_boundary_from(&range.end);
        inner.replace(widened, None);
    }
}

impl CacheInner {
    /// Start of the interval after the one beginning at `start`.
    fn next_boundary(&self, start: &Key) -> Key {
        self.map
            .range::<[u8], _>((Bound::Excluded(start.as_ref()), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
            .unwrap_or_else(all_keys_end)
    }

    /// First boundary at or after `key`, else the end of the key space.
    fn next_boundary_from(&self, key: &Key) -> Key {
        self.map
            .range::<[u8], _>((Bound::Included(key.as_ref()), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone())
            .unwrap_or_else(all_keys_end)
    }

    /// Replace coverage of `range` with `value`, keeping the partition
    /// total: whatever covered `range.end` keeps covering from `range.end`.
    fn replace(&mut self, range: KeyRange, value: Option<Arc<LocationInfo>>) {
        let end_cover = self
            .map
            .range::<[u8], _>((Bound::Unbounded, Bound::Included(range.end.as_ref())))
            .next_back()
            .map(|(_, v)| v.clone())
            .unwrap_or(None);

        let inside: Vec<Key> = self
            .map
            .range::<[u8], _>((
                Bound::Included(range.begin.as_ref()),
                Bound::Excluded(range.end.as_ref()),
            ))
            .map(|(k, _)| k.clone())
            .collect();
        for k in inside {
            if let Some(Some(_)) = self.map.remove(&k) {
                self.cached -= 1;
            }
        }

        if value.is_some() {
            self.cached += 1;
        }
        self.map.insert(range.begin, value);
        if range.end < all_keys_end() && !self.map.contains_key(&range.end) {
            if end_cover.is_some() {
                self.cached += 1;
            }
            self.map.insert(range.end, end_cover);
        }
        // Never drop the boundary anchoring the start of the key space.
        self.map.entry(all_keys_begin()).or_insert(None);
    }

    /// Evict up to `evictions_per_insert` randomly chosen cached intervals,
    /// sparing the interval about to be (re)inserted at `keep`.
    fn evict(&mut self, keep: &Key) {
        let mut rng = rand::thread_rng();
        let victims: Vec<Key> = self
            .map
            .iter()
            .filter(|(k, v)| v.is_some() && *k != keep)
            .map(|(k, _)| k.clone())
            .choose_multiple(&mut rng, self.evictions_per_insert);
        for k in victims {
            if let Some(slot) = self.map.get_mut(&k) {
                if slot.take().is_some() {
                    self.cached -= 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use meridian_rpc::interface::StorageServerInterface;

    fn key(s: &str) -> Key {
        Bytes::copy_from_slice(s.as_bytes())
    }

    fn range(b: &str, e: &str) -> KeyRange {
        KeyRange::new(key(b), key(e))
    }

    fn loc(id: u64) -> Arc<LocationInfo> {
        LocationInfo::new(vec![Arc::new(StorageServerInterface::with_base_token(
            id,
            format!("ss-{id}:4500"),
            id * 100,
        ))])
    }

    fn server_ids(info: &Arc<LocationInfo>) -> Vec<u64> {
        info.servers.iter().map(|s| s.id).collect()
    }

    #[test]
    fn starts_fully_unknown() {
        let cache = LocationCache::new(100, 10);
        let (r, v) = cache.get(b"anything", false);
        assert_eq!(r.begin, all_keys_begin());
        assert_eq!(r.end, all_keys_end());
        assert!(v.is_none());
        assert_eq!(cache.cached_len(), 0);
    }

    #[test]
    fn insert_then_point_lookup() {
        let cache = LocationCache::new(100, 10);
        cache.insert(range("a", "z"), loc(1));

        let (r, v) = cache.get(b"m", false);
        assert_eq!(r, range("a", "z"));
        assert_eq!(server_ids(&v.unwrap()), vec![1]);

        // Outside the inserted range stays unknown.
        let (r, v) = cache.get(b"A", false);
        assert_eq!(r.end, key("a"));
        assert!(v.is_none());
    }

    #[test]
    fn overlapping_insert_replaces_coverage() {
        let cache = LocationCache::new(100, 10);
        cache.insert(range("a", "z"), loc(1));
        cache.insert(range("m", "p"), loc(2));

        let (r, v) = cache.get(b"m", false);
        assert_eq!(r, range("m", "p"));
        assert_eq!(server_ids(&v.unwrap()), vec![2]);

        let (r, v) = cache.get(b"l", false);
        assert_eq!(r, range("a", "m"));
        assert_eq!(server_ids(&v.unwrap()), vec![1]);

        let (r, v) = cache.get(b"q", false);
        assert_eq!(r, range("p", "z"));
        assert_eq!(server_ids(&v.unwrap()), vec![1]);
    }

    #[test]
    fn reverse_lookup_returns_preceding_interval() {
        let cache = LocationCache::new(100, 10);
        cache.insert(range("a", "m"), loc(1));
        cache.insert(range("m", "z"), loc(2));

        // The key before "m" lives in ["a","m").
        let (r, v) = cache.get(b"m", true);
        assert_eq!(r, range("a", "m"));
        assert_eq!(server_ids(&v.unwrap()), vec![1]);
    }

    #[test]
    fn range_lookup_misses_on_unknown_gap() {
        let cache = LocationCache::new(100, 10);
        cache.insert(range("a", "m"), loc(1));
        cache.insert(range("p", "z"), loc(2));

        assert!(cache.get_ranges(&range("b", "y"), 10, false).is_none());

        let hit = cache.get_ranges(&range("b", "l"), 10, false).unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].0, range("a", "m"));
    }

    #[test]
    fn range_lookup_respects_limit_and_reverse() {
        let cache = LocationCache::new(100, 10);
        cache.insert(range("a", "f"), loc(1));
        cache.insert(range("f", "m"), loc(2));
        cache.insert(range("m", "z"), loc(3));

        let fwd = cache.get_ranges(&range("b", "y"), 2, false).unwrap();
        assert_eq!(fwd.len(), 2);
        assert_eq!(fwd[0].0, range("a", "f"));
        assert_eq!(fwd[1].0, range("f", "m"));

        let rev = cache.get_ranges(&range("b", "y"), 2, true).unwrap();
        assert_eq!(rev[0].0, range("m", "z"));
        assert_eq!(rev[1].0, range("f", "m"));
    }

    #[test]
    fn invalidate_key_forgets_interval() {
        let cache = LocationCache::new(100, 10);
        cache.insert(range("a", "z"), loc(1));
        cache.invalidate_key(b"m", false);
        let (_, v) = cache.get(b"m", false);
        assert!(v.is_none());
        assert_eq!(cache.cached_len(), 0);
    }

    #[test]
    fn invalidate_range_widens_to_interval_boundaries() {
        let cache = LocationCache::new(100, 10);
        cache.insert(range("a", "m"), loc(1));
        cache.insert(range("m", "z"), loc(2));
        cache.invalidate_range(&range("l", "n"));
        assert!(cache.get(b"b", false).1.is_none());
        assert!(cache.get(b"n", false).1.is_none());
    }

    #[test]
    fn eviction_bounds_cached_intervals() {
        let cache = LocationCache::new(8, 4);
        for i in 0..64u8 {
            let b = Bytes::copy_from_slice(&[i]);
            let e = Bytes::copy_from_slice(&[i, 0xff]);
            cache.insert(KeyRange::new(b, e), loc(u64::from(i)));
        }
        assert!(cache.cached_len() <= 8 + 1);
        // Everything still resolves to some interval: the map stays total.
        let (r, _) = cache.get(&[200u8], false);
        assert!(r.contains(&[200u8]));
    }
}
