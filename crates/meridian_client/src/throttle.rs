//! Client-side tag throttling.
//!
//! GRV replies piggyback per-tag admission rates for the request's
//! priority. The table keeps one entry per `(priority, tag)`; entries
//! expire by wall clock, and a reply that omits a previously-known tag
//! removes it.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

use meridian_rpc::messages::TagThrottleLimits;
use meridian_rpc::types::{Priority, Tag};

#[derive(Debug, Clone, Copy)]
struct TagThrottleEntry {
    /// Admitted transactions per second; zero means fully throttled.
    rate: f64,
    expiration: Instant,
    last_check: Instant,
}

#[derive(Default)]
pub struct TagThrottleTable {
    inner: RwLock<HashMap<Priority, HashMap<Tag, TagThrottleEntry>>>,
}

impl TagThrottleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one GRV reply's throttle updates for `priority`. Tags the
    /// request carried but the reply omitted are no longer throttled.
    pub fn ingest(
        &self,
        priority: Priority,
        requested: impl Iterator<Item = Tag>,
        updates: &HashMap<Tag, TagThrottleLimits>,
    ) {
        let now = Instant::now();
        let mut inner = self.inner.write().unwrap();
        let per_priority = inner.entry(priority).or_default();
        for tag in requested {
            if !updates.contains_key(&tag) {
                per_priority.remove(&tag);
            }
        }
        for (tag, limits) in updates {
            per_priority.insert(
                tag.clone(),
                TagThrottleEntry {
                    rate: limits.rate,
                    expiration: now + Duration::from_secs_f64(limits.expiration_secs.max(0.0)),
                    last_check: now,
                },
            );
        }
    }

    /// Delay the next transaction carrying `tags` at `priority` must wait
    /// before requesting a read version. `None` means unthrottled.
    pub fn required_delay(&self, priority: Priority, tags: &[Tag]) -> Option<Duration> {
        if tags.is_empty() {
            return None;
        }
        let now = Instant::now();
        let mut inner = self.inner.write().unwrap();
        let per_priority = inner.get_mut(&priority)?;

        let mut delay: Option<Duration> = None;
        for tag in tags {
            let Some(entry) = per_priority.get_mut(tag) else {
                continue;
            };
            if entry.expiration <= now {
                per_priority.remove(tag);
                continue;
            }
            let wait = if entry.rate <= 0.0 {
                entry.expiration - now
            } else {
                // Space admissions evenly at the granted rate.
                let interval = Duration::from_secs_f64(1.0 / entry.rate);
                let next_slot = entry.last_check + interval;
                if next_slot <= now {
                    entry.last_check = now;
                    continue;
                }
                next_slot - now
            };
            delay = Some(delay.map_or(wait, |d| d.max(wait)));
        }
        delay
    }

    /// Whether any of `tags` is currently throttled at `priority`.
    pub fn is_throttled(&self, priority: Priority, tags: &[Tag]) -> bool {
        let now = Instant::now();
        let inner = self.inner.read().unwrap();
        let Some(per_priority) = inner.get(&priority) else {
            return false;
        };
        tags.iter().any(|tag| {
            per_priority
                .get(tag)
                .is_some_and(|e| e.expiration > now && e.rate <= 0.0)
        })
    }

    pub fn expire(&self) {
        let now = Instant::now();
        let mut inner = self.inner.write().unwrap();
        for per_priority in inner.values_mut() {
            per_priority.retain(|_, e| e.expiration > now);
        }
    }
}
