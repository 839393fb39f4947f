//! Resolver caches
//!
//! Process-wide TTL caches with lazy eviction on read plus a periodic
//! sweep, and the per-domain single-flight guard for live captures. These
//! are caches, not ledgers: shutdown drains nothing.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::skill::SkillManifest;

/// Default TTL for both resolver caches
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

struct Entry<T> {
    value: T,
    expires: Instant,
}

/// TTL map with read-side eviction
pub struct TtlCache<T> {
    inner: DashMap<String, Entry<T>>,
    ttl: Duration,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            inner: DashMap::new(),
            ttl,
        }
    }

    pub fn get(&self, key: &str) -> Option<T> {
        let expired = match self.inner.get(key) {
            Some(entry) if entry.expires > Instant::now() => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.inner.remove(key);
        }
        None
    }

    pub fn insert(&self, key: impl Into<String>, value: T) {
        self.inner.insert(
            key.into(),
            Entry {
                value,
                expires: Instant::now() + self.ttl,
            },
        );
    }

    pub fn remove(&self, key: &str) {
        self.inner.remove(key);
    }

    /// Drop every expired entry
    pub fn sweep(&self) {
        let now = Instant::now();
        self.inner.retain(|_, entry| entry.expires > now);
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

/// Route cache payload: which skill answered an intent
#[derive(Debug, Clone)]
pub struct RouteCacheEntry {
    pub skill_id: String,
    pub domain: Option<String>,
}

/// All resolver-side shared state
pub struct ResolverCaches {
    /// (domain|global):intent -> skill id
    pub route: TtlCache<RouteCacheEntry>,
    /// domain -> freshly learned skill
    pub captured: TtlCache<SkillManifest>,
    /// domains with a live capture in flight
    inflight: DashMap<String, ()>,
}

impl ResolverCaches {
    pub fn new(route_ttl: Duration, captured_ttl: Duration) -> Self {
        Self {
            route: TtlCache::new(route_ttl),
            captured: TtlCache::new(captured_ttl),
            inflight: DashMap::new(),
        }
    }

    /// Cache key for a resolve
    pub fn route_key(intent: &str, domain: Option<&str>) -> String {
        format!("{}:{}", domain.unwrap_or("global"), intent)
    }

    /// Claim the capture slot for a domain; false when already claimed
    pub fn try_begin_capture(&self, domain: &str) -> bool {
        use dashmap::mapref::entry::Entry as MapEntry;
        match self.inflight.entry(domain.to_string()) {
            MapEntry::Occupied(_) => false,
            MapEntry::Vacant(slot) => {
                slot.insert(());
                true
            }
        }
    }

    pub fn end_capture(&self, domain: &str) {
        self.inflight.remove(domain);
    }

    pub fn capture_in_flight(&self, domain: &str) -> bool {
        self.inflight.contains_key(domain)
    }

    /// Periodic TTL sweep until cancelled
    pub async fn run_sweeper(self: std::sync::Arc<Self>, cancel: CancellationToken, every: Duration) {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.route.sweep();
                    self.captured.sweep();
                }
            }
        }
    }
}

/// RAII guard for the capture slot
pub struct CaptureGuard<'a> {
    caches: &'a ResolverCaches,
    domain: String,
}

impl<'a> CaptureGuard<'a> {
    pub fn acquire(caches: &'a ResolverCaches, domain: &str) -> Option<Self> {
        caches.try_begin_capture(domain).then(|| Self {
            caches,
            domain: domain.to_string(),
        })
    }
}

impl Drop for CaptureGuard<'_> {
    fn drop(&mut self) {
        self.caches.end_capture(&self.domain);
    }
}
