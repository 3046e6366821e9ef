//! Generic TTL key/value cache
//!
//! Entries live in a sharded `DashMap`, so a write locks only the shard that
//! holds its key and unrelated instruments never contend. Expired entries are
//! logically absent: `get` treats them as a miss and removes them on the way
//! out, and `sweep` clears the rest in the background.

use dashmap::DashMap;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::debug;

/// Default time-to-live for entries set without an explicit TTL
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

/// One cached value and its lifetime
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub key: String,
    pub value: V,
    pub inserted_at: Instant,
    pub ttl: Duration,
    /// Serialised size of the value plus the key, measured at insert
    pub approx_bytes: usize,
}

impl<V> CacheEntry<V> {
    /// Live iff `now - inserted_at < ttl`
    pub fn is_live(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.inserted_at) < self.ttl
    }
}

/// Point-in-time cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub total_entries: usize,
    pub live_entries: usize,
    pub expired_entries: usize,
    pub approx_bytes: usize,
    pub default_ttl_secs: u64,
}

/// Concurrent TTL cache keyed by string
pub struct CacheStore<V> {
    entries: DashMap<String, CacheEntry<V>>,
    default_ttl: Duration,
}

impl<V> Default for CacheStore<V>
where
    V: Clone + Serialize,
{
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl<V> CacheStore<V>
where
    V: Clone + Serialize,
{
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            default_ttl,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Look up a live entry. An expired entry is a miss and is evicted here.
    pub fn get(&self, key: &str) -> Option<V> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.is_live(now) {
                return Some(entry.value.clone());
            }
        } else {
            return None;
        }

        // The read guard is gone; remove only if still expired so a
        // concurrent fresh `set` survives.
        if self
            .entries
            .remove_if(key, |_, entry| !entry.is_live(Instant::now()))
            .is_some()
        {
            debug!(key, "evicted expired cache entry");
        }
        None
    }

    /// Insert or fully replace with the default TTL
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.set_with_ttl(key, value, self.default_ttl);
    }

    /// Insert or fully replace, resetting the insertion time
    pub fn set_with_ttl(&self, key: impl Into<String>, value: V, ttl: Duration) {
        let key = key.into();
        let approx_bytes = key.len()
            + serde_json::to_vec(&value)
                .map(|bytes| bytes.len())
                .unwrap_or(0);
        let entry = CacheEntry {
            key: key.clone(),
            value,
            inserted_at: Instant::now(),
            ttl,
            approx_bytes,
        };
        self.entries.insert(key, entry);
    }

    /// Remove a key; no-op when absent
    pub fn delete(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry, live or expired, whose key matches `pattern`.
    ///
    /// A pattern containing `*` or `?` is a glob over the whole key; anything
    /// else is a key prefix. Returns the number of entries removed.
    pub fn invalidate_pattern(&self, pattern: &str) -> usize {
        let matcher = KeyPattern::new(pattern);
        let mut removed = 0usize;
        self.entries.retain(|key, _| {
            if matcher.matches(key) {
                removed += 1;
                false
            } else {
                true
            }
        });
        if removed > 0 {
            debug!(pattern, removed, "invalidated cache entries");
        }
        removed
    }

    /// Physically remove expired entries
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_live(now));
        before.saturating_sub(self.entries.len())
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Physical entry count, including expired entries not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Live keys, for diagnostics
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| e.is_live(now))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> CacheStats {
        let now = Instant::now();
        let mut stats = CacheStats {
            default_ttl_secs: self.default_ttl.as_secs(),
            ..CacheStats::default()
        };
        for entry in self.entries.iter() {
            stats.total_entries += 1;
            stats.approx_bytes += entry.approx_bytes;
            if entry.is_live(now) {
                stats.live_entries += 1;
            } else {
                stats.expired_entries += 1;
            }
        }
        stats
    }
}

/// Compiled key pattern: glob when it has wildcards, prefix otherwise
enum KeyPattern<'a> {
    Prefix(&'a str),
    Glob(Vec<char>),
}

impl<'a> KeyPattern<'a> {
    fn new(pattern: &'a str) -> Self {
        if pattern.contains(['*', '?']) {
            KeyPattern::Glob(pattern.chars().collect())
        } else {
            KeyPattern::Prefix(pattern)
        }
    }

    fn matches(&self, key: &str) -> bool {
        match self {
            KeyPattern::Prefix(prefix) => key.starts_with(prefix),
            KeyPattern::Glob(pattern) => {
                let key: Vec<char> = key.chars().collect();
                glob_match(pattern, &key)
            }
        }
    }
}

/// Iterative glob match with single-star backtracking
fn glob_match(pattern: &[char], text: &[char]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut mark = 0usize;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
