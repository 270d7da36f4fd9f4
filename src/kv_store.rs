// Key-value backing store abstraction
// The only primitive that must be atomic is the conditional write used for reservations.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Shared handle to the backing store, constructed once at process start and
/// injected into every component that needs it.
pub type SharedStore = Arc<dyn KvStore>;

/// Errors raised by a backing store.
///
/// All variants are considered retryable by callers: the guard never claims an
/// operation ran when the store could not confirm it.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Backing store unavailable: {0}")]
    Unavailable(String),
    #[error("Backing store command {command} failed: {reason}")]
    Backend { command: &'static str, reason: String },
    #[error("Stored value could not be decoded: {0}")]
    Codec(String),
}

/// Minimal command set the side-effect cache needs from a key-value store.
///
/// Mirrors `GET`, `SET key value [NX] [EX seconds]`, `DEL key...` and
/// `SCAN MATCH pattern`.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value. Expired keys read as absent.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value with an optional expiry.
    ///
    /// With `only_if_absent` the write is a single atomic set-if-absent and the
    /// return value reports whether this call created the key. Without it the
    /// value is overwritten and `true` is returned.
    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> Result<bool, StoreError>;

    /// Delete keys, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError>;

    /// List live keys matching a Redis-style glob pattern.
    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError>;
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if now >= deadline)
    }
}

/// In-process store backed by a `DashMap`.
///
/// Expiry is evaluated lazily against `tokio::time::Instant`, so a paused tokio
/// clock drives TTLs deterministically in tests. Set-if-absent holds the shard
/// lock for the whole check-and-insert.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    entries: Arc<DashMap<String, StoredValue>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience constructor returning the store as a [`SharedStore`].
    pub fn shared() -> SharedStore {
        Arc::new(Self::new())
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| !e.value().is_expired(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let now = Instant::now();
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(now) => return Ok(Some(entry.value.clone())),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove_if(key, |_, v| v.is_expired(now));
        }
        Ok(None)
    }

    async fn set(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
        only_if_absent: bool,
    ) -> Result<bool, StoreError> {
        let now = Instant::now();
        let stored = StoredValue {
            value: value.to_string(),
            // A deadline past the clock's range never expires
            expires_at: ttl.and_then(|ttl| now.checked_add(ttl)),
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if only_if_absent && !occupied.get().is_expired(now) {
                    debug!(key, "set-if-absent rejected, key already held");
                    return Ok(false);
                }
                occupied.insert(stored);
            }
            Entry::Vacant(vacant) => {
                vacant.insert(stored);
            }
        }
        Ok(true)
    }

    async fn delete(&self, keys: &[String]) -> Result<usize, StoreError> {
        let now = Instant::now();
        let mut removed = 0;
        for key in keys {
            if let Some((_, v)) = self.entries.remove(key) {
                if !v.is_expired(now) {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !e.value().is_expired(now) && glob_match(pattern, e.key()))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

/// Redis `MATCH` glob semantics: `*`, `?`, `[abc]`, `[^a]`, `[a-z]` and `\x` escapes.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    glob_match_from(&p, &t)
}

fn glob_match_from(p: &[char], t: &[char]) -> bool {
    let (mut pi, mut ti) = (0, 0);
    // Backtrack point for the most recent `*`.
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() {
            match p[pi] {
                '*' => {
                    star = Some((pi, ti));
                    pi += 1;
                    continue;
                }
                '?' => {
                    pi += 1;
                    ti += 1;
                    continue;
                }
                '[' => {
                    if let Some((matched, next)) = match_class(p, pi, t[ti]) {
                        if matched {
                            pi = next;
                            ti += 1;
                            continue;
                        }
                    } else if t[ti] == '[' {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
                '\\' if pi + 1 < p.len() => {
                    if p[pi + 1] == t[ti] {
                        pi += 2;
                        ti += 1;
                        continue;
                    }
                }
                c => {
                    if c == t[ti] {
                        pi += 1;
                        ti += 1;
                        continue;
                    }
                }
            }
        }
        match star {
            Some((star_pi, star_ti)) => {
                pi = star_pi + 1;
                ti = star_ti + 1;
                star = Some((star_pi, star_ti + 1));
            }
            None => return false,
        }
    }

    p[pi..].iter().all(|&c| c == '*')
}

/// Evaluates a `[...]` class starting at `start`. Returns `None` for an unterminated class.
fn match_class(p: &[char], start: usize, c: char) -> Option<(bool, usize)> {
    let mut i = start + 1;
    let negate = i < p.len() && p[i] == '^';
    if negate {
        i += 1;
    }
    let mut matched = false;
    let mut first = true;
    while i < p.len() && (p[i] != ']' || first) {
        first = false;
        let mut lo = p[i];
        if lo == '\\' && i + 1 < p.len() {
            i += 1;
            lo = p[i];
        }
        if i + 2 < p.len() && p[i + 1] == '-' && p[i + 2] != ']' {
            let hi = p[i + 2];
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            if c >= lo && c <= hi {
                matched = true;
            }
            i += 3;
        } else {
            if c == lo {
                matched = true;
            }
            i += 1;
        }
    }
    if i >= p.len() {
        return None;
    }
    Some((matched != negate, i + 1))
}
