// Operation Record Store - completion markers and cached results
// Markers and results for one key share a TTL and are always released together.

use crate::keys;
use crate::kv_store::{SharedStore, StoreError};
use crate::metrics;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Longest expiry sent to a store. Anything longer is stored without expiry.
pub const MAX_STORE_EXPIRY: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// Lifetime of the records written for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Persist until explicitly released.
    Forever,
    /// Expire after the given duration.
    Expires(Duration),
}

impl Ttl {
    /// `None` and a zero duration both mean [`Ttl::Forever`].
    pub fn from_duration(duration: Option<Duration>) -> Self {
        match duration {
            Some(d) if !d.is_zero() => Ttl::Expires(d),
            _ => Ttl::Forever,
        }
    }

    /// Hours as configured in settings; `None` or non-positive means forever.
    pub fn from_hours(hours: Option<f64>) -> Self {
        match hours {
            Some(h) if h.is_finite() && h > 0.0 => Duration::try_from_secs_f64(h * 3600.0)
                .map(Ttl::Expires)
                .unwrap_or(Ttl::Forever),
            _ => Ttl::Forever,
        }
    }

    /// Expiry as sent to the store, rounded up to whole seconds so a
    /// sub-second TTL never degrades into "forever". Expiries beyond
    /// [`MAX_STORE_EXPIRY`] are sent as no expiry.
    pub fn as_store_expiry(&self) -> Option<Duration> {
        match self {
            Ttl::Forever => None,
            Ttl::Expires(d) if *d > MAX_STORE_EXPIRY => None,
            Ttl::Expires(d) => {
                let secs = d.as_secs().saturating_add(u64::from(d.subsec_nanos() > 0));
                Some(Duration::from_secs(secs.max(1)))
            }
        }
    }
}

/// Reads and writes the two record types against the backing store.
#[derive(Clone)]
pub struct OperationRecordStore {
    store: SharedStore,
    prefix: String,
}

impl OperationRecordStore {
    pub fn new(store: SharedStore, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn backing_store(&self) -> &SharedStore {
        &self.store
    }

    pub async fn is_completed(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.completion_marker(key).await?.is_some())
    }

    /// Reservation time recorded in the marker, if one is held.
    pub async fn completed_at(&self, key: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        let Some(raw) = self.completion_marker(key).await? else {
            return Ok(None);
        };
        DateTime::parse_from_rfc3339(&raw)
            .map(|t| Some(t.with_timezone(&Utc)))
            .map_err(|e| StoreError::Codec(format!("marker {}: {}", key, e)))
    }

    async fn completion_marker(&self, key: &str) -> Result<Option<String>, StoreError> {
        let start = Instant::now();
        let marker = self.store.get(&keys::completed_key(&self.prefix, key)).await;
        metrics::record_store_duration("get_marker", start.elapsed());
        marker
    }

    /// Atomically creates the completion marker if absent.
    ///
    /// Returns `true` only for the single caller that created it. The winner
    /// also drops any result left behind by an earlier marker, so a cached
    /// result never outlives the marker it was written under.
    pub async fn reserve(&self, key: &str, ttl: Ttl) -> Result<bool, StoreError> {
        let start = Instant::now();
        let marker = Utc::now().to_rfc3339();
        let completed_key = keys::completed_key(&self.prefix, key);
        let won = self
            .store
            .set(&completed_key, &marker, ttl.as_store_expiry(), true)
            .await;
        metrics::record_store_duration("reserve", start.elapsed());
        let won = won?;
        debug!(key, won, "reservation attempted");

        if won {
            if let Err(e) = self.store.delete(&[keys::result_key(&self.prefix, key)]).await {
                // Give the marker back so the caller can retry
                if let Err(rollback) = self.store.delete(&[completed_key]).await {
                    warn!(key, error = %rollback, "Could not roll back reservation");
                }
                return Err(e);
            }
        }
        Ok(won)
    }

    /// Caches `value` for `key`. Best effort: failures are logged and swallowed.
    ///
    /// Values that serialize to JSON `null` are not stored, and any result
    /// already held for `key` is removed.
    pub async fn store_result<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Ttl) {
        let json = match serde_json::to_value(value) {
            Ok(Value::Null) => {
                if let Err(e) = self.store.delete(&[keys::result_key(&self.prefix, key)]).await {
                    warn!(key, error = %e, "Could not remove stale result");
                }
                return;
            }
            Ok(json) => json.to_string(),
            Err(e) => {
                warn!(key, error = %e, "Could not serialize result, skipping result cache");
                return;
            }
        };

        let start = Instant::now();
        let outcome = self
            .store
            .set(&keys::result_key(&self.prefix, key), &json, ttl.as_store_expiry(), false)
            .await;
        metrics::record_store_duration("store_result", start.elapsed());
        if let Err(e) = outcome {
            warn!(key, error = %e, "Could not store result, skipping result cache");
        }
    }

    /// Cached result for `key`. Undecodable payloads are logged and read as absent.
    pub async fn load_result<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StoreError> {
        let start = Instant::now();
        let raw = self.store.get(&keys::result_key(&self.prefix, key)).await;
        metrics::record_store_duration("load_result", start.elapsed());

        let Some(raw) = raw? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                warn!(key, error = %e, "Could not deserialize stored result");
                Ok(None)
            }
        }
    }

    /// Deletes the marker and any cached result for `key`.
    pub async fn release(&self, key: &str) -> Result<(), StoreError> {
        let start = Instant::now();
        let removed = self
            .store
            .delete(&[
                keys::completed_key(&self.prefix, key),
                keys::result_key(&self.prefix, key),
            ])
            .await;
        metrics::record_store_duration("release", start.elapsed());
        let removed = removed?;
        debug!(key, removed, "released side effect records");
        Ok(())
    }
}

impl std::fmt::Debug for OperationRecordStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationRecordStore")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
