//! Execution guard: at-most-once execution of an async operation per key.
//!
//! The guard reserves the operation key with an atomic set-if-absent *before*
//! executing, and releases it if the operation fails or is cancelled. Exactly
//! one concurrent caller wins the reservation; every other caller is a
//! duplicate and receives the cached result (when result caching is on) or
//! [`Outcome::Skipped`].
//!
//! ```no_run
//! use side_effect_guard::{MemoryStore, OperationIdentity, Invocation, SideEffect};
//!
//! # async fn demo() -> Result<(), side_effect_guard::StoreError> {
//! let guard = SideEffect::builder(MemoryStore::shared())
//!     .store_result(true)
//!     .build()
//!     .expect("valid configuration");
//!
//! let identity = OperationIdentity::new("send_welcome_email", "v1");
//! let outcome = guard
//!     .run(&identity, Invocation::empty(), |_| async {
//!         Ok::<_, side_effect_guard::StoreError>("sent".to_string())
//!     })
//!     .await?;
//! assert_eq!(outcome.into_value().as_deref(), Some("sent"));
//! # Ok(())
//! # }
//! ```

use crate::invalidation::{ClearDirective, Invalidator};
use crate::key_policy::{KeyDeriver, KeyPolicy, KeySpec, LiteralKey};
use crate::kv_store::{SharedStore, StoreError};
use crate::metrics;
use crate::operation::{BindError, Invocation, OperationIdentity, Signature};
use crate::record_store::{OperationRecordStore, Ttl};
use crate::settings::SettingsHandle;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Invalid guard configuration, reported by [`SideEffectBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Cannot specify both an explicit key and a key policy - providing a key implies manual control")]
    KeyAndPolicy,
    #[error("At least one key policy component must be set")]
    EmptyPolicy,
}

/// Result of a guarded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome<T> {
    /// This call executed the operation.
    Fresh(T),
    /// Duplicate call; the value cached by the first execution.
    Cached(T),
    /// Duplicate call with nothing cached. The operation did not run.
    Skipped,
}

impl<T> Outcome<T> {
    /// The returned or cached value; `None` for skipped duplicates.
    pub fn into_value(self) -> Option<T> {
        match self {
            Outcome::Fresh(v) | Outcome::Cached(v) => Some(v),
            Outcome::Skipped => None,
        }
    }

    pub fn value(&self) -> Option<&T> {
        match self {
            Outcome::Fresh(v) | Outcome::Cached(v) => Some(v),
            Outcome::Skipped => None,
        }
    }

    /// Whether this call ran the operation.
    pub fn was_executed(&self) -> bool {
        matches!(self, Outcome::Fresh(_))
    }

    /// Whether this call was recognised as a duplicate of an earlier execution.
    pub fn is_duplicate(&self) -> bool {
        !self.was_executed()
    }
}

/// Builder for [`SideEffect`]. Configuration errors surface from [`build`](Self::build),
/// never at call time.
pub struct SideEffectBuilder {
    store: SharedStore,
    key: Option<Arc<dyn KeyDeriver>>,
    key_policy: KeyPolicy,
    ttl: Option<Ttl>,
    store_result: bool,
    settings: Option<SettingsHandle>,
}

impl SideEffectBuilder {
    /// Constant operation key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(Arc::new(LiteralKey(key.into())));
        self
    }

    /// Key computed from identity and arguments.
    pub fn key_deriver<D: KeyDeriver + 'static>(mut self, deriver: D) -> Self {
        self.key = Some(Arc::new(deriver));
        self
    }

    pub fn key_policy(mut self, policy: impl Into<KeyPolicy>) -> Self {
        self.key_policy = policy.into();
        self
    }

    /// Record lifetime. `None` or zero persists until cleared. When never
    /// called, the settings' `default_ttl_hours` applies.
    pub fn ttl(mut self, ttl: Option<Duration>) -> Self {
        self.ttl = Some(Ttl::from_duration(ttl));
        self
    }

    /// Cache non-null return values for duplicate callers.
    pub fn store_result(mut self, store_result: bool) -> Self {
        self.store_result = store_result;
        self
    }

    pub fn settings(mut self, settings: impl Into<SettingsHandle>) -> Self {
        self.settings = Some(settings.into());
        self
    }

    pub fn build(self) -> Result<SideEffect, ConfigurationError> {
        let key_spec = match self.key {
            Some(_) if !self.key_policy.is_default() => return Err(ConfigurationError::KeyAndPolicy),
            Some(deriver) => KeySpec::Explicit(deriver),
            None if self.key_policy.is_empty() => return Err(ConfigurationError::EmptyPolicy),
            None => KeySpec::Policy(self.key_policy),
        };

        Ok(SideEffect {
            key_spec,
            ttl: self.ttl,
            store_result: self.store_result,
            store: self.store,
            settings: self.settings.unwrap_or_default(),
        })
    }
}

/// Reentrant execution guard.
///
/// Cheap to clone; all state lives in the injected backing store.
#[derive(Clone)]
pub struct SideEffect {
    key_spec: KeySpec,
    ttl: Option<Ttl>,
    store_result: bool,
    store: SharedStore,
    settings: SettingsHandle,
}

impl SideEffect {
    pub fn builder(store: SharedStore) -> SideEffectBuilder {
        SideEffectBuilder {
            store,
            key: None,
            key_policy: KeyPolicy::default(),
            ttl: None,
            store_result: false,
            settings: None,
        }
    }

    /// Guard with the default policy, default TTL and no result caching.
    pub fn new(store: SharedStore) -> Self {
        SideEffect {
            key_spec: KeySpec::Policy(KeyPolicy::default()),
            ttl: None,
            store_result: false,
            store,
            settings: SettingsHandle::default(),
        }
    }

    pub fn settings(&self) -> &SettingsHandle {
        &self.settings
    }

    /// Operation key for an invocation.
    pub fn operation_key(&self, identity: &OperationIdentity, invocation: &Invocation) -> String {
        // build() rejects empty policies, so derivation always yields a key
        self.key_spec
            .derive(identity, invocation)
            .unwrap_or_else(|| identity.name().to_string())
    }

    /// Record store for the current settings snapshot.
    pub fn records(&self) -> OperationRecordStore {
        let prefix = self.settings.current().side_effect_prefix.clone();
        OperationRecordStore::new(self.store.clone(), prefix)
    }

    pub fn invalidator(&self) -> Invalidator {
        let prefix = self.settings.current().side_effect_prefix.clone();
        Invalidator::new(self.store.clone(), prefix)
    }

    pub async fn is_completed(
        &self,
        identity: &OperationIdentity,
        invocation: &Invocation,
    ) -> Result<bool, StoreError> {
        self.records()
            .is_completed(&self.operation_key(identity, invocation))
            .await
    }

    /// Runs `operation` at most once per operation key.
    ///
    /// Store failures are converted into the caller's error type; operation
    /// failures are returned unchanged after the reservation is released.
    pub async fn run<T, E, F, Fut>(
        &self,
        identity: &OperationIdentity,
        invocation: Invocation,
        operation: F,
    ) -> Result<Outcome<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<StoreError>,
        F: FnOnce(Invocation) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let name = identity.name();
        let key = self.operation_key(identity, &invocation);
        let settings = self.settings.current();
        let records = OperationRecordStore::new(self.store.clone(), settings.side_effect_prefix.clone());
        let ttl = self.ttl.unwrap_or_else(|| settings.default_ttl());

        if let Some(directive) = settings.clear_directive().and_then(ClearDirective::parse) {
            if directive.should_clear(name, &key) {
                records.release(&key).await?;
                metrics::increment_cleared("directive", 1);
                info!(operation = name, key = %key, ?directive, "Cleared side effect due to clear directive");
            }
        }

        if !records.reserve(&key, ttl).await? {
            if self.store_result {
                if let Some(cached) = records.load_result::<T>(&key).await? {
                    info!(operation = name, key = %key, "Side effect already completed, returning cached result");
                    metrics::increment_skip(name, true);
                    return Ok(Outcome::Cached(cached));
                }
            }
            info!(operation = name, key = %key, "Side effect already completed, skipping");
            metrics::increment_skip(name, false);
            return Ok(Outcome::Skipped);
        }

        info!(operation = name, key = %key, "Executing fresh side effect");
        let mut reservation = Reservation::new(records.clone(), key.clone(), name);

        match operation(invocation).await {
            Ok(value) => {
                reservation.disarm();
                if self.store_result {
                    records.store_result(&key, &value, ttl).await;
                }
                metrics::increment_execution(name);
                Ok(Outcome::Fresh(value))
            }
            Err(e) => {
                metrics::increment_failure(name);
                error!(operation = name, key = %key, "Side effect failed, releasing reservation");
                if let Err(release_err) = records.release(&key).await {
                    error!(
                        operation = name,
                        key = %key,
                        error = %release_err,
                        "Could not release reservation, key stays blocked until its TTL elapses"
                    );
                }
                reservation.disarm();
                Err(e)
            }
        }
    }

    /// Pairs this guard with an operation and its declared signature.
    pub fn wrap<F>(self, identity: OperationIdentity, signature: Signature, operation: F) -> Guarded<F> {
        Guarded {
            guard: self,
            identity,
            signature,
            operation,
        }
    }
}

impl std::fmt::Debug for SideEffect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SideEffect")
            .field("key_spec", &self.key_spec)
            .field("ttl", &self.ttl)
            .field("store_result", &self.store_result)
            .finish_non_exhaustive()
    }
}

/// An operation bound to its guard, identity and signature; call it like the
/// plain function.
pub struct Guarded<F> {
    guard: SideEffect,
    identity: OperationIdentity,
    signature: Signature,
    operation: F,
}

impl<F> Guarded<F> {
    pub fn identity(&self) -> &OperationIdentity {
        &self.identity
    }

    pub fn guard(&self) -> &SideEffect {
        &self.guard
    }

    /// Binds positional and keyword arguments, then runs through the guard.
    pub async fn call<T, E, Fut>(&self, positional: Vec<Value>, keyword: Map<String, Value>) -> Result<Outcome<T>, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<StoreError> + From<BindError>,
        F: Fn(Invocation) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let invocation = self.signature.bind(positional, keyword)?;
        self.guard
            .run(&self.identity, invocation, |inv| (self.operation)(inv))
            .await
    }

    /// Clears every record this operation has written.
    pub async fn clear(&self) -> Result<usize, StoreError> {
        self.guard.invalidator().clear_operation(&self.identity).await
    }
}

/// Releases a won reservation if dropped while still armed, which happens when
/// the guarded future is cancelled or the operation panics mid-execution.
struct Reservation {
    records: Option<OperationRecordStore>,
    key: String,
    operation: String,
}

impl Reservation {
    fn new(records: OperationRecordStore, key: String, operation: &str) -> Self {
        Self {
            records: Some(records),
            key,
            operation: operation.to_string(),
        }
    }

    fn disarm(&mut self) {
        self.records = None;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let Some(records) = self.records.take() else {
            return;
        };
        let key = std::mem::take(&mut self.key);
        metrics::increment_failure(&self.operation);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(operation = %self.operation, key = %key, "Side effect cancelled, releasing reservation");
                handle.spawn(async move {
                    if let Err(e) = records.release(&key).await {
                        error!(key = %key, error = %e, "Could not release cancelled reservation");
                    }
                });
            }
            Err(_) => {
                error!(
                    operation = %self.operation,
                    key = %key,
                    "Side effect cancelled outside a tokio runtime, reservation persists until its TTL elapses"
                );
            }
        }
    }
}
