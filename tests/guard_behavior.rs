//! Integration tests for the execution guard
//!
//! Tests cover:
//! - Idempotence and result caching
//! - Key policies (distinct inputs, name-only collapse, source sensitivity)
//! - TTL expiry and forever TTL
//! - Failure, cancellation and store outages
//! - Concurrent duplicate delivery

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use side_effect_guard::{
    operation, BindError, Invocation, KeyComponent, KeyPolicy, KvStore, MemoryStore,
    OperationIdentity, Outcome, SideEffect, Signature, StoreError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
enum ChargeError {
    #[error("card declined")]
    Declined,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bind(#[from] BindError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Receipt {
    user_id: String,
    amount: i64,
    balance: i64,
}

type Ledger = Arc<Mutex<HashMap<String, i64>>>;

fn charge_signature() -> Signature {
    Signature::new().param("user_id").param_with_default("amount", 100)
}

fn user_invocation(user: &str) -> Invocation {
    Signature::new()
        .param("user_id")
        .bind(vec![json!(user)], Map::new())
        .unwrap()
}

async fn apply_charge(ledger: Ledger, inv: Invocation) -> Result<Receipt, ChargeError> {
    let user_id = inv.get("user_id").and_then(Value::as_str).unwrap_or_default().to_string();
    let amount = inv.get("amount").and_then(Value::as_i64).unwrap_or_default();
    let mut ledger = ledger.lock().unwrap();
    let balance = ledger.entry(user_id.clone()).or_insert(0);
    *balance += amount;
    Ok(Receipt {
        user_id,
        amount,
        balance: *balance,
    })
}

/// Test the charge scenario with result caching: the ledger moves once and the
/// duplicate sees the first receipt
#[tokio::test]
async fn test_charge_twice_with_stored_result() {
    let ledger: Ledger = Arc::default();
    let guard = SideEffect::builder(MemoryStore::shared())
        .store_result(true)
        .build()
        .unwrap();
    let task_ledger = ledger.clone();
    let charge = guard.wrap(
        OperationIdentity::new("charge", "ledger[user_id] += amount"),
        charge_signature(),
        move |inv: Invocation| apply_charge(task_ledger.clone(), inv),
    );

    let first: Outcome<Receipt> = charge
        .call::<Receipt, ChargeError, _>(vec![json!("u1")], Map::new())
        .await
        .unwrap();
    let second = charge
        .call::<Receipt, ChargeError, _>(vec![], json!({"user_id": "u1", "amount": 100}).as_object().cloned().unwrap())
        .await
        .unwrap();

    assert!(first.was_executed());
    assert!(matches!(second, Outcome::Cached(_)));
    assert_eq!(first.into_value(), second.into_value());
    assert_eq!(ledger.lock().unwrap()["u1"], 100);
}

/// Test the charge scenario without result caching: the duplicate gets the no-op sentinel
#[tokio::test]
async fn test_charge_twice_without_stored_result() {
    let ledger: Ledger = Arc::default();
    let guard = SideEffect::new(MemoryStore::shared());
    let identity = OperationIdentity::new("charge", "ledger[user_id] += amount");
    let sig = charge_signature();

    for expected_executed in [true, false] {
        let inv = sig.bind(vec![json!("u1"), json!(100)], Map::new()).unwrap();
        let outcome = guard
            .run(&identity, inv, |inv| apply_charge(ledger.clone(), inv))
            .await
            .unwrap();
        assert_eq!(outcome.was_executed(), expected_executed);
        if !expected_executed {
            assert_eq!(outcome, Outcome::Skipped);
            assert!(outcome.into_value().is_none());
        }
    }
    assert_eq!(ledger.lock().unwrap()["u1"], 100);
}

/// Test that N calls with the same invocation execute exactly once
#[tokio::test]
async fn test_repeated_calls_execute_once() {
    let guard = SideEffect::new(MemoryStore::shared());
    let identity = OperationIdentity::new("notify", "send()");
    let runs = AtomicUsize::new(0);

    for _ in 0..5 {
        guard
            .run(&identity, user_invocation("u1"), |_| async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<_, StoreError>(())
            })
            .await
            .unwrap();
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

/// Test that different inputs produce different keys and both execute
#[tokio::test]
async fn test_different_inputs_both_execute() {
    let guard = SideEffect::new(MemoryStore::shared());
    let identity = OperationIdentity::new("notify", "send()");
    let runs = AtomicUsize::new(0);

    for user in ["u1", "u2"] {
        let outcome = guard
            .run(&identity, user_invocation(user), |_| async {
                Ok::<_, StoreError>(runs.fetch_add(1, Ordering::SeqCst))
            })
            .await
            .unwrap();
        assert!(outcome.was_executed());
    }
    assert_ne!(
        guard.operation_key(&identity, &user_invocation("u1")),
        guard.operation_key(&identity, &user_invocation("u2"))
    );
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Test that a name-only policy collapses all invocations onto one key
#[tokio::test]
async fn test_name_only_policy_collapses_arguments() {
    let guard = SideEffect::builder(MemoryStore::shared())
        .key_policy(KeyComponent::Name)
        .build()
        .unwrap();
    let identity = OperationIdentity::new("op", "body");
    let sig = Signature::new().param("a");

    let first = guard
        .run(&identity, sig.bind(vec![json!(1)], Map::new()).unwrap(), |_| async {
            Ok::<_, StoreError>("result-1".to_string())
        })
        .await
        .unwrap();
    let second = guard
        .run(&identity, sig.bind(vec![json!(2)], Map::new()).unwrap(), |_| async {
            Ok::<_, StoreError>("result-2".to_string())
        })
        .await
        .unwrap();

    assert_eq!(first, Outcome::Fresh("result-1".to_string()));
    assert_eq!(second, Outcome::Skipped);
    assert_eq!(guard.operation_key(&identity, &Invocation::empty()), "op");
}

/// Test that changing the implementation changes the key under a source policy
#[tokio::test]
async fn test_source_change_derives_new_key() {
    let guard = SideEffect::new(MemoryStore::shared());
    let (v1, op_v1) = operation!("report", |_inv: Invocation| async {
        Ok::<_, StoreError>("v1".to_string())
    });
    let (v2, op_v2) = operation!("report", |_inv: Invocation| async {
        Ok::<_, StoreError>("v2".to_string())
    });

    assert_eq!(v1.name(), v2.name());
    assert_ne!(
        guard.operation_key(&v1, &Invocation::empty()),
        guard.operation_key(&v2, &Invocation::empty())
    );

    let first = guard.run(&v1, Invocation::empty(), op_v1).await.unwrap();
    let second = guard.run(&v2, Invocation::empty(), op_v2).await.unwrap();
    assert_eq!(first, Outcome::Fresh("v1".to_string()));
    assert_eq!(second, Outcome::Fresh("v2".to_string()));

    // Without the source component both versions share a key
    let name_and_inputs = SideEffect::builder(MemoryStore::shared())
        .key_policy(KeyComponent::Name | KeyComponent::Inputs)
        .build()
        .unwrap();
    assert_eq!(
        name_and_inputs.operation_key(&v1, &Invocation::empty()),
        name_and_inputs.operation_key(&v2, &Invocation::empty())
    );
}

/// Test that a custom deriver controls the key
#[tokio::test]
async fn test_key_deriver() {
    let guard = SideEffect::builder(MemoryStore::shared())
        .key_deriver(|id: &OperationIdentity, inv: &Invocation| {
            format!(
                "{}:user:{}",
                id.name(),
                inv.get("user_id").and_then(Value::as_str).unwrap_or("?")
            )
        })
        .build()
        .unwrap();
    let identity = OperationIdentity::new("user_action", "body");
    assert_eq!(
        guard.operation_key(&identity, &user_invocation("u9")),
        "user_action:user:u9"
    );
}

/// Test that a marker expires after its TTL
#[tokio::test(start_paused = true)]
async fn test_ttl_expiry_allows_rerun() {
    let guard = SideEffect::builder(MemoryStore::shared())
        .ttl(Some(Duration::from_secs(1)))
        .build()
        .unwrap();
    let identity = OperationIdentity::new("op", "body");
    let runs = AtomicUsize::new(0);
    let run = || {
        guard.run(&identity, Invocation::empty(), |_| async {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<_, StoreError>(())
        })
    };

    assert!(run().await.unwrap().was_executed());
    assert!(!run().await.unwrap().was_executed());

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(!guard.is_completed(&identity, &Invocation::empty()).await.unwrap());
    assert!(run().await.unwrap().was_executed());
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

/// Test that None and zero TTLs never expire
#[tokio::test(start_paused = true)]
async fn test_forever_ttl() {
    for ttl in [None, Some(Duration::ZERO)] {
        let guard = SideEffect::builder(MemoryStore::shared())
            .ttl(ttl)
            .build()
            .unwrap();
        let identity = OperationIdentity::new("op", "body");
        guard
            .run(&identity, Invocation::empty(), |_| async { Ok::<_, StoreError>(()) })
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(10 * 365 * 24 * 3600)).await;
        assert!(guard.is_completed(&identity, &Invocation::empty()).await.unwrap());
    }
}

/// Test that a cached result from an expired execution is not served for a
/// later execution that returned null
#[tokio::test(start_paused = true)]
async fn test_cached_result_does_not_outlive_marker() {
    let guard = SideEffect::builder(MemoryStore::shared())
        .store_result(true)
        .ttl(Some(Duration::from_secs(10)))
        .build()
        .unwrap();
    let identity = OperationIdentity::new("lookup", "body");
    let calls = AtomicUsize::new(0);
    let run = || {
        guard.run(&identity, Invocation::empty(), |_| async {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                // Result is written 5s after the marker, so it expires 5s later too
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, StoreError>(Some("old".to_string()))
            } else {
                Ok(None)
            }
        })
    };

    assert_eq!(run().await.unwrap(), Outcome::Fresh(Some("old".to_string())));

    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(run().await.unwrap(), Outcome::Fresh(None));
    assert_eq!(run().await.unwrap(), Outcome::Skipped);
}

/// Test that an effectively unbounded TTL is stored without expiry
#[tokio::test]
async fn test_max_ttl_is_treated_as_forever() {
    let guard = SideEffect::builder(MemoryStore::shared())
        .ttl(Some(Duration::MAX))
        .store_result(true)
        .build()
        .unwrap();
    let identity = OperationIdentity::new("op", "body");

    let first = guard
        .run(&identity, Invocation::empty(), |_| async { Ok::<_, StoreError>(7) })
        .await
        .unwrap();
    let second = guard
        .run(&identity, Invocation::empty(), |_| async { Ok::<_, StoreError>(8) })
        .await
        .unwrap();

    assert_eq!(first, Outcome::Fresh(7));
    assert_eq!(second, Outcome::Cached(7));
}

/// Test that a failed operation is not marked complete and is retried
#[tokio::test]
async fn test_failure_does_not_cache() {
    let guard = SideEffect::builder(MemoryStore::shared())
        .store_result(true)
        .build()
        .unwrap();
    let identity = OperationIdentity::new("charge", "body");
    let attempts = AtomicUsize::new(0);
    let attempt = || {
        guard.run(&identity, user_invocation("u1"), |_| async {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(ChargeError::Declined)
            } else {
                Ok("charged".to_string())
            }
        })
    };

    let err = attempt().await.unwrap_err();
    assert!(matches!(err, ChargeError::Declined));
    assert!(!guard.is_completed(&identity, &user_invocation("u1")).await.unwrap());

    assert_eq!(attempt().await.unwrap(), Outcome::Fresh("charged".to_string()));
    assert_eq!(attempt().await.unwrap(), Outcome::Cached("charged".to_string()));
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

/// Test that a cancelled execution releases its reservation
#[tokio::test]
async fn test_cancellation_releases_reservation() {
    let guard = SideEffect::new(MemoryStore::shared());
    let identity = OperationIdentity::new("slow", "body");

    let cancelled = tokio::time::timeout(
        Duration::from_millis(20),
        guard.run(&identity, Invocation::empty(), |_| async {
            std::future::pending::<()>().await;
            Ok::<_, StoreError>(())
        }),
    )
    .await;
    assert!(cancelled.is_err());

    let mut released = false;
    for _ in 0..100 {
        if !guard.is_completed(&identity, &Invocation::empty()).await.unwrap() {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    assert!(released, "reservation should be released after cancellation");

    let retry = guard
        .run(&identity, Invocation::empty(), |_| async { Ok::<_, StoreError>(()) })
        .await
        .unwrap();
    assert!(retry.was_executed());
}

/// Test that K concurrent duplicates execute the operation exactly once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_duplicates_execute_once() {
    const K: usize = 32;
    let guard = SideEffect::new(MemoryStore::shared());
    let identity = OperationIdentity::new("deliver", "body");
    let runs = Arc::new(AtomicUsize::new(0));
    let barrier = Arc::new(tokio::sync::Barrier::new(K));

    let handles: Vec<_> = (0..K)
        .map(|_| {
            let guard = guard.clone();
            let identity = identity.clone();
            let runs = runs.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                guard
                    .run(&identity, user_invocation("u1"), |_| async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok::<_, StoreError>(())
                    })
                    .await
            })
        })
        .collect();

    let outcomes: Vec<Outcome<()>> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(outcomes.iter().filter(|o| o.was_executed()).count(), 1);
    assert_eq!(outcomes.iter().filter(|o| **o == Outcome::Skipped).count(), K - 1);
}

/// Store whose writes always fail
struct UnavailableStore;

#[async_trait]
impl KvStore for UnavailableStore {
    async fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn set(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Option<Duration>,
        _only_if_absent: bool,
    ) -> Result<bool, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn delete(&self, _keys: &[String]) -> Result<usize, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    async fn scan(&self, _pattern: &str) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}

/// Test that a store outage surfaces as the caller's error and nothing runs
#[tokio::test]
async fn test_store_outage_propagates_without_executing() {
    let guard = SideEffect::new(Arc::new(UnavailableStore));
    let identity = OperationIdentity::new("charge", "body");
    let runs = AtomicUsize::new(0);

    let err = guard
        .run(&identity, Invocation::empty(), |_| async {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<_, ChargeError>(())
        })
        .await
        .unwrap_err();

    assert!(matches!(err, ChargeError::Store(StoreError::Unavailable(_))));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

/// Test that binding errors surface through a wrapped operation
#[tokio::test]
async fn test_wrapped_bind_error() {
    let guard = SideEffect::new(MemoryStore::shared());
    let charge = guard.wrap(
        OperationIdentity::new("charge", "body"),
        charge_signature(),
        |_inv: Invocation| async { Ok::<_, ChargeError>(()) },
    );

    let err = charge
        .call::<(), ChargeError, _>(vec![], Map::new())
        .await
        .unwrap_err();
    assert!(matches!(err, ChargeError::Bind(BindError::MissingArgument(_))));
}

/// Test that an explicit policy equal to the default still derives the full key
#[test]
fn test_default_policy_matches_all_components() {
    assert_eq!(
        KeyPolicy::default(),
        KeyComponent::Source | KeyComponent::Name | KeyComponent::Inputs
    );
}
