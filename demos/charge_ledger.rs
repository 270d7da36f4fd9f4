//! # Charge Ledger Example
//!
//! A task queue redelivers the same `charge` job several times, including a
//! burst of concurrent duplicates. The guard makes sure the ledger moves once.
//!
//! ## Usage
//!
//! ```bash
//! RUST_LOG=info cargo run --example charge_ledger
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use side_effect_guard::{
    operation, BindError, Invocation, MemoryStore, Outcome, SideEffect, Signature, StoreError,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Receipt {
    user_id: String,
    amount: i64,
    balance: i64,
}

#[derive(Debug, thiserror::Error)]
enum ChargeError {
    #[error("Ledger lock poisoned")]
    LedgerPoisoned,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Bind(#[from] BindError),
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    println!("🚀 Charge ledger demo");

    let ledger: Arc<Mutex<HashMap<String, i64>>> = Arc::default();
    let guard = SideEffect::builder(MemoryStore::shared())
        .store_result(true)
        .build()?;

    let task_ledger = ledger.clone();
    let (identity, charge) = operation!("charge", move |inv: Invocation| {
        let ledger = task_ledger.clone();
        async move {
            let user_id = inv.get("user_id").and_then(Value::as_str).unwrap_or_default().to_string();
            let amount = inv.get("amount").and_then(Value::as_i64).unwrap_or_default();
            let mut ledger = ledger.lock().map_err(|_| ChargeError::LedgerPoisoned)?;
            let balance = ledger.entry(user_id.clone()).or_insert(0);
            *balance += amount;
            Ok::<_, ChargeError>(Receipt { user_id, amount, balance: *balance })
        }
    });
    let charge = guard.clone().wrap(
        identity,
        Signature::new().param("user_id").param_with_default("amount", 100),
        charge,
    );

    // Redelivery: positional, keyword and defaulted spellings of the same job
    let deliveries: Vec<(Vec<Value>, Map<String, Value>)> = vec![
        (vec![json!("u1"), json!(100)], Map::new()),
        (vec![json!("u1")], Map::new()),
        (vec![], json!({"amount": 100, "user_id": "u1"}).as_object().cloned().unwrap_or_default()),
    ];
    for (positional, keyword) in deliveries {
        match charge.call::<Receipt, ChargeError, _>(positional, keyword).await? {
            Outcome::Fresh(r) => println!("✅ Charged {} {} (balance {})", r.user_id, r.amount, r.balance),
            Outcome::Cached(r) => println!("↩️  Duplicate delivery, cached receipt (balance {})", r.balance),
            Outcome::Skipped => println!("↩️  Duplicate delivery, skipped"),
        }
    }

    // A different user is a different invocation
    let outcome = charge
        .call::<Receipt, ChargeError, _>(vec![json!("u2"), json!(250)], Map::new())
        .await?;
    println!("✅ u2 executed: {}", outcome.was_executed());

    // Operator-requested re-run
    let cleared = charge.clear().await?;
    println!("🔄 Cleared {} records for '{}'", cleared, charge.identity().name());
    charge
        .call::<Receipt, ChargeError, _>(vec![json!("u1")], Map::new())
        .await?;

    let ledger = ledger.lock().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    println!("📒 Final ledger: {:?}", *ledger);
    Ok(())
}
