//! # Side Effect Guard
//!
//! A reentrant side-effect execution cache. Task queues retry on failure,
//! redeliver after timeouts and occasionally duplicate work; this crate lets an
//! arbitrary async operation be invoked any number of times while its
//! real-world effect happens **at most once** per logical invocation.
//!
//! ## Architecture
//!
//! ### Key Derivation
//! [`OperationIdentity`] and an argument [`Invocation`] are turned into a
//! deterministic operation key by a [`KeyPolicy`] (source hash, name, input
//! hash) or an explicit [`KeyDeriver`].
//!
//! ### Operation Records
//! [`OperationRecordStore`] keeps a completion marker and an optional cached
//! result per key, both under one TTL.
//!
//! ### Execution Guard
//! [`SideEffect`] reserves the key with an atomic set-if-absent, executes the
//! operation, and releases the reservation on failure or cancellation.
//!
//! ### Invalidation
//! [`ClearDirective`] is consulted on every call; [`Invalidator`] clears keys
//! in bulk by pattern.
//!
//! The backing store is injected as a [`SharedStore`]: [`MemoryStore`] for
//! tests and single-process use, `RedisStore` with the `redis` feature.

// Core Types
/// Operation identity, signatures and bound invocations
pub mod operation;
/// Key policies and explicit key derivers
pub mod key_policy;
/// Storage key layout
pub mod keys;

// Storage
/// Backing store trait and in-memory implementation
pub mod kv_store;
/// Redis backing store (optional, feature-gated)
pub mod redis_manager;
/// Completion markers and cached results
pub mod record_store;

// Execution
/// Execution guard
pub mod guard;
/// Directive-driven and explicit invalidation
pub mod invalidation;

// Infrastructure
/// Metrics and observability
pub mod metrics;
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use guard::{ConfigurationError, Guarded, Outcome, SideEffect, SideEffectBuilder};
pub use invalidation::{ClearDirective, Invalidator};
pub use key_policy::{KeyComponent, KeyDeriver, KeyPolicy, LiteralKey};
pub use kv_store::{KvStore, MemoryStore, SharedStore, StoreError};
pub use operation::{BindError, Invocation, OperationIdentity, Signature};
pub use record_store::{OperationRecordStore, Ttl};
pub use settings::{SettingsHandle, SideEffectSettings};
