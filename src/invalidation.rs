//! Invalidation of prior completions.
//!
//! Two triggers exist: a standing [`ClearDirective`] consulted on every guarded
//! call, and explicit bulk clearing through [`Invalidator::clear`].

use crate::key_policy::key_names_operation;
use crate::keys;
use crate::kv_store::{SharedStore, StoreError};
use crate::metrics;
use crate::operation::OperationIdentity;
use std::collections::BTreeSet;
use tracing::info;

/// Parsed form of the `clear_side_effects` setting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearDirective {
    /// `all`: every key in the namespace.
    All,
    /// `<name>`, `<name>:*`, or `<name>:<anything>`: keys of operations with that name.
    Pattern(String),
}

impl ClearDirective {
    /// Parses a raw directive. Blank input yields `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            None
        } else if raw == "all" {
            Some(ClearDirective::All)
        } else {
            Some(ClearDirective::Pattern(raw.to_string()))
        }
    }

    /// Whether the record for (`operation_name`, `operation_key`) should be
    /// cleared before the guarded call runs.
    ///
    /// Checked in order: `all`, exact name, `<name>:` prefix, then a trailing
    /// `*` as a prefix match against the operation key.
    pub fn should_clear(&self, operation_name: &str, operation_key: &str) -> bool {
        let pattern = match self {
            ClearDirective::All => return true,
            ClearDirective::Pattern(p) => p.as_str(),
        };
        if pattern == operation_name {
            return true;
        }
        if pattern
            .strip_prefix(operation_name)
            .map_or(false, |rest| rest.starts_with(':'))
        {
            return true;
        }
        match pattern.strip_suffix('*') {
            Some(prefix) => operation_key.starts_with(prefix),
            None => false,
        }
    }
}

/// Explicit bulk invalidation against the backing store.
#[derive(Clone)]
pub struct Invalidator {
    store: SharedStore,
    prefix: String,
}

impl Invalidator {
    pub fn new(store: SharedStore, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
        }
    }

    /// Store scan pattern for a user-facing clear pattern.
    ///
    /// - `all` covers the whole namespace
    /// - a bare name narrows the scan to keys containing it; [`clear`](Self::clear)
    ///   then keeps only keys whose name component is that name
    /// - anything else is matched as a substring of the namespaced key
    pub fn scan_pattern(&self, pattern: &str) -> String {
        if pattern == "all" {
            keys::namespace_pattern(&self.prefix)
        } else if is_bare_name(pattern) {
            format!("{}:*{}*", self.prefix, keys::escape_glob(pattern))
        } else {
            format!("{}:*{}*", self.prefix, pattern)
        }
    }

    /// Deletes every marker and result key matching `pattern`, returning the
    /// number of keys removed. No matches is not an error.
    pub async fn clear(&self, pattern: &str) -> Result<usize, StoreError> {
        let scanned = self.store.scan(&self.scan_pattern(pattern)).await?;
        let matched: BTreeSet<String> = if is_bare_name(pattern) {
            scanned
                .into_iter()
                .filter(|key| {
                    keys::operation_key_of(&self.prefix, key)
                        .map_or(false, |operation_key| key_names_operation(operation_key, pattern))
                })
                .collect()
        } else {
            scanned.into_iter().collect()
        };

        if matched.is_empty() {
            info!(pattern, "No side effect keys found matching pattern");
            return Ok(0);
        }

        let matched: Vec<String> = matched.into_iter().collect();
        let deleted = self.store.delete(&matched).await?;
        metrics::increment_cleared("explicit", deleted);
        info!(pattern, deleted, "Cleared side effect keys matching pattern");
        Ok(deleted)
    }

    /// Clears every record of the operation named by `identity`.
    pub async fn clear_operation(&self, identity: &OperationIdentity) -> Result<usize, StoreError> {
        self.clear(identity.name()).await
    }
}

fn is_bare_name(pattern: &str) -> bool {
    pattern != "all" && !pattern.contains(':')
}

impl std::fmt::Debug for Invalidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Invalidator")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}
