//! Operation key derivation.
//!
//! A key is either derived from a [`KeyPolicy`] (a set of [`KeyComponent`]s
//! joined with `:`) or supplied by an explicit [`KeyDeriver`]. A literal string
//! is just a deriver that ignores its inputs.

use crate::operation::{Invocation, OperationIdentity};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Rendered in place of a source hash when the implementation text is unknown.
pub const SOURCE_UNAVAILABLE: &str = "src:unavailable";

/// A piece of information that can feed an operation key.
///
/// Variant order is the order components appear in the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyComponent {
    /// Hash of the operation's implementation text.
    Source,
    /// The operation's declared name.
    Name,
    /// Hash of the canonical, default-applied arguments.
    Inputs,
}

/// Set of components selected for key derivation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPolicy {
    components: BTreeSet<KeyComponent>,
}

impl KeyPolicy {
    /// Source, name and inputs.
    pub fn all() -> Self {
        Self::from_components([KeyComponent::Source, KeyComponent::Name, KeyComponent::Inputs])
    }

    pub fn none() -> Self {
        Self {
            components: BTreeSet::new(),
        }
    }

    /// Name only: every invocation of the operation shares one key.
    pub fn name_only() -> Self {
        Self::from_components([KeyComponent::Name])
    }

    pub fn from_components(components: impl IntoIterator<Item = KeyComponent>) -> Self {
        Self {
            components: components.into_iter().collect(),
        }
    }

    pub fn with(mut self, component: KeyComponent) -> Self {
        self.components.insert(component);
        self
    }

    pub fn contains(&self, component: KeyComponent) -> bool {
        self.components.contains(&component)
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn is_default(&self) -> bool {
        *self == Self::default()
    }

    /// Joins the selected components. Returns `None` for an empty policy.
    pub fn derive(&self, identity: &OperationIdentity, invocation: &Invocation) -> Option<String> {
        if self.is_empty() {
            return None;
        }
        let parts: Vec<String> = self
            .components
            .iter()
            .map(|component| match component {
                KeyComponent::Source => match identity.source_fingerprint() {
                    Some(hash) => format!("src:{}", hash),
                    None => SOURCE_UNAVAILABLE.to_string(),
                },
                KeyComponent::Name => identity.name().to_string(),
                KeyComponent::Inputs => format!("inputs:{}", invocation.fingerprint()),
            })
            .collect();
        Some(parts.join(":"))
    }
}

/// Whether `operation_key` names the operation `name`.
///
/// A leading `src:<hash>` segment and a bare `inputs:<hash>` remainder are
/// structural, so `src` and `inputs` only match operations actually named
/// that way. Otherwise the key names `name` when it is `name` or starts with
/// `name:`, which also covers explicit keys of that shape.
pub fn key_names_operation(operation_key: &str, name: &str) -> bool {
    let rest = strip_source_segment(operation_key).unwrap_or(operation_key);
    if is_hash_segment(rest, "inputs:") {
        return false;
    }
    rest == name
        || rest
            .strip_prefix(name)
            .map_or(false, |tail| tail.starts_with(':'))
}

/// Remainder after a leading `src:<hash>` or `src:unavailable` segment.
fn strip_source_segment(key: &str) -> Option<&str> {
    let after = key.strip_prefix("src:")?;
    let (hash, rest) = after.split_once(':').unwrap_or((after, ""));
    (is_sha256_hex(hash) || hash == "unavailable").then_some(rest)
}

fn is_hash_segment(text: &str, label: &str) -> bool {
    text.strip_prefix(label).map_or(false, is_sha256_hex)
}

fn is_sha256_hex(text: &str) -> bool {
    text.len() == 64 && text.bytes().all(|b| b.is_ascii_hexdigit())
}

impl Default for KeyPolicy {
    fn default() -> Self {
        Self::all()
    }
}

impl std::ops::BitOr<KeyComponent> for KeyComponent {
    type Output = KeyPolicy;

    fn bitor(self, rhs: KeyComponent) -> KeyPolicy {
        KeyPolicy::from_components([self, rhs])
    }
}

impl std::ops::BitOr<KeyComponent> for KeyPolicy {
    type Output = KeyPolicy;

    fn bitor(self, rhs: KeyComponent) -> KeyPolicy {
        self.with(rhs)
    }
}

impl From<KeyComponent> for KeyPolicy {
    fn from(component: KeyComponent) -> Self {
        Self::from_components([component])
    }
}

/// Strategy producing an operation key from identity and arguments.
pub trait KeyDeriver: Send + Sync {
    fn derive(&self, identity: &OperationIdentity, invocation: &Invocation) -> String;
}

/// Constant key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralKey(pub String);

impl KeyDeriver for LiteralKey {
    fn derive(&self, _identity: &OperationIdentity, _invocation: &Invocation) -> String {
        self.0.clone()
    }
}

impl<F> KeyDeriver for F
where
    F: Fn(&OperationIdentity, &Invocation) -> String + Send + Sync,
{
    fn derive(&self, identity: &OperationIdentity, invocation: &Invocation) -> String {
        self(identity, invocation)
    }
}

/// Resolved key configuration held by a guard.
#[derive(Clone)]
pub enum KeySpec {
    Policy(KeyPolicy),
    Explicit(Arc<dyn KeyDeriver>),
}

impl KeySpec {
    /// Derives the operation key. An empty policy yields `None`; guards reject
    /// that configuration when they are built.
    pub fn derive(&self, identity: &OperationIdentity, invocation: &Invocation) -> Option<String> {
        match self {
            KeySpec::Policy(policy) => policy.derive(identity, invocation),
            KeySpec::Explicit(deriver) => Some(deriver.derive(identity, invocation)),
        }
    }
}

impl fmt::Debug for KeySpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeySpec::Policy(policy) => f.debug_tuple("Policy").field(policy).finish(),
            KeySpec::Explicit(_) => f.write_str("Explicit(..)"),
        }
    }
}
