//! Operation identity and argument binding.
//!
//! An [`OperationIdentity`] names a guarded operation and fingerprints its
//! implementation text. An [`Invocation`] is the result of binding call
//! arguments against the operation's declared [`Signature`], with defaults
//! applied, so logically equivalent calls produce the same canonical mapping.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Hex SHA-256 of `text`.
pub fn stable_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Name plus implementation fingerprint of a guarded operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationIdentity {
    name: String,
    source_fingerprint: Option<String>,
}

impl OperationIdentity {
    /// Identity whose fingerprint is the hash of `source`, the operation's
    /// implementation text. Any edit to the text changes the fingerprint.
    pub fn new(name: impl Into<String>, source: &str) -> Self {
        Self {
            name: name.into(),
            source_fingerprint: Some(stable_hash(source)),
        }
    }

    /// Identity for an operation whose implementation text is not available.
    pub fn unfingerprinted(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source_fingerprint: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `None` when the identity was created without implementation text.
    pub fn source_fingerprint(&self) -> Option<&str> {
        self.source_fingerprint.as_deref()
    }
}

impl fmt::Display for OperationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// Builds an `(OperationIdentity, closure)` pair, fingerprinting the closure's
/// own token text.
///
/// ```
/// use side_effect_guard::operation;
///
/// let (identity, op) = operation!("greet", |name: String| async move {
///     Ok::<_, std::io::Error>(format!("hello {name}"))
/// });
/// assert_eq!(identity.name(), "greet");
/// # let _ = op;
/// ```
#[macro_export]
macro_rules! operation {
    ($name:expr, $body:expr) => {
        (
            $crate::operation::OperationIdentity::new($name, stringify!($body)),
            $body,
        )
    };
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub default: Option<Value>,
}

/// Ordered parameter list with optional defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
    params: Vec<Parameter>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a required parameter.
    pub fn param(mut self, name: impl Into<String>) -> Self {
        self.params.push(Parameter {
            name: name.into(),
            default: None,
        });
        self
    }

    /// Appends a parameter that falls back to `default` when not supplied.
    ///
    /// Defaults are JSON values, so converting one can never fail. Structured
    /// defaults go through `serde_json::to_value` or `json!` first.
    pub fn param_with_default(mut self, name: impl Into<String>, default: impl Into<Value>) -> Self {
        self.params.push(Parameter {
            name: name.into(),
            default: Some(default.into()),
        });
        self
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    /// Binds positional then keyword arguments and applies defaults.
    pub fn bind(&self, positional: Vec<Value>, keyword: Map<String, Value>) -> Result<Invocation, BindError> {
        if positional.len() > self.params.len() {
            return Err(BindError::TooManyPositional {
                expected: self.params.len(),
                got: positional.len(),
            });
        }

        let mut bound: BTreeMap<String, Value> = BTreeMap::new();
        for (param, value) in self.params.iter().zip(positional) {
            bound.insert(param.name.clone(), value);
        }

        for (name, value) in keyword {
            if !self.params.iter().any(|p| p.name == name) {
                return Err(BindError::UnknownParameter(name));
            }
            if bound.contains_key(&name) {
                return Err(BindError::DuplicateArgument(name));
            }
            bound.insert(name, value);
        }

        for param in &self.params {
            if bound.contains_key(&param.name) {
                continue;
            }
            match &param.default {
                Some(default) => {
                    bound.insert(param.name.clone(), default.clone());
                }
                None => return Err(BindError::MissingArgument(param.name.clone())),
            }
        }

        Ok(Invocation { arguments: bound })
    }

    /// Binds keyword arguments only.
    pub fn bind_keywords(&self, keyword: Map<String, Value>) -> Result<Invocation, BindError> {
        self.bind(Vec::new(), keyword)
    }
}

/// Errors binding call arguments against a [`Signature`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BindError {
    #[error("Expected at most {expected} positional arguments, got {got}")]
    TooManyPositional { expected: usize, got: usize },
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),
    #[error("Multiple values for argument: {0}")]
    DuplicateArgument(String),
    #[error("Missing required argument: {0}")]
    MissingArgument(String),
}

/// Call arguments bound to parameter names, defaults applied.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Invocation {
    arguments: BTreeMap<String, Value>,
}

impl Invocation {
    /// Invocation with no arguments.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Bound value for `name`.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.arguments.get(name)
    }

    pub fn arguments(&self) -> &BTreeMap<String, Value> {
        &self.arguments
    }

    /// Order-independent serialization of the parameter mapping.
    ///
    /// Object keys are sorted at every depth, whether or not serde_json's
    /// `preserve_order` feature is enabled in the build.
    pub fn canonical_json(&self) -> String {
        let value = Value::Object(
            self.arguments
                .iter()
                .map(|(k, v)| (k.clone(), canonicalize(v)))
                .collect(),
        );
        value.to_string()
    }

    /// Hash of [`Invocation::canonical_json`].
    pub fn fingerprint(&self) -> String {
        stable_hash(&self.canonical_json())
    }
}

/// Rebuilds `value` with every object's entries inserted in sorted key order.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            Value::Object(
                sorted
                    .into_iter()
                    .map(|(k, v)| (k.clone(), canonicalize(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}
