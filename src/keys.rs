// Storage key layout for side-effect records

/// Default namespace for every record the cache writes.
pub const DEFAULT_PREFIX: &str = "side_effect";

const COMPLETED: &str = "completed";
const RESULT: &str = "result";

/// Marker proving an operation ran (or is running) for `operation_key`.
pub fn completed_key(prefix: &str, operation_key: &str) -> String {
    format!("{}:{}:{}", prefix, COMPLETED, operation_key)
}

/// Serialized return value for `operation_key`.
pub fn result_key(prefix: &str, operation_key: &str) -> String {
    format!("{}:{}:{}", prefix, RESULT, operation_key)
}

/// Operation key a marker or result record was written for.
pub fn operation_key_of<'a>(prefix: &str, record_key: &'a str) -> Option<&'a str> {
    let rest = record_key.strip_prefix(prefix)?.strip_prefix(':')?;
    let (kind, operation_key) = rest.split_once(':')?;
    matches!(kind, COMPLETED | RESULT).then_some(operation_key)
}

/// Escapes glob metacharacters so `text` matches only itself.
pub fn escape_glob(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Pattern covering every record under `prefix`.
pub fn namespace_pattern(prefix: &str) -> String {
    format!("{}:*", prefix)
}
