//! Path normalization for forwarded tool arguments
//!
//! Backends running on POSIX hosts choke on Windows-style paths. Before
//! forwarding `tools/call` arguments, every string leaf that looks like a
//! filesystem path has its backslashes folded to forward slashes. URL-shaped
//! strings and strings without separators pass through untouched.

use serde_json::Value;

/// Recursively normalize path-like string leaves of an arguments value.
#[must_use]
pub fn normalize_path_arguments(value: &Value) -> Value {
    match value {
        Value::String(s) => Value::String(normalize_if_path(s)),
        Value::Array(items) => Value::Array(items.iter().map(normalize_path_arguments).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize_path_arguments(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn normalize_if_path(s: &str) -> String {
    if looks_like_path(s) {
        s.replace('\\', "/")
    } else {
        s.to_string()
    }
}

/// Heuristic for "this string is a filesystem path".
///
/// Matches drive-letter roots (`C:\`), UNC prefixes (`\\host`), rooted
/// forward-slash paths containing a backslash, and bare backslash-separated
/// strings. URL schemes are exempt even when the rest would match.
fn looks_like_path(s: &str) -> bool {
    if is_url_shaped(s) {
        return false;
    }
    if !s.contains('\\') {
        return false;
    }

    has_drive_prefix(s) || s.starts_with("\\\\") || s.starts_with('/') || s.contains('\\')
}

fn has_drive_prefix(s: &str) -> bool {
    let bytes = s.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'\\' || bytes[2] == b'/')
}

fn is_url_shaped(s: &str) -> bool {
    // scheme://... with a multi-character scheme, so `C://` stays a path
    s.split_once("://")
        .is_some_and(|(scheme, _)| scheme.len() > 1 && scheme.chars().all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.'))
}
