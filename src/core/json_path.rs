//! Safe nested lookup over dynamic site payloads.
//!
//! The marketplace APIs return deeply nested, loosely shaped JSON. All
//! traversal goes through [`pluck`] so a missing key, a wrong type, or an
//! out-of-range index degrades to a default in exactly one place instead of
//! scattering `.get().and_then()` chains through every parser.

use serde_json::Value;

/// One step of a lookup path.
#[derive(Debug, Clone, Copy)]
pub enum Seg<'a> {
    Key(&'a str),
    Idx(usize),
}

impl<'a> From<&'a str> for Seg<'a> {
    fn from(k: &'a str) -> Self {
        Seg::Key(k)
    }
}

impl From<usize> for Seg<'_> {
    fn from(i: usize) -> Self {
        Seg::Idx(i)
    }
}

/// Walk `path` through `value`, returning `None` on any missing-key,
/// type-mismatch, or index-out-of-range step.
pub fn pluck<'v>(value: &'v Value, path: &[Seg<'_>]) -> Option<&'v Value> {
    let mut cur = value;
    for seg in path {
        cur = match seg {
            Seg::Key(k) => cur.get(k)?,
            Seg::Idx(i) => cur.get(i)?,
        };
    }
    Some(cur)
}

/// [`pluck`] to a string, with `default` on any miss.
pub fn pluck_str<'v>(value: &'v Value, path: &[Seg<'_>], default: &'v str) -> &'v str {
    pluck(value, path).and_then(Value::as_str).unwrap_or(default)
}

/// [`pluck`] to an owned string. Numbers are rendered too — the site mixes
/// `"123"` and `123` for the same field across payload versions.
pub fn pluck_string(value: &Value, path: &[Seg<'_>], default: &str) -> String {
    match pluck(value, path) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => default.to_string(),
    }
}

/// [`pluck`] to an i64, with `default` on any miss.
pub fn pluck_i64(value: &Value, path: &[Seg<'_>], default: i64) -> i64 {
    pluck(value, path).and_then(Value::as_i64).unwrap_or(default)
}

/// [`pluck`] to a bool, with `default` on any miss.
pub fn pluck_bool(value: &Value, path: &[Seg<'_>], default: bool) -> bool {
    pluck(value, path).and_then(Value::as_bool).unwrap_or(default)
}

/// [`pluck`] to an array slice; empty slice on any miss.
pub fn pluck_array<'v>(value: &'v Value, path: &[Seg<'_>]) -> &'v [Value] {
    pluck(value, path)
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Shorthand for building a path: `path!["data", "resultList", 0usize]`.
#[macro_export]
macro_rules! path {
    ($($seg:expr),* $(,)?) => {
        &[$($crate::core::json_path::Seg::from($seg)),*][..]
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pluck_mixed_path() {
        let v = json!({"data": {"cardList": [{"cardData": {"rate": 1}}]}});
        assert_eq!(
            pluck_i64(&v, path!["data", "cardList", 0usize, "cardData", "rate"], -9),
            1
        );
    }

    #[test]
    fn test_pluck_misses_return_default() {
        let v = json!({"data": {"rate": "not a number"}});
        // missing key
        assert_eq!(pluck_str(&v, path!["data", "nope"], "d"), "d");
        // type mismatch
        assert_eq!(pluck_i64(&v, path!["data", "rate"], -1), -1);
        // index past the end
        assert!(pluck(&v, path!["data", 3usize]).is_none());
    }

    #[test]
    fn test_pluck_string_renders_numbers() {
        let v = json!({"tabs": {"item": {"number": 58}}});
        assert_eq!(pluck_string(&v, path!["tabs", "item", "number"], ""), "58");
    }

    #[test]
    fn test_pluck_array_empty_on_miss() {
        let v = json!({"data": {}});
        assert!(pluck_array(&v, path!["data", "resultList"]).is_empty());
    }
}
