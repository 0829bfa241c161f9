//! Glob-style key pattern matching.
//!
//! Store key listings accept redis-style glob patterns: `*` matches any
//! run of characters, `?` matches a single character, everything else is
//! literal. Patterns are anchored to the whole key.

use regex::Regex;

/// Whether `key` matches the glob `pattern`.
///
/// An unparseable pattern matches nothing.
pub fn matches(pattern: &str, key: &str) -> bool {
    match compile(pattern) {
        Ok(re) => re.is_match(key),
        Err(_) => false,
    }
}

fn compile(pattern: &str) -> Result<Regex, regex::Error> {
    let mut expr = String::with_capacity(pattern.len() + 4);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            other => expr.push_str(&regex::escape(&other.to_string())),
        }
    }
    expr.push('$');
    Regex::new(&expr)
}
