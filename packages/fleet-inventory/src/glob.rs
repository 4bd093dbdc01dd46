//! Shell-style glob matching used by name filters and site patterns.

use regex::Regex;

/// Translates a glob pattern (`*`, `?`) into an anchored regex.
pub fn glob_to_regex(pattern: &str) -> Regex {
    let mut expr = String::with_capacity(pattern.len() + 8);
    expr.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(&c.to_string())),
        }
    }
    expr.push('$');
    // The translation only emits valid syntax
    Regex::new(&expr).expect("glob translation produced invalid regex")
}

/// Returns true if `name` matches the glob `pattern`.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    if !pattern.contains('*') && !pattern.contains('?') {
        return pattern == name;
    }
    glob_to_regex(pattern).is_match(name)
}
