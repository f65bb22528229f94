//! Action pattern matching.
//!
//! Action patterns follow IAM glob syntax: `*` matches any run of
//! characters and `?` matches one. Action matching ignores ASCII case;
//! resource matching does not.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;

static COMPILED: Lazy<Mutex<HashMap<String, Regex>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Check if `pattern` matches the concrete `action`
#[must_use]
pub fn action_matches(pattern: &str, action: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if !pattern.contains(['*', '?']) {
        return pattern.eq_ignore_ascii_case(action);
    }

    // A poisoned cache only loses memoization
    let mut cache = match COMPILED.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if let Some(re) = cache.get(pattern) {
        return re.is_match(action);
    }
    match glob_regex(pattern, true) {
        Some(re) => {
            let matched = re.is_match(action);
            cache.insert(pattern.to_string(), re);
            matched
        }
        None => false,
    }
}

/// Check if any of `patterns` matches `action`
#[must_use]
pub fn any_matches<'a>(patterns: impl IntoIterator<Item = &'a String>, action: &str) -> bool {
    patterns.into_iter().any(|p| action_matches(p, action))
}

/// Guarded actions covered by at least one of `patterns`, in guard order
#[must_use]
pub fn covered<'g>(patterns: &[&String], guarded: &'g [String]) -> Vec<&'g String> {
    guarded
        .iter()
        .filter(|action| patterns.iter().any(|p| action_matches(p, action)))
        .collect()
}

/// Check if the resource glob `pattern` matches `text`, case-sensitively
#[must_use]
pub fn resource_matches(pattern: &str, text: &str) -> bool {
    if !pattern.contains(['*', '?']) {
        return pattern == text;
    }
    glob_regex(pattern, false).is_some_and(|re| re.is_match(text))
}

fn glob_regex(pattern: &str, ignore_case: bool) -> Option<Regex> {
    let mut expr = String::from(if ignore_case { "(?i)^" } else { "^" });
    for ch in pattern.chars() {
        match ch {
            '*' => expr.push_str(".*"),
            '?' => expr.push('.'),
            c => expr.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4]))),
        }
    }
    expr.push('$');
    Regex::new(&expr).ok()
}
