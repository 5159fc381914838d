//! Glob matching for approval rules.
//!
//! Rules name tools by display name with shell-style wildcards:
//!
//! - `*` matches any sequence of characters
//! - `?` matches any single character
//! - anything else matches literally
//!
//! ```
//! use nowpilot::approval::patterns::matches_pattern;
//!
//! assert!(matches_pattern("servicenow__delete_*", "servicenow__delete_record"));
//! assert!(matches_pattern("*update*", "servicenow__update_incident"));
//! assert!(!matches_pattern("*update*", "servicenow__get_incident"));
//! assert!(matches_pattern("servicenow__close_incident?", "servicenow__close_incidents"));
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Mutex;

/// Cache for compiled regex patterns to avoid repeated compilation.
static PATTERN_CACHE: Lazy<Mutex<HashMap<String, Regex>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Maximum number of cached patterns to prevent unbounded memory growth.
const MAX_CACHE_SIZE: usize = 100;

/// Checks if a tool name matches a glob-style pattern.
///
/// An invalid pattern never matches.
#[must_use]
pub fn matches_pattern(pattern: &str, value: &str) -> bool {
    if !pattern.contains('*') && !pattern.contains('?') {
        return pattern == value;
    }

    {
        let cache = PATTERN_CACHE.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(regex) = cache.get(pattern) {
            return regex.is_match(value);
        }
    }

    let Ok(regex) = compile_pattern(pattern) else {
        return false;
    };
    let matches = regex.is_match(value);

    let mut cache = PATTERN_CACHE.lock().unwrap_or_else(|p| p.into_inner());
    if cache.len() < MAX_CACHE_SIZE {
        cache.insert(pattern.to_string(), regex);
    }

    matches
}

/// Returns true if any of `patterns` matches `value`.
#[must_use]
pub fn matches_any<S: AsRef<str>>(patterns: &[S], value: &str) -> bool {
    patterns
        .iter()
        .any(|pattern| matches_pattern(pattern.as_ref(), value))
}

/// Compiles a glob pattern to an anchored regex.
fn compile_pattern(pattern: &str) -> Result<Regex, regex::Error> {
    let mut regex_str = String::with_capacity(pattern.len() * 2 + 2);
    regex_str.push('^');

    for c in pattern.chars() {
        match c {
            '*' => regex_str.push_str(".*"),
            '?' => regex_str.push('.'),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '|' | '^' | '$' | '\\' => {
                regex_str.push('\\');
                regex_str.push(c);
            }
            _ => regex_str.push(c),
        }
    }

    regex_str.push('$');
    Regex::new(&regex_str)
}

/// Patterns for ServiceNow operations that change records.
pub mod common {
    /// Any deletion.
    pub const DELETE: &str = "*delete*";

    /// Any update.
    pub const UPDATE: &str = "*update*";

    /// Closing or resolving a ticket.
    pub const CLOSE: &str = "*close*";
}
