//! Bounded-time regex compilation shared by the schema validator's `pattern`
//! constraint and the filter language's `$regex` operator.
//!
//! `regex` itself is automaton-based and already immune to catastrophic
//! backtracking, but the engine additionally rejects patterns by shape and
//! length per the filter language's literal contract: a rejected pattern
//! matches nothing rather than raising.

use regex::Regex;

const MAX_PATTERN_LEN: usize = 1000;

/// Compiles `pattern` if it is within the length bound and does not contain
/// a nested-quantifier shape associated with catastrophic backtracking in
/// naive engines (e.g. `(a+)+`, `(a*)*`). Returns `None` for any pattern
/// that is rejected or fails to compile; callers treat `None` as "matches
/// nothing".
pub fn compile_safe(pattern: &str) -> Option<Regex> {
    if pattern.len() > MAX_PATTERN_LEN {
        return None;
    }
    if has_nested_quantifier(pattern) {
        return None;
    }
    Regex::new(pattern).ok()
}

/// Heuristic scan for a quantified group that itself contains a quantified
/// subexpression, e.g. `(a+)+`, `(a*)+`, `(a+)*`, `(a*)*`.
fn has_nested_quantifier(pattern: &str) -> bool {
    let bytes = pattern.as_bytes();
    let mut depth_stack: Vec<bool> = Vec::new(); // true if group body contains a quantifier
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i += 1; // skip escaped char
            }
            b'(' => {
                depth_stack.push(false);
            }
            b')' => {
                let inner_has_quantifier = depth_stack.pop().unwrap_or(false);
                // Check what follows the closing paren.
                let followed_by_quantifier = matches!(bytes.get(i + 1), Some(b'+') | Some(b'*'));
                if inner_has_quantifier && followed_by_quantifier {
                    return true;
                }
                if let Some(top) = depth_stack.last_mut() {
                    *top = *top || inner_has_quantifier || followed_by_quantifier;
                }
            }
            b'+' | b'*' => {
                if let Some(top) = depth_stack.last_mut() {
                    *top = true;
                }
            }
            _ => {}
        }
        i += 1;
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlong_pattern() {
        let pattern = "a".repeat(MAX_PATTERN_LEN + 1);
        assert!(compile_safe(&pattern).is_none());
    }

    #[test]
    fn rejects_nested_quantifier_shapes() {
        assert!(compile_safe("(a+)+").is_none());
        assert!(compile_safe("(a*)*").is_none());
        assert!(compile_safe("(a+)*b").is_none());
    }

    #[test]
    fn accepts_ordinary_patterns() {
        assert!(compile_safe("^[a-z]+@[a-z]+\\.[a-z]{2,}$").is_some());
        assert!(compile_safe("hello.*world").is_some());
    }
}
