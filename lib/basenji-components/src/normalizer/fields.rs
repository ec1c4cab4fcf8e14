//! Field-level normalization of span strings.

// Max lengths, in bytes.
pub const MAX_SERVICE_LEN: usize = 100;
pub const MAX_NAME_LEN: usize = 100;
pub const MAX_RESOURCE_LEN: usize = 5000;
pub const MAX_TYPE_LEN: usize = 100;
pub const MAX_META_KEY_LEN: usize = 100;
pub const MAX_META_VALUE_LEN: usize = 5000;
pub const MAX_METRICS_KEY_LEN: usize = MAX_META_KEY_LEN;

pub const DEFAULT_SERVICE_NAME: &str = "unnamed-service";
pub const DEFAULT_SPAN_NAME: &str = "unnamed-operation";

/// Truncates `s` to at most `max_len` bytes without splitting a character.
pub fn truncate_utf8(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn is_valid_tag_char(c: char) -> bool {
    c.is_alphanumeric() || matches!(c, '_' | ':' | '.' | '/' | '-')
}

/// Normalizes a tag value.
///
/// The result is lowercase, starts with a letter, holds only letters, digits and `_:./-`, has every run of invalid
/// characters collapsed into a single `_`, carries no trailing `_`, and is at most `max_len` bytes long. It can be
/// empty.
pub fn normalize_tag(value: &str, max_len: usize) -> String {
    let mut normalized = String::with_capacity(value.len().min(max_len));
    for c in value.chars() {
        if normalized.is_empty() && !c.is_alphabetic() {
            continue;
        }

        // Only lowercase when it does not change the number of characters, as with 'İ'.
        let mut lower = c.to_lowercase();
        let c = match (lower.next(), lower.next()) {
            (Some(l), None) => l,
            _ => c,
        };

        if is_valid_tag_char(c) {
            normalized.push(c);
        } else if !normalized.ends_with('_') {
            normalized.push('_');
        }

        if normalized.len() > max_len {
            normalized.pop();
            break;
        }
    }

    while normalized.ends_with('_') {
        normalized.pop();
    }
    normalized
}

/// Normalizes a service name, falling back to a default when nothing valid remains.
pub fn normalize_service(service: &str) -> String {
    let normalized = normalize_tag(service, MAX_SERVICE_LEN);
    if normalized.is_empty() {
        DEFAULT_SERVICE_NAME.to_string()
    } else {
        normalized
    }
}

/// Normalizes an operation name the way metric names are normalized.
///
/// Leading non-letters are skipped, anything other than ASCII alphanumerics and `.` becomes `_`, underscores are never
/// doubled nor placed after a period, a period overwrites a preceding underscore, and trailing underscores are
/// dropped.
pub fn normalize_name(name: &str) -> String {
    // The default contains a character the rules below would rewrite.
    if name == DEFAULT_SPAN_NAME {
        return name.to_string();
    }

    let name = truncate_utf8(name, MAX_NAME_LEN).as_bytes();

    let Some(first) = name.iter().position(|b| b.is_ascii_alphabetic()) else {
        return DEFAULT_SPAN_NAME.to_string();
    };

    let mut normalized = String::with_capacity(name.len() - first);
    for &b in &name[first..] {
        if b.is_ascii_alphanumeric() {
            normalized.push(b as char);
        } else if b == b'.' {
            if normalized.ends_with('_') {
                normalized.pop();
            }
            normalized.push('.');
        } else if !normalized.ends_with(['.', '_']) {
            normalized.push('_');
        }
    }

    if normalized.ends_with('_') {
        normalized.pop();
    }
    normalized
}

/// Returns `true` if a string field would be changed by truncation to `max_len`.
pub fn exceeds(value: &str, max_len: usize) -> bool {
    value.len() > max_len
}
