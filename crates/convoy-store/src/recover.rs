//! Best-effort recovery of corrupted JSON state files.
//!
//! A truncated or garbage-suffixed file is salvaged by scanning for the
//! longest balanced-brace prefix, honouring string literals and escapes, and
//! reparsing it. Content beyond the first complete object is discarded.

use serde_json::Value;

/// Extract the first complete top-level JSON object from `content`.
///
/// Returns `None` when no balanced, parseable prefix exists.
#[must_use]
pub fn recover_json_prefix(content: &str) -> Option<Value> {
    let end = balanced_object_end(content)?;
    serde_json::from_str(&content[..end]).ok()
}

/// Byte offset one past the closing brace of the first top-level object.
fn balanced_object_end(content: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    let mut seen_open = false;

    for (index, ch) in content.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => {
                depth += 1;
                seen_open = true;
            }
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 && seen_open {
                    return Some(index + ch.len_utf8());
                }
            }
            _ => {}
        }
    }
    None
}
