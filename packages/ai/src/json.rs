//! Tolerant parsing of model output (spec.md §4.7): strips code-fence wrappers
//! and trailing commas before handing the text to `serde_json`.

use serde::de::DeserializeOwned;

use crate::error::{Error, Result};

/// Removes a leading ```` ```json ```` / ```` ``` ```` fence and trailing ```` ``` ````,
/// then trims trailing commas before `}` and `]` that `serde_json` rejects.
pub fn sanitize(raw: &str) -> String {
    let mut s = raw.trim();
    if let Some(rest) = s.strip_prefix("```json") {
        s = rest;
    } else if let Some(rest) = s.strip_prefix("```") {
        s = rest;
    }
    if let Some(rest) = s.strip_suffix("```") {
        s = rest;
    }
    strip_trailing_commas(s.trim())
}

fn strip_trailing_commas(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c == ',' {
            // Look ahead past whitespace for a closing bracket.
            let mut lookahead = chars.clone();
            let mut only_whitespace = true;
            let mut closes = false;
            for (_, c2) in lookahead.by_ref() {
                if c2.is_whitespace() {
                    continue;
                }
                only_whitespace = false;
                closes = c2 == '}' || c2 == ']';
                break;
            }
            if only_whitespace || closes {
                continue;
            }
        }
        out.push(c);
    }
    out
}

/// Parses `raw` as JSON after sanitizing it. A truncated (premature
/// end-of-stream) payload is distinguished from a structurally malformed one
/// so the caller can decide whether to retry with a smaller chunk.
pub fn parse_tolerant<T: DeserializeOwned>(raw: &str) -> Result<T> {
    let cleaned = sanitize(raw);
    serde_json::from_str(&cleaned).map_err(|e| {
        if looks_truncated(&cleaned) {
            Error::Truncated
        } else {
            Error::Parse(e.to_string())
        }
    })
}

fn looks_truncated(s: &str) -> bool {
    let trimmed = s.trim_end();
    !trimmed.ends_with('}') && !trimmed.ends_with(']') && !trimmed.ends_with('"')
}
