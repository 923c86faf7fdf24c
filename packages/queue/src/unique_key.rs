//! Content-derived unique keys for coalescing duplicate enqueues (spec.md I6).

use sha2::{Digest, Sha256};

use crate::row::UniqueBy;

/// Compute the unique key for a `(kind, args, unique_by)` triple.
///
/// The key incorporates the job `kind` so that two different job kinds never
/// collide even if their tagged argument fields happen to match, and only the
/// fields named in `unique_by.fields` — in that order — so that unrelated
/// argument changes (e.g. a `priority` hint) don't defeat coalescing.
pub fn compute(kind: &str, args: &serde_json::Value, unique_by: &UniqueBy) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(kind.as_bytes());
    hasher.update([0u8]);
    for field in &unique_by.fields {
        hasher.update(field.as_bytes());
        hasher.update([b'=']);
        let value = args.get(field).cloned().unwrap_or(serde_json::Value::Null);
        hasher.update(value.to_string().as_bytes());
        hasher.update([0u8]);
    }
    hasher.finalize().to_vec()
}
