//! Identifier generation.

use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Random ID for an evaluation created outside a scheduler pass.
pub fn new_eval_id() -> String {
    Uuid::new_v4().to_string()
}

/// Stable ID derived from `parts`, formatted like a UUID. Two passes over
/// the same inputs name their allocations and deployments identically.
pub fn derive_id(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes).to_string()
}

pub(crate) fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_ids_are_stable_and_distinct() {
        let a = derive_id(&["eval-1", "7", "web", "3"]);
        assert_eq!(a, derive_id(&["eval-1", "7", "web", "3"]));
        assert_ne!(a, derive_id(&["eval-1", "7", "web", "4"]));
        // Part boundaries matter.
        assert_ne!(derive_id(&["ab", "c"]), derive_id(&["a", "bc"]));
        assert_eq!(a.len(), 36);
    }

    #[test]
    fn eval_ids_are_unique() {
        assert_ne!(new_eval_id(), new_eval_id());
    }
}
