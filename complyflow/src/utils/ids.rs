//! Identifier and idempotency-key generation.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generates a random identifier such as `task_9f2c4e1a7b3d5f60`.
#[must_use]
pub fn prefixed_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..16])
}

/// Generates a deterministic identifier from its components.
///
/// The same components always produce the same id, so re-running a stage
/// after a partial write upserts rather than duplicates.
#[must_use]
pub fn stable_id(prefix: &str, components: &[&str]) -> String {
    format!("{prefix}_{}", digest_hex(components, 8))
}

/// Generates an idempotency key for a stage trigger.
#[must_use]
pub fn idempotency_key(components: &[&str]) -> String {
    format!("idem:{}", digest_hex(components, 16))
}

fn digest_hex(components: &[&str], bytes: usize) -> String {
    let combined = components.join(":");
    let mut hasher = Sha256::new();
    hasher.update(combined.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..bytes])
}
