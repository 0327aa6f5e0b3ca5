//! # Primitives
//!
//! Hardcoded runtime constants for the Keystone model.
//!
//! These values are compiled into the binary and are immutable at runtime.

/// Prefix of every generated local identifier.
///
/// Generated lids look like `@lid:post-3`. Caller-supplied lids are accepted
/// verbatim and need not carry the prefix.
pub const LID_PREFIX: &str = "@lid:";

// =============================================================================
// INPUT VALIDATION LIMITS
// =============================================================================

/// Maximum length for resource type names.
pub const MAX_TYPE_LENGTH: usize = 256;

/// Maximum length for server ids and lids.
pub const MAX_ID_LENGTH: usize = 1024;

/// Maximum number of resources (primary + included) in one payload.
///
/// Larger payloads are rejected during normalization to bound the work done
/// inside a single store transaction.
pub const MAX_PAYLOAD_RESOURCES: usize = 10_000;

/// Maximum number of members accepted for a single relationship push.
pub const MAX_RELATIONSHIP_MEMBERS: usize = 10_000;

/// Build the generated lid for the `n`th local resource of a type.
#[must_use]
pub fn generated_lid(resource_type: &str, n: u64) -> String {
    format!("{LID_PREFIX}{resource_type}-{n}")
}
