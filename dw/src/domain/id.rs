//! Session ID generation
//!
//! IDs use the format: `{kind}-{uuid-v7-simple}`
//! Example: `drip-0192a3b4c5d67e8f9a0b1c2d3e4f5a6b`
//!
//! UUIDv7 keeps IDs roughly creation-ordered, which makes store listings and
//! log lines easier to follow.

/// Generate an ID for the given kind
pub fn generate_id(kind: &str) -> String {
    let uuid = uuid::Uuid::now_v7();
    format!("{}-{}", kind, uuid.simple())
}

/// Short display form: the last 8 hex chars (random bits)
pub fn short_id(id: &str) -> &str {
    match id.split_once('-') {
        Some((_, hex)) if hex.len() > 8 => &hex[hex.len() - 8..],
        _ => id,
    }
}
