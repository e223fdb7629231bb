//! Identifier generation.

use uuid::Uuid;

/// Generates a new session id.
///
/// UUID v7 ids sort by creation time, so lexical order of session files
/// follows start order.
#[must_use]
pub fn generate_session_id() -> String {
    Uuid::now_v7().to_string()
}

/// Generates a lock holder id unique to this process and store instance.
#[must_use]
pub fn generate_holder_id() -> String {
    format!("{}-{}", std::process::id(), Uuid::new_v4().simple())
}
