//! Utility functions for identifiers and timestamps.

mod ids;
pub mod timestamps;

pub use ids::{generate_holder_id, generate_session_id};
pub use timestamps::{add_duration, duration_ms, iso_timestamp, now_utc, Timestamp};
