//! Utility functions for identifiers and timestamp handling.

mod ids;
pub mod timestamps;

pub use ids::{idempotency_key, prefixed_id, stable_id};
pub use timestamps::{format_iso8601, iso_timestamp, now_utc, parse_iso8601, Timestamp};
