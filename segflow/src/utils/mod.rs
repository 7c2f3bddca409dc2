//! Utility functions for timestamps.

pub mod timestamps;

pub use timestamps::{format_iso, iso_timestamp, now_utc, Timestamp};
