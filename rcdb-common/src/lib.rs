//! Common types shared across the rcdb crates.
//!
//! This crate holds the vocabulary producers need to describe a record
//! (record groups and types, NOCAT record classes, TDR reasons and the device
//! state mask) without depending on the recording engine itself.

pub mod collections;
pub mod types;

// Re-export collection types for convenience
pub use collections::HashMap;

pub use types::{NocatRecordType, RecordGroup, RecordType, StateMask, TdrReason};
