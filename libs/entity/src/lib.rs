//! # wrp-entity
//!
//! Typed identifiers, parsing, and validation for the widget runtime
//! event core.
//!
//! ## Design Principles
//!
//! - Entity ids are opaque, caller-owned strings; the runtime validates
//!   shape only and compares by code points
//! - Listener ids are runtime-generated with a canonical `lsn_{ulid}`
//!   representation and strict parsing
//! - Event digests are lowercase hex and fixed-length, so they can be
//!   compared and stored without re-normalization
//! - All identifiers support roundtrip serialization (parse → format → parse)

mod error;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
