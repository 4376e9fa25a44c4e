//! # wrp-events
//!
//! Event addressing, content identity, and the immutable event record
//! for the widget runtime event core.
//!
//! ## Design Principles
//!
//! - Events are immutable once constructed; only the forwarding context
//!   pair is settable, and only by the delivery coordinator
//! - Addressing is normalized exactly once, at construction, into
//!   sorted, duplicate-free, mutually disjoint recipient lists
//! - Identity is a content-derived SHA-256 digest over a documented
//!   canonical serialization; it is a deduplication key, not a
//!   signature
//! - Construction is the only fallible step: malformed types, empty
//!   primary recipients, and unauthorized sources are rejected before
//!   any event exists

mod addressing;
mod error;
mod event;
mod identity;

pub use addressing::{AddressingInput, EventAddressing, OriginContext};
pub use error::{DeliveryError, DeliveryErrorKind, EventError};
pub use event::{
    AllowAll, Authorizer, Event, EventBuilder, EventType, ForwardingContext, RESERVED_TYPE_ANY,
};
