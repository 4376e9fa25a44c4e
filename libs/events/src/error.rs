//! Error types for event construction and delivery reporting.

use thiserror::Error;
use wrp_entity::EntityId;

/// Errors that can occur when constructing an event.
///
/// These are the synchronous failures: no partial event is ever produced.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EventError {
    /// The event type does not match `[_a-zA-Z][_a-zA-Z0-9]*`.
    #[error("invalid event type: {0:?}")]
    InvalidType(String),

    /// The event type is the reserved word `any`.
    #[error("event type 'any' is reserved")]
    ReservedType,

    /// After normalization the primary recipient list is empty.
    #[error("normalized addressing has no primary recipients")]
    EmptyRecipients,

    /// The calling application may not originate events for this source.
    /// The field is named `origin` so thiserror does not treat it as an
    /// error-source chain link.
    #[error("caller '{caller}' is not authorized to originate events for '{origin}'")]
    Unauthorized { caller: EntityId, origin: EntityId },
}

/// Per-recipient delivery failure kinds.
///
/// Reported asynchronously through the callback sink; a failure for one
/// recipient never aborts delivery to the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryErrorKind {
    /// The event data could not be accepted by the recipient runtime.
    InvalidData,

    /// The recipient is known but cannot be reached right now.
    DestinationUnreachable,

    /// The event's expiry timestamp had passed before delivery.
    Expired,

    /// The recipient has already observed this event's identity.
    Duplicate,

    /// The recipient refused the event.
    Refused,

    /// The recipient is not known to the registry at all.
    NoReference,
}

impl std::fmt::Display for DeliveryErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeliveryErrorKind::InvalidData => "invalid_data",
            DeliveryErrorKind::DestinationUnreachable => "destination_unreachable",
            DeliveryErrorKind::Expired => "expired",
            DeliveryErrorKind::Duplicate => "duplicate",
            DeliveryErrorKind::Refused => "refused",
            DeliveryErrorKind::NoReference => "no_reference",
        };
        write!(f, "{}", s)
    }
}

/// A per-recipient delivery error with a human-readable message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{kind}: {message}")]
pub struct DeliveryError {
    /// What went wrong.
    pub kind: DeliveryErrorKind,

    /// Human-readable detail.
    pub message: String,
}

impl DeliveryError {
    /// Creates a delivery error.
    pub fn new(kind: DeliveryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
