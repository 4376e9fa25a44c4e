//! Entity resolution and the delivery seam.
//!
//! The coordinator never moves bytes itself. It asks an [`EntityRegistry`]
//! for an [`Endpoint`] at delivery time and hands the endpoint a
//! [`Delivery`] view of the event. Resolution distinguishes "this entity
//! concept is unknown" from "the entity is known but cannot be reached
//! right now"; the coordinator maps the two to different error kinds.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use wrp_entity::{EntityId, EventDigest};
use wrp_events::{DeliveryError, DeliveryErrorKind, Event, EventAddressing, EventType};

/// Resolution failures, reported per recipient.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResolveError {
    /// The registry has no notion of this entity at all.
    #[error("no reference for entity '{0}'")]
    Unknown(EntityId),

    /// The entity is known but has no usable route right now.
    #[error("entity '{id}' unreachable: {reason}")]
    Unreachable { id: EntityId, reason: String },
}

impl ResolveError {
    pub(crate) fn into_delivery_error(self) -> DeliveryError {
        let kind = match &self {
            ResolveError::Unknown(_) => DeliveryErrorKind::NoReference,
            ResolveError::Unreachable { .. } => DeliveryErrorKind::DestinationUnreachable,
        };
        DeliveryError::new(kind, self.to_string())
    }
}

/// Failures an endpoint may report for a delivery attempt.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// The recipient refused the event.
    #[error("refused: {0}")]
    Refused(String),

    /// The recipient could not accept the event data.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl EndpointError {
    pub(crate) fn into_delivery_error(self) -> DeliveryError {
        let (kind, message) = match self {
            EndpointError::Refused(reason) => (DeliveryErrorKind::Refused, reason),
            EndpointError::InvalidData(reason) => (DeliveryErrorKind::InvalidData, reason),
        };
        DeliveryError::new(kind, message)
    }
}

/// The per-recipient view of an event.
///
/// This is what crosses the delivery seam instead of the [`Event`]
/// itself, so a recipient can only ever see the addressing it is allowed
/// to see: blind recipients are stripped before the view is built.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// The recipient this view was built for.
    pub recipient: EntityId,

    /// The event type.
    pub event_type: EventType,

    /// Content identity, preserved across forwards.
    pub digest: EventDigest,

    /// The addressing visible to this recipient (no bcc). For a
    /// forwarded event this is the forwarding addressing.
    pub visible: EventAddressing,

    /// The original event's to/cc when the event arrives through a
    /// forward; never contains the original bcc.
    pub forwarded_from: Option<EventAddressing>,

    /// Opaque payload.
    pub payload: Option<String>,

    /// Origin-supplied timestamp.
    pub timestamp: Option<DateTime<Utc>>,

    /// Expiry timestamp.
    pub expires: Option<DateTime<Utc>>,

    /// Back-reference to the event this one responds to.
    pub in_response_to: Option<EventDigest>,
}

impl Delivery {
    pub(crate) fn build(
        event: &Event,
        recipient: EntityId,
        visible: EventAddressing,
        forwarded_from: Option<EventAddressing>,
    ) -> Self {
        Self {
            recipient,
            event_type: event.event_type().clone(),
            digest: event.digest().clone(),
            visible,
            forwarded_from,
            payload: event.payload().map(str::to_string),
            timestamp: event.timestamp(),
            expires: event.expires(),
            in_response_to: event.in_response_to().cloned(),
        }
    }
}

/// A resolved delivery target for one entity.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Attempts to hand the event to the recipient.
    ///
    /// At most one attempt is made per recipient per dispatch or
    /// forward call; the coordinator never retries.
    async fn deliver(&self, delivery: &Delivery) -> Result<(), EndpointError>;
}

/// Resolves entity ids to live delivery targets.
///
/// Resolution happens at delivery time, not at event construction.
/// Implementations may await external resolution (network presence) and
/// must not hold any lock shared with other in-flight deliveries.
#[async_trait]
pub trait EntityRegistry: Send + Sync {
    async fn resolve(&self, id: &EntityId) -> Result<Arc<dyn Endpoint>, ResolveError>;
}
