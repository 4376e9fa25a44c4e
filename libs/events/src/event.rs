//! The immutable event record.
//!
//! An [`Event`] is fixed at construction: type, normalized addressing,
//! content digest, timing, and payload never change afterwards. The only
//! exception is the forwarding context pair, which the delivery
//! coordinator sets during a forward operation; that write is serialized
//! behind a lock so readers never observe a half-set pair.

use std::sync::RwLock;

use chrono::{DateTime, Utc};
use wrp_entity::{EntityId, EventDigest};

use crate::identity::{self, IdentityFields};
use crate::{AddressingInput, EventAddressing, EventError, OriginContext};

/// Reserved type name that cannot be used for events; it is the
/// match-all marker on the listener side.
pub const RESERVED_TYPE_ANY: &str = "any";

// =============================================================================
// Event Type
// =============================================================================

/// A validated event type name.
///
/// Must match `[_a-zA-Z][_a-zA-Z0-9]*`; the reserved word `any` is
/// rejected.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventType(String);

impl EventType {
    /// Parses and validates an event type name.
    pub fn parse(s: &str) -> Result<Self, EventError> {
        let mut chars = s.chars();
        let Some(first) = chars.next() else {
            return Err(EventError::InvalidType(s.to_string()));
        };
        if first != '_' && !first.is_ascii_alphabetic() {
            return Err(EventError::InvalidType(s.to_string()));
        }
        if !chars.all(|c| c == '_' || c.is_ascii_alphanumeric()) {
            return Err(EventError::InvalidType(s.to_string()));
        }
        if s == RESERVED_TYPE_ANY {
            return Err(EventError::ReservedType);
        }
        Ok(Self(s.to_string()))
    }

    /// Returns the type name as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl serde::Serialize for EventType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for EventType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Authorization Seam
// =============================================================================

/// Decides whether a calling application may originate events on behalf
/// of a source entity. Consulted once, at construction time.
pub trait Authorizer: Send + Sync {
    /// Returns true if `caller` may originate events for `source`.
    fn may_originate(&self, caller: &EntityId, source: &EntityId) -> bool;
}

/// Permits everything. For embedders without an authorization service.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Authorizer for AllowAll {
    fn may_originate(&self, _caller: &EntityId, _source: &EntityId) -> bool {
        true
    }
}

// =============================================================================
// Forwarding Context
// =============================================================================

/// The addressing of a forwarding hop, set by a forward operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardingContext {
    /// Normalized forwarding addressing.
    pub addressing: EventAddressing,

    /// When the forward happened; present only when requested.
    pub forwarded_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Event
// =============================================================================

/// An immutable event record.
///
/// Constructed through [`Event::builder`]; the build step normalizes
/// addressing, checks origination authorization, and derives the content
/// digest. Identity is preserved across forwards.
#[derive(Debug)]
pub struct Event {
    event_type: EventType,
    addressing: EventAddressing,
    digest: EventDigest,
    in_response_to: Option<EventDigest>,
    timestamp: Option<DateTime<Utc>>,
    expires: Option<DateTime<Utc>>,
    addressing_sensitive: bool,
    payload: Option<String>,
    forwarding: RwLock<Option<ForwardingContext>>,
}

impl Event {
    /// Creates a new event builder.
    pub fn builder() -> EventBuilder {
        EventBuilder::new()
    }

    /// The event type.
    #[must_use]
    pub fn event_type(&self) -> &EventType {
        &self.event_type
    }

    /// The normalized addressing, fixed at construction.
    #[must_use]
    pub fn addressing(&self) -> &EventAddressing {
        &self.addressing
    }

    /// Content-derived identity, used downstream for deduplication.
    #[must_use]
    pub fn digest(&self) -> &EventDigest {
        &self.digest
    }

    /// Digest of the event this one responds to, if any.
    ///
    /// A non-owning back-reference; resolving it is the embedder's
    /// concern.
    #[must_use]
    pub fn in_response_to(&self) -> Option<&EventDigest> {
        self.in_response_to.as_ref()
    }

    /// Origin-supplied timestamp, if any.
    #[must_use]
    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }

    /// Instant after which the event is stale, if any.
    #[must_use]
    pub fn expires(&self) -> Option<DateTime<Utc>> {
        self.expires
    }

    /// Whether the normalized source and primary recipients participate
    /// in the identity digest.
    #[must_use]
    pub fn addressing_sensitive(&self) -> bool {
        self.addressing_sensitive
    }

    /// Opaque payload, if any.
    #[must_use]
    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    /// Returns true if `now` is past the expiry timestamp.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires.is_some_and(|expires| now > expires)
    }

    /// The current forwarding context, if a forward has happened.
    ///
    /// Null until the first forward; a later forward replaces it.
    #[must_use]
    pub fn forwarding(&self) -> Option<ForwardingContext> {
        self.forwarding
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Records a forwarding hop.
    ///
    /// Called by the delivery coordinator as a side effect of a forward
    /// operation. The addressing/timestamp pair is written under a lock
    /// so a concurrent [`Event::forwarding`] read sees either the old
    /// pair or the new one, never a mix.
    pub fn record_forwarding(
        &self,
        addressing: EventAddressing,
        forwarded_at: Option<DateTime<Utc>>,
    ) {
        let mut slot = self.forwarding.write().unwrap_or_else(|e| e.into_inner());
        *slot = Some(ForwardingContext {
            addressing,
            forwarded_at,
        });
    }
}

/// Builder for constructing events.
#[derive(Debug, Default)]
pub struct EventBuilder {
    event_type: Option<String>,
    addressing: AddressingInput,
    payload: Option<String>,
    in_response_to: Option<EventDigest>,
    timestamp: Option<DateTime<Utc>>,
    expires: Option<DateTime<Utc>>,
    addressing_sensitive: bool,
}

impl EventBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the event type name, validated at build time.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the addressing in its relaxed form.
    pub fn addressing(mut self, addressing: AddressingInput) -> Self {
        self.addressing = addressing;
        self
    }

    /// Sets the opaque payload.
    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// References a prior event this one responds to.
    pub fn in_response_to(mut self, digest: EventDigest) -> Self {
        self.in_response_to = Some(digest);
        self
    }

    /// Sets the origin timestamp.
    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Sets the expiry timestamp.
    pub fn expires(mut self, expires: DateTime<Utc>) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Makes the identity digest sensitive to source and primary
    /// recipients. Default false.
    pub fn addressing_sensitive(mut self, sensitive: bool) -> Self {
        self.addressing_sensitive = sensitive;
        self
    }

    /// Builds the event.
    ///
    /// Validates the type name, normalizes the addressing against the
    /// calling application's context, checks that the caller may
    /// originate events for the resolved source, and derives the
    /// content digest. No partial event is produced on failure.
    pub fn build(
        self,
        ctx: &OriginContext,
        authorizer: &dyn Authorizer,
    ) -> Result<Event, EventError> {
        let raw_type = self.event_type.unwrap_or_default();
        let event_type = EventType::parse(&raw_type)?;

        let addressing = self.addressing.normalize(ctx)?;

        if !authorizer.may_originate(ctx.entity(), addressing.source()) {
            return Err(EventError::Unauthorized {
                caller: ctx.entity().clone(),
                origin: addressing.source().clone(),
            });
        }

        let digest = identity::compute(&IdentityFields {
            event_type: &event_type,
            payload: self.payload.as_deref(),
            in_response_to: self.in_response_to.as_ref(),
            timestamp: self.timestamp,
            expires: self.expires,
            addressing: self.addressing_sensitive.then_some(&addressing),
        });

        Ok(Event {
            event_type,
            addressing,
            digest,
            in_response_to: self.in_response_to,
            timestamp: self.timestamp,
            expires: self.expires,
            addressing_sensitive: self.addressing_sensitive,
            payload: self.payload,
            forwarding: RwLock::new(None),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn ent(s: &str) -> EntityId {
        EntityId::parse(s).unwrap()
    }

    fn ctx() -> OriginContext {
        OriginContext::new(ent("caller.app"))
    }

    fn addressed_to(to: &[&str]) -> AddressingInput {
        AddressingInput::new().to(to.iter().map(|s| ent(s)))
    }

    struct DenyAll;
    impl Authorizer for DenyAll {
        fn may_originate(&self, _caller: &EntityId, _source: &EntityId) -> bool {
            false
        }
    }

    #[test]
    fn test_event_type_validation() {
        assert!(EventType::parse("_ok").is_ok());
        assert!(EventType::parse("Weather2").is_ok());
        assert!(matches!(
            EventType::parse("2bad").unwrap_err(),
            EventError::InvalidType(_)
        ));
        assert!(matches!(
            EventType::parse("has-dash").unwrap_err(),
            EventError::InvalidType(_)
        ));
        assert!(matches!(
            EventType::parse("").unwrap_err(),
            EventError::InvalidType(_)
        ));
        assert_eq!(EventType::parse("any").unwrap_err(), EventError::ReservedType);
        // Only the exact reserved word is forbidden
        assert!(EventType::parse("anything").is_ok());
    }

    #[test]
    fn test_build_minimal() {
        let event = Event::builder()
            .event_type("ping")
            .addressing(addressed_to(&["b"]))
            .build(&ctx(), &AllowAll)
            .unwrap();
        assert_eq!(event.event_type().as_str(), "ping");
        assert_eq!(event.addressing().source(), &ent("caller.app"));
        assert!(event.forwarding().is_none());
        assert!(!event.addressing_sensitive());
        assert!(event.payload().is_none());
    }

    #[test]
    fn test_build_rejects_empty_to() {
        let err = Event::builder()
            .event_type("ping")
            .build(&ctx(), &AllowAll)
            .unwrap_err();
        assert_eq!(err, EventError::EmptyRecipients);
    }

    #[test]
    fn test_build_rejects_unauthorized_source() {
        let err = Event::builder()
            .event_type("ping")
            .addressing(addressed_to(&["b"]).source(ent("someone.else")))
            .build(&ctx(), &DenyAll)
            .unwrap_err();
        assert_eq!(
            err,
            EventError::Unauthorized {
                caller: ent("caller.app"),
                origin: ent("someone.else"),
            }
        );
        assert_eq!(
            err.to_string(),
            "caller 'caller.app' is not authorized to originate events for 'someone.else'"
        );
    }

    #[test]
    fn test_identity_insensitive_to_addressing_by_default() {
        let a = Event::builder()
            .event_type("ping")
            .payload("p")
            .addressing(addressed_to(&["b"]))
            .build(&ctx(), &AllowAll)
            .unwrap();
        let b = Event::builder()
            .event_type("ping")
            .payload("p")
            .addressing(addressed_to(&["c", "d"]))
            .build(&ctx(), &AllowAll)
            .unwrap();
        assert_eq!(a.digest(), b.digest());
    }

    #[test]
    fn test_identity_sensitive_to_addressing_when_requested() {
        let a = Event::builder()
            .event_type("ping")
            .addressing_sensitive(true)
            .addressing(addressed_to(&["b"]))
            .build(&ctx(), &AllowAll)
            .unwrap();
        let b = Event::builder()
            .event_type("ping")
            .addressing_sensitive(true)
            .addressing(addressed_to(&["c"]))
            .build(&ctx(), &AllowAll)
            .unwrap();
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn test_is_expired() {
        let now = Utc::now();
        let event = Event::builder()
            .event_type("ping")
            .addressing(addressed_to(&["b"]))
            .expires(now - Duration::seconds(1))
            .build(&ctx(), &AllowAll)
            .unwrap();
        assert!(event.is_expired(now));

        let fresh = Event::builder()
            .event_type("ping")
            .addressing(addressed_to(&["b"]))
            .expires(now + Duration::seconds(60))
            .build(&ctx(), &AllowAll)
            .unwrap();
        assert!(!fresh.is_expired(now));
    }

    #[test]
    fn test_record_forwarding_replaces_pair() {
        let event = Event::builder()
            .event_type("ping")
            .addressing(addressed_to(&["b"]))
            .build(&ctx(), &AllowAll)
            .unwrap();
        assert!(event.forwarding().is_none());

        let hop1 = addressed_to(&["x"]).normalize(&ctx()).unwrap();
        event.record_forwarding(hop1.clone(), None);
        let seen = event.forwarding().unwrap();
        assert_eq!(seen.addressing, hop1);
        assert!(seen.forwarded_at.is_none());

        let hop2 = addressed_to(&["y"]).normalize(&ctx()).unwrap();
        let at = Utc::now();
        event.record_forwarding(hop2.clone(), Some(at));
        let seen = event.forwarding().unwrap();
        assert_eq!(seen.addressing, hop2);
        assert_eq!(seen.forwarded_at, Some(at));
    }

    #[test]
    fn test_in_response_to_is_back_reference_only() {
        let first = Event::builder()
            .event_type("ping")
            .addressing(addressed_to(&["b"]))
            .build(&ctx(), &AllowAll)
            .unwrap();
        let reply = Event::builder()
            .event_type("pong")
            .addressing(addressed_to(&["caller.app"]))
            .in_response_to(first.digest().clone())
            .build(&ctx(), &AllowAll)
            .unwrap();
        assert_eq!(reply.in_response_to(), Some(first.digest()));
    }
}
