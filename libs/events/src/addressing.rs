//! Event addressing and normalization.
//!
//! Addressing comes in two forms. [`AddressingInput`] is the relaxed,
//! caller-facing form: the source may be absent (meaning "the calling
//! application") and the recipient lists carry no ordering or disjointness
//! guarantees. [`EventAddressing`] is the normalized form fixed into an
//! event at construction: a mandatory source and sorted, duplicate-free,
//! mutually disjoint recipient lists.
//!
//! # Invariants
//!
//! - Normalization is a pure function; callers never observe a partially
//!   normalized value
//! - `to`, `cc`, and `bcc` are strictly ascending by code-point order
//! - `to` ∩ `cc` = ∅, `to` ∩ `bcc` = ∅, `cc` ∩ `bcc` = ∅, with `to`
//!   taking precedence over `cc` and `cc` over `bcc`
//! - Normalized `to` is non-empty

use serde::{Deserialize, Serialize};
use wrp_entity::EntityId;

use crate::EventError;

/// Execution context identifying the calling application.
///
/// Every call site that may omit an addressing source carries one of
/// these; there is no ambient "current application" global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginContext {
    entity: EntityId,
}

impl OriginContext {
    /// Creates a context for the given calling application.
    pub fn new(entity: EntityId) -> Self {
        Self { entity }
    }

    /// The calling application's entity id.
    #[must_use]
    pub fn entity(&self) -> &EntityId {
        &self.entity
    }
}

/// Relaxed addressing as supplied by callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressingInput {
    /// Originating entity; absent means the calling application.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<EntityId>,

    /// Primary recipients.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<EntityId>,

    /// Secondary recipients.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<EntityId>,

    /// Blind recipients, invisible to all other recipients.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bcc: Vec<EntityId>,
}

impl AddressingInput {
    /// Creates an empty input.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source.
    pub fn source(mut self, source: EntityId) -> Self {
        self.source = Some(source);
        self
    }

    /// Sets the primary recipients.
    pub fn to(mut self, to: impl IntoIterator<Item = EntityId>) -> Self {
        self.to = to.into_iter().collect();
        self
    }

    /// Sets the secondary recipients.
    pub fn cc(mut self, cc: impl IntoIterator<Item = EntityId>) -> Self {
        self.cc = cc.into_iter().collect();
        self
    }

    /// Sets the blind recipients.
    pub fn bcc(mut self, bcc: impl IntoIterator<Item = EntityId>) -> Self {
        self.bcc = bcc.into_iter().collect();
        self
    }

    /// Normalizes this input into canonical addressing.
    ///
    /// A missing source resolves to the calling application from `ctx`.
    /// Each recipient list is sorted ascending by code-point order and
    /// deduplicated; entities already in `to` are dropped from `cc` and
    /// `bcc`, and entities remaining in `cc` are dropped from `bcc`.
    ///
    /// Fails with [`EventError::EmptyRecipients`] when the normalized
    /// `to` is empty.
    pub fn normalize(&self, ctx: &OriginContext) -> Result<EventAddressing, EventError> {
        let source = self
            .source
            .clone()
            .unwrap_or_else(|| ctx.entity().clone());

        let to = sort_dedup(&self.to);
        if to.is_empty() {
            return Err(EventError::EmptyRecipients);
        }

        let cc: Vec<EntityId> = sort_dedup(&self.cc)
            .into_iter()
            .filter(|e| to.binary_search(e).is_err())
            .collect();

        let bcc: Vec<EntityId> = sort_dedup(&self.bcc)
            .into_iter()
            .filter(|e| to.binary_search(e).is_err() && cc.binary_search(e).is_err())
            .collect();

        Ok(EventAddressing { source, to, cc, bcc })
    }
}

impl From<EventAddressing> for AddressingInput {
    fn from(addressing: EventAddressing) -> Self {
        Self {
            source: Some(addressing.source),
            to: addressing.to,
            cc: addressing.cc,
            bcc: addressing.bcc,
        }
    }
}

fn sort_dedup(entities: &[EntityId]) -> Vec<EntityId> {
    let mut out: Vec<EntityId> = entities.to_vec();
    out.sort();
    out.dedup();
    out
}

/// Canonical, normalized addressing.
///
/// Only produced by [`AddressingInput::normalize`]; the fields are
/// private so the invariants cannot be broken after the fact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventAddressing {
    source: EntityId,
    to: Vec<EntityId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    cc: Vec<EntityId>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    bcc: Vec<EntityId>,
}

impl EventAddressing {
    /// The originating entity.
    #[must_use]
    pub fn source(&self) -> &EntityId {
        &self.source
    }

    /// Primary recipients, sorted and duplicate-free, never empty.
    #[must_use]
    pub fn to(&self) -> &[EntityId] {
        &self.to
    }

    /// Secondary recipients, disjoint from `to`.
    #[must_use]
    pub fn cc(&self) -> &[EntityId] {
        &self.cc
    }

    /// Blind recipients, disjoint from `to` and `cc`.
    #[must_use]
    pub fn bcc(&self) -> &[EntityId] {
        &self.bcc
    }

    /// Iterates all recipients: `to`, then `cc`, then `bcc`.
    pub fn recipients(&self) -> impl Iterator<Item = &EntityId> {
        self.to.iter().chain(self.cc.iter()).chain(self.bcc.iter())
    }

    /// Returns true if the entity appears in any recipient list.
    #[must_use]
    pub fn is_recipient(&self, entity: &EntityId) -> bool {
        self.to.binary_search(entity).is_ok()
            || self.cc.binary_search(entity).is_ok()
            || self.bcc.binary_search(entity).is_ok()
    }

    /// A copy of this addressing with the blind recipients removed.
    ///
    /// This is the form other recipients are allowed to see.
    #[must_use]
    pub fn without_bcc(&self) -> Self {
        Self {
            source: self.source.clone(),
            to: self.to.clone(),
            cc: self.cc.clone(),
            bcc: Vec::new(),
        }
    }
}
