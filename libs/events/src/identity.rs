//! Content-derived event identity.
//!
//! The identity of an event is the lowercase hex SHA-256 of a canonical
//! JSON serialization of its defining fields. The serialization is stable
//! and documented here, because downstream deduplication depends on two
//! logically identical events always producing the same digest:
//!
//! ```json
//! {
//!   "expires":     <RFC 3339 UTC string or null>,
//!   "payload":     <string or null>,
//!   "response_to": <digest string or null>,
//!   "timestamp":   <RFC 3339 UTC string or null>,
//!   "type":        <event type string>
//! }
//! ```
//!
//! When the event is addressing-sensitive, two more keys participate:
//! `"source"` (the normalized source id) and `"to"` (the normalized
//! primary recipients, in their canonical order). Keys are emitted in
//! sorted order with no extra whitespace.
//!
//! The digest is a deduplication key, not an integrity guarantee against
//! a hostile sender; collisions are possible in principle and tolerated.

use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};
use wrp_entity::EventDigest;

use crate::{EventAddressing, EventType};

/// The defining fields that participate in identity.
#[derive(Debug)]
pub(crate) struct IdentityFields<'a> {
    pub event_type: &'a EventType,
    pub payload: Option<&'a str>,
    pub in_response_to: Option<&'a EventDigest>,
    pub timestamp: Option<DateTime<Utc>>,
    pub expires: Option<DateTime<Utc>>,
    /// Present iff the event is addressing-sensitive.
    pub addressing: Option<&'a EventAddressing>,
}

/// Computes the event digest over the canonical serialization.
pub(crate) fn compute(fields: &IdentityFields<'_>) -> EventDigest {
    let canonical = canonical_form(fields);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    let digest: [u8; 32] = hasher.finalize().into();
    EventDigest::from_bytes(&digest)
}

fn canonical_form(fields: &IdentityFields<'_>) -> String {
    let mut out = String::with_capacity(128);
    out.push('{');

    push_key(&mut out, "expires");
    push_opt_time(&mut out, fields.expires);

    out.push(',');
    push_key(&mut out, "payload");
    push_opt_str(&mut out, fields.payload);

    out.push(',');
    push_key(&mut out, "response_to");
    push_opt_str(&mut out, fields.in_response_to.map(EventDigest::as_str));

    if let Some(addressing) = fields.addressing {
        out.push(',');
        push_key(&mut out, "source");
        push_str(&mut out, addressing.source().as_str());
    }

    out.push(',');
    push_key(&mut out, "timestamp");
    push_opt_time(&mut out, fields.timestamp);

    if let Some(addressing) = fields.addressing {
        out.push(',');
        push_key(&mut out, "to");
        out.push('[');
        for (i, entity) in addressing.to().iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            push_str(&mut out, entity.as_str());
        }
        out.push(']');
    }

    out.push(',');
    push_key(&mut out, "type");
    push_str(&mut out, fields.event_type.as_str());

    out.push('}');
    out
}

fn push_key(out: &mut String, key: &str) {
    push_str(out, key);
    out.push(':');
}

fn push_opt_time(out: &mut String, value: Option<DateTime<Utc>>) {
    match value {
        // Millisecond precision with a fixed Z suffix keeps the form
        // independent of how the timestamp was produced.
        Some(t) => push_str(out, &t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        None => out.push_str("null"),
    }
}

fn push_opt_str(out: &mut String, value: Option<&str>) {
    match value {
        Some(s) => push_str(out, s),
        None => out.push_str("null"),
    }
}

fn push_str(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(out, "\\u{:04x}", c as u32);
            }
            c => out.push(c),
        }
    }
    out.push('"');
}
