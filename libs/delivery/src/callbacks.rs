//! Application-supplied delivery status callbacks.

use wrp_entity::EntityId;
use wrp_events::DeliveryError;

/// Status callbacks for a dispatch or forward call.
///
/// All handlers default to no-ops; implementors override only the slots
/// they care about. For one recipient the handlers run in strict order
/// `on_sending` → (`on_caching` → `on_delivery`) | `on_timeout` |
/// `on_error`, each at most once. Handlers run on delivery tasks and
/// should return quickly.
pub trait CallbackSink: Send + Sync {
    /// The delivery attempt for `recipient` has started.
    fn on_sending(&self, _recipient: &EntityId) {}

    /// The event was accepted and is being retained by the recipient
    /// runtime.
    fn on_caching(&self, _recipient: &EntityId) {}

    /// The event reached `recipient`.
    fn on_delivery(&self, _recipient: &EntityId) {}

    /// The reference timeout elapsed before delivery to `recipient`
    /// completed. Not an error.
    fn on_timeout(&self, _recipient: &EntityId) {}

    /// Delivery to `recipient` failed. Other recipients are unaffected.
    fn on_error(&self, _recipient: &EntityId, _error: &DeliveryError) {}

    /// Whether any of the delivery/timeout/error handlers is attached.
    ///
    /// When false the coordinator still drives the state machine but
    /// skips the terminal notifications.
    fn wants_notification(&self) -> bool {
        true
    }
}

/// A sink with no handlers attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl CallbackSink for NoopSink {
    fn wants_notification(&self) -> bool {
        false
    }
}
