//! The delivery coordinator: dispatch/forward orchestration.
//!
//! One tokio task per recipient; recipients are independent failure
//! domains with no ordering between them. The coordinator is the only
//! mutator of per-recipient delivery state, and per-recipient callbacks
//! run inline on the delivery task, so "recipient is terminal" implies
//! "its callbacks have run".

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use wrp_entity::{EntityId, EventDigest, ListenerId};
use wrp_events::{
    AddressingInput, DeliveryError, DeliveryErrorKind, Event, EventAddressing, EventError,
    OriginContext,
};

use crate::callbacks::CallbackSink;
use crate::listeners::{EventListener, ListenerFilter, ListenerRegistry};
use crate::registry::{Delivery, EntityRegistry};
use crate::state::{DeliveryState, DispatchHandle};

/// Coordinator tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    /// Cap on concurrently running delivery attempts across all calls.
    pub max_concurrent_deliveries: usize,

    /// Reference hold applied to calls that do not set their own
    /// `reference_timeout`. None means no hold and no timeout.
    pub default_reference_hold: Option<Duration>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_deliveries: 64,
            default_reference_hold: None,
        }
    }
}

/// Options for one dispatch or forward call.
#[derive(Debug, Clone, Copy, Default)]
pub struct DispatchOptions {
    /// Keep the event reachable until this instant, and time out
    /// recipients that are not terminal by then.
    pub reference_timeout: Option<DateTime<Utc>>,

    /// Block the caller until a release condition: the reference
    /// timeout (if future), else the expiry timestamp (if future),
    /// else all recipients terminal with their callbacks run.
    pub sync: bool,
}

/// Orchestrates event delivery: fan-out, per-recipient state, dedup,
/// expiry, reference holds, and listener notification.
pub struct DeliveryCoordinator {
    registry: Arc<dyn EntityRegistry>,
    listeners: ListenerRegistry,
    seen: Mutex<HashMap<EntityId, HashSet<EventDigest>>>,
    limiter: Arc<Semaphore>,
    default_reference_hold: Option<Duration>,
}

impl DeliveryCoordinator {
    /// Creates a coordinator over the given entity registry.
    pub fn new(registry: Arc<dyn EntityRegistry>, config: CoordinatorConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            listeners: ListenerRegistry::new(),
            seen: Mutex::new(HashMap::new()),
            limiter: Arc::new(Semaphore::new(config.max_concurrent_deliveries)),
            default_reference_hold: config.default_reference_hold,
        })
    }

    /// Registers a listener for delivered events.
    ///
    /// Absent filter fields match everything.
    pub fn add_event_listener(
        &self,
        listener: Arc<dyn EventListener>,
        filter: ListenerFilter,
    ) -> ListenerId {
        self.listeners.add(listener, filter)
    }

    /// Removes a listener registration.
    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }

    /// Dispatches an event to its normalized recipients.
    ///
    /// Every recipient of `to`, `cc`, and `bcc` is delivered to
    /// individually; the view handed across the delivery seam never
    /// exposes the blind recipients. Returns a handle for observing
    /// per-recipient state regardless of the `sync` flag.
    pub async fn dispatch(
        self: &Arc<Self>,
        event: Arc<Event>,
        sink: Arc<dyn CallbackSink>,
        opts: DispatchOptions,
    ) -> DispatchHandle {
        let recipients: Vec<EntityId> = event.addressing().recipients().cloned().collect();
        let visible = event.addressing().without_bcc();
        debug!(
            digest = %event.digest(),
            event_type = %event.event_type(),
            recipients = recipients.len(),
            sync = opts.sync,
            "Dispatching event"
        );
        self.run(event, recipients, visible, None, sink, opts).await
    }

    /// Forwards an event on behalf of a new addressing context.
    ///
    /// The forwarding addressing is normalized against the forwarder's
    /// context; its `to`, `cc`, and `bcc` become the recipients. Each of
    /// them receives the original `to`/`cc` (never the original `bcc`)
    /// as contextual references. The event's forwarding pair is set as a
    /// side effect, with a timestamp only when `with_timestamp` is true;
    /// identity is unchanged.
    pub async fn forward(
        self: &Arc<Self>,
        ctx: &OriginContext,
        event: Arc<Event>,
        forwarding: AddressingInput,
        with_timestamp: bool,
        sink: Arc<dyn CallbackSink>,
        opts: DispatchOptions,
    ) -> Result<DispatchHandle, EventError> {
        let hop = forwarding.normalize(ctx)?;
        let forwarded_at = with_timestamp.then(Utc::now);
        event.record_forwarding(hop.clone(), forwarded_at);

        let recipients: Vec<EntityId> = hop.recipients().cloned().collect();
        let visible = hop.without_bcc();
        let original = Some(event.addressing().without_bcc());
        debug!(
            digest = %event.digest(),
            forwarder = %ctx.entity(),
            recipients = recipients.len(),
            "Forwarding event"
        );
        Ok(self
            .run(event, recipients, visible, original, sink, opts)
            .await)
    }

    async fn run(
        self: &Arc<Self>,
        event: Arc<Event>,
        recipients: Vec<EntityId>,
        visible: EventAddressing,
        forwarded_from: Option<EventAddressing>,
        sink: Arc<dyn CallbackSink>,
        opts: DispatchOptions,
    ) -> DispatchHandle {
        let handle = DispatchHandle::new(&recipients);
        let reference_timeout = self.effective_reference_timeout(opts.reference_timeout);
        self.hold_reference(&event, reference_timeout);

        for recipient in recipients {
            let coordinator = self.clone();
            let event = event.clone();
            let visible = visible.clone();
            let forwarded_from = forwarded_from.clone();
            let sink = sink.clone();
            let handle = handle.clone();
            let deadline = reference_timeout;
            tokio::spawn(async move {
                coordinator
                    .deliver_one(event, recipient, visible, forwarded_from, sink, handle, deadline)
                    .await;
            });
        }

        if opts.sync {
            Self::wait_release(&handle, reference_timeout, event.expires()).await;
        }
        handle
    }

    /// An explicit per-call timeout wins over the configured default
    /// hold window.
    fn effective_reference_timeout(
        &self,
        requested: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        requested.or_else(|| {
            self.default_reference_hold
                .and_then(|hold| chrono::Duration::from_std(hold).ok())
                .map(|hold| Utc::now() + hold)
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn deliver_one(
        self: Arc<Self>,
        event: Arc<Event>,
        recipient: EntityId,
        visible: EventAddressing,
        forwarded_from: Option<EventAddressing>,
        sink: Arc<dyn CallbackSink>,
        handle: DispatchHandle,
        deadline: Option<DateTime<Utc>>,
    ) {
        let attempt = self.attempt(&event, &recipient, visible, forwarded_from, &sink, &handle);

        let outcome = match deadline.and_then(duration_until) {
            Some(timeout) => {
                tokio::select! {
                    outcome = attempt => outcome,
                    _ = tokio::time::sleep(timeout) => {
                        // The dropped attempt keeps any seen-set
                        // reservation: the endpoint may already have
                        // observed the event.
                        handle.finish(&recipient, DeliveryState::TimedOut, || {
                            debug!(recipient = %recipient, digest = %event.digest(), "Delivery timed out");
                            if sink.wants_notification() {
                                sink.on_timeout(&recipient);
                            }
                        });
                        return;
                    }
                }
            }
            None => attempt.await,
        };

        if let Err(error) = outcome {
            handle.finish(&recipient, DeliveryState::Error(error.kind), || {
                warn!(
                    recipient = %recipient,
                    digest = %event.digest(),
                    kind = %error.kind,
                    "Delivery failed"
                );
                if sink.wants_notification() {
                    sink.on_error(&recipient, &error);
                }
            });
        }
    }

    /// One delivery attempt; no retries.
    ///
    /// Success paths advance the handle and invoke the non-error
    /// callbacks inline; failures are returned for the caller to record
    /// so the timeout race in `deliver_one` stays the sole place where
    /// terminal-vs-timeout is decided.
    async fn attempt(
        &self,
        event: &Arc<Event>,
        recipient: &EntityId,
        visible: EventAddressing,
        forwarded_from: Option<EventAddressing>,
        sink: &Arc<dyn CallbackSink>,
        handle: &DispatchHandle,
    ) -> Result<(), DeliveryError> {
        let _permit = self.limiter.clone().acquire_owned().await.map_err(|_| {
            DeliveryError::new(DeliveryErrorKind::Refused, "delivery limiter closed")
        })?;

        // Resolution failures skip Sending entirely: Pending -> Error.
        let endpoint = self
            .registry
            .resolve(recipient)
            .await
            .map_err(|e| e.into_delivery_error())?;

        handle.advance(recipient, DeliveryState::Sending);
        sink.on_sending(recipient);

        // Reserve the digest before attempting, so two in-flight
        // dispatches of the same identity cannot both pass the check.
        // A failed attempt releases its reservation below and stays
        // re-dispatchable.
        if !self.reserve(recipient, event.digest()) {
            return Err(DeliveryError::new(
                DeliveryErrorKind::Duplicate,
                format!("recipient already observed event {}", event.digest()),
            ));
        }

        let now = Utc::now();
        if event.is_expired(now) {
            self.release(recipient, event.digest());
            return Err(DeliveryError::new(
                DeliveryErrorKind::Expired,
                format!("event expired at {:?}", event.expires()),
            ));
        }

        let delivery = Delivery::build(event, recipient.clone(), visible, forwarded_from);
        if let Err(error) = endpoint.deliver(&delivery).await {
            self.release(recipient, event.digest());
            return Err(error.into_delivery_error());
        }

        handle.advance(recipient, DeliveryState::Caching);
        sink.on_caching(recipient);

        handle.finish(recipient, DeliveryState::Delivered, || {
            debug!(recipient = %recipient, digest = %event.digest(), "Delivered");
            if sink.wants_notification() {
                sink.on_delivery(recipient);
            }
            self.listeners.notify_delivered(&delivery);
        });
        Ok(())
    }

    /// Blocks until the first release condition.
    ///
    /// The race is: the reference-timeout deadline if it lies in the
    /// future; otherwise the expiry deadline if it lies in the future;
    /// otherwise, when either deadline was configured but already
    /// passed, release immediately; with no deadline configured at all,
    /// wait for every recipient to reach a terminal state.
    async fn wait_release(
        handle: &DispatchHandle,
        reference_timeout: Option<DateTime<Utc>>,
        expires: Option<DateTime<Utc>>,
    ) {
        let now = Utc::now();
        let deadline = match reference_timeout {
            Some(t) if t > now => Some(t),
            _ => expires.filter(|t| *t > now),
        };

        match deadline {
            Some(deadline) => {
                let Some(timeout) = duration_until(deadline) else {
                    return;
                };
                tokio::select! {
                    _ = tokio::time::sleep(timeout) => {}
                    _ = handle.wait_complete() => {}
                }
            }
            None if reference_timeout.is_some() || expires.is_some() => {
                // Every configured deadline is already in the past;
                // there is nothing left to wait for.
            }
            None => handle.wait_complete().await,
        }
    }

    /// Keeps the event reachable until the reference timeout.
    fn hold_reference(&self, event: &Arc<Event>, reference_timeout: Option<DateTime<Utc>>) {
        let Some(until) = reference_timeout else {
            return;
        };
        let Some(hold) = duration_until(until) else {
            return;
        };
        let held = event.clone();
        tokio::spawn(async move {
            tokio::time::sleep(hold).await;
            debug!(digest = %held.digest(), "Reference hold released");
        });
    }

    /// Claims (recipient, digest) in the seen-set. False means the
    /// recipient already observed the identity, or another attempt
    /// holds the claim right now.
    fn reserve(&self, recipient: &EntityId, digest: &EventDigest) -> bool {
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(recipient.clone())
            .or_default()
            .insert(digest.clone())
    }

    fn release(&self, recipient: &EntityId, digest: &EventDigest) {
        if let Some(digests) = self
            .seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_mut(recipient)
        {
            digests.remove(digest);
        }
    }
}

fn duration_until(deadline: DateTime<Utc>) -> Option<Duration> {
    (deadline - Utc::now()).to_std().ok().filter(|d| !d.is_zero())
}
