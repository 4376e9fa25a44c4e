//! Per-recipient delivery state tracking.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use wrp_entity::EntityId;
use wrp_events::DeliveryErrorKind;

/// Delivery state for one (event, recipient) pair.
///
/// Transitions: `Pending → Sending → {Caching → Delivered} | TimedOut |
/// Error`. `Delivered`, `TimedOut`, and `Error` are terminal. Resolution
/// failures move `Pending` directly to `Error` without a `Sending` hop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Queued, delivery not yet attempted.
    Pending,

    /// The delivery attempt has started.
    Sending,

    /// Accepted by the recipient runtime, retention in progress.
    Caching,

    /// Delivered.
    Delivered,

    /// The reference timeout elapsed before a terminal outcome.
    TimedOut,

    /// Delivery failed.
    Error(DeliveryErrorKind),
}

impl DeliveryState {
    /// Returns true for `Delivered`, `TimedOut`, and `Error`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeliveryState::Delivered | DeliveryState::TimedOut | DeliveryState::Error(_)
        )
    }
}

/// Handle to one dispatch or forward call.
///
/// The coordinator is the only writer; callers use the handle to
/// observe per-recipient state and to await completion independently of
/// the `sync` flag.
#[derive(Debug, Clone)]
pub struct DispatchHandle {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    states: Mutex<HashMap<EntityId, DeliveryState>>,
    remaining: AtomicUsize,
    done: Notify,
}

impl DispatchHandle {
    pub(crate) fn new(recipients: &[EntityId]) -> Self {
        let states = recipients
            .iter()
            .map(|r| (r.clone(), DeliveryState::Pending))
            .collect::<HashMap<_, _>>();
        let remaining = states.len();
        Self {
            inner: Arc::new(Inner {
                states: Mutex::new(states),
                remaining: AtomicUsize::new(remaining),
                done: Notify::new(),
            }),
        }
    }

    /// Moves a recipient to a non-terminal state.
    ///
    /// Ignored once the recipient is terminal.
    pub(crate) fn advance(&self, recipient: &EntityId, state: DeliveryState) -> bool {
        debug_assert!(!state.is_terminal(), "terminal transitions go through finish");
        let mut states = self.inner.states.lock().unwrap_or_else(|e| e.into_inner());
        match states.get_mut(recipient) {
            Some(current) if !current.is_terminal() => {
                *current = state;
                true
            }
            _ => false,
        }
    }

    /// Moves a recipient to a terminal state, exactly once.
    ///
    /// `after` runs between recording the state and signalling
    /// completion, so a synchronous waiter released by "all terminal"
    /// can rely on the recipient's callbacks having run. Returns false
    /// (and skips `after`) if another terminal transition already won.
    pub(crate) fn finish(
        &self,
        recipient: &EntityId,
        state: DeliveryState,
        after: impl FnOnce(),
    ) -> bool {
        debug_assert!(state.is_terminal());
        {
            let mut states = self.inner.states.lock().unwrap_or_else(|e| e.into_inner());
            match states.get_mut(recipient) {
                Some(current) if !current.is_terminal() => *current = state,
                _ => return false,
            }
        }
        after();
        if self.inner.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.inner.done.notify_waiters();
        }
        true
    }

    /// The current state of one recipient, if it belongs to this call.
    #[must_use]
    pub fn state_of(&self, recipient: &EntityId) -> Option<DeliveryState> {
        self.inner
            .states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(recipient)
            .copied()
    }

    /// Snapshot of all per-recipient states.
    #[must_use]
    pub fn states(&self) -> HashMap<EntityId, DeliveryState> {
        self.inner
            .states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// True once every recipient has reached a terminal state.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.inner.remaining.load(Ordering::Acquire) == 0
    }

    /// Waits until every recipient is terminal and its callbacks ran.
    pub async fn wait_complete(&self) {
        loop {
            if self.is_complete() {
                return;
            }
            let notified = self.inner.done.notified();
            if self.is_complete() {
                return;
            }
            notified.await;
        }
    }
}
