//! # wrp-delivery
//!
//! Delivery coordination for the widget runtime event core: recipient
//! fan-out, the per-recipient state machine, deduplication, expiry and
//! reference-timeout enforcement, synchronous waits, and listener
//! notification.
//!
//! ## Design Principles
//!
//! - Each recipient is an independent asynchronous unit of work and an
//!   isolated failure domain; errors never abort delivery to others
//! - Per-recipient callbacks run in strict order, each at most once
//! - At most one delivery attempt per recipient per call; callers
//!   needing retry re-dispatch
//! - Entity resolution happens at delivery time through the
//!   [`EntityRegistry`] seam; the coordinator never moves bytes itself
//! - Timeout is a terminal state of its own, not an error
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use wrp_delivery::{
//!     CoordinatorConfig, DeliveryCoordinator, DispatchOptions, EntityRegistry, NoopSink,
//! };
//! use wrp_entity::EntityId;
//! use wrp_events::{AddressingInput, AllowAll, Event, OriginContext};
//!
//! # async fn example(registry: Arc<dyn EntityRegistry>) -> anyhow::Result<()> {
//! let ctx = OriginContext::new(EntityId::parse("clock.widget")?);
//! let event = Arc::new(
//!     Event::builder()
//!         .event_type("tick")
//!         .addressing(AddressingInput::new().to([EntityId::parse("dashboard.widget")?]))
//!         .build(&ctx, &AllowAll)?,
//! );
//!
//! let coordinator = DeliveryCoordinator::new(registry, CoordinatorConfig::default());
//! let handle = coordinator
//!     .dispatch(event, Arc::new(NoopSink), DispatchOptions::default())
//!     .await;
//! handle.wait_complete().await;
//! # Ok(())
//! # }
//! ```

mod callbacks;
mod coordinator;
mod listeners;
mod registry;
mod state;

pub use callbacks::{CallbackSink, NoopSink};
pub use coordinator::{CoordinatorConfig, DeliveryCoordinator, DispatchOptions};
pub use listeners::{EventListener, ListenerFilter, ListenerRegistry};
pub use registry::{Delivery, Endpoint, EndpointError, EntityRegistry, ResolveError};
pub use state::{DeliveryState, DispatchHandle};
