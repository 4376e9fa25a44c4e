//! Integration tests for event dispatch.


use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use harness::{ctx, ent, eventually, simple_event, RecordingSink, SpyEndpoint, SpyRegistry};
use wrp_delivery::{
    CoordinatorConfig, DeliveryCoordinator, DeliveryState, DispatchOptions, EndpointError,
    NoopSink,
};
use wrp_events::{AddressingInput, AllowAll, DeliveryErrorKind, Event};

fn coordinator(registry: &Arc<SpyRegistry>) -> Arc<DeliveryCoordinator> {
    DeliveryCoordinator::new(registry.clone(), CoordinatorConfig::default())
}

#[tokio::test(flavor = "multi_thread")]
async fn dispatch_fans_out_with_ordered_callbacks() {
    let registry = SpyRegistry::new();
    let ep_b = registry.register("b");
    let ep_c = registry.register("c");
    let sink = RecordingSink::new();

    let event = Arc::new(
        Event::builder()
            .event_type("ping")
            .addressing(
                AddressingInput::new()
                    .to([ent("b")])
                    .cc([ent("c")]),
            )
            .build(&ctx("a"), &AllowAll)
            .unwrap(),
    );

    let handle = coordinator(&registry)
        .dispatch(event, sink.clone(), DispatchOptions::default())
        .await;
    handle.wait_complete().await;

    assert_eq!(handle.state_of(&ent("b")), Some(DeliveryState::Delivered));
    assert_eq!(handle.state_of(&ent("c")), Some(DeliveryState::Delivered));
    assert_eq!(ep_b.received_count(), 1);
    assert_eq!(ep_c.received_count(), 1);
    assert_eq!(sink.phases_for("b"), ["sending", "caching", "delivery"]);
    assert_eq!(sink.phases_for("c"), ["sending", "caching", "delivery"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn bcc_recipient_delivered_but_invisible() {
    let registry = SpyRegistry::new();
    let ep_b = registry.register("b");
    let ep_d = registry.register("d");

    let event = Arc::new(
        Event::builder()
            .event_type("ping")
            .addressing(AddressingInput::new().to([ent("b")]).bcc([ent("d")]))
            .build(&ctx("a"), &AllowAll)
            .unwrap(),
    );

    let handle = coordinator(&registry)
        .dispatch(event, Arc::new(NoopSink), DispatchOptions::default())
        .await;
    handle.wait_complete().await;

    // The blind recipient is delivered to individually...
    assert_eq!(ep_d.received_count(), 1);
    // ...but no delivery view exposes the bcc list.
    for delivery in ep_b.received().iter().chain(ep_d.received().iter()) {
        assert!(delivery.visible.bcc().is_empty());
        assert_eq!(delivery.visible.to(), &[ent("b")]);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn unresolvable_recipient_is_isolated() {
    let registry = SpyRegistry::new();
    let ep_b = registry.register("b");
    registry.mark_unreachable("down");
    // "ghost" is never registered at all
    let sink = RecordingSink::new();

    let event = simple_event("ping", "a", &["b", "down", "ghost"]);
    let handle = coordinator(&registry)
        .dispatch(event, sink.clone(), DispatchOptions::default())
        .await;
    handle.wait_complete().await;

    assert_eq!(handle.state_of(&ent("b")), Some(DeliveryState::Delivered));
    assert_eq!(
        handle.state_of(&ent("down")),
        Some(DeliveryState::Error(
            DeliveryErrorKind::DestinationUnreachable
        ))
    );
    assert_eq!(
        handle.state_of(&ent("ghost")),
        Some(DeliveryState::Error(DeliveryErrorKind::NoReference))
    );
    assert_eq!(ep_b.received_count(), 1);

    // Exactly one error callback per failed recipient, and no Sending
    // hop for resolution failures.
    assert_eq!(
        sink.phases_for("down"),
        ["error[destination_unreachable]"]
    );
    assert_eq!(sink.phases_for("ghost"), ["error[no_reference]"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn refused_delivery_reports_refused() {
    let registry = SpyRegistry::new();
    registry.register_endpoint(
        "b",
        SpyEndpoint::failing(EndpointError::Refused("not interested".into())),
    );
    let sink = RecordingSink::new();

    let event = simple_event("ping", "a", &["b"]);
    let handle = coordinator(&registry)
        .dispatch(event, sink.clone(), DispatchOptions::default())
        .await;
    handle.wait_complete().await;

    assert_eq!(
        handle.state_of(&ent("b")),
        Some(DeliveryState::Error(DeliveryErrorKind::Refused))
    );
    assert_eq!(sink.phases_for("b"), ["sending", "error[refused]"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn second_dispatch_reports_duplicate() {
    let registry = SpyRegistry::new();
    let ep_b = registry.register("b");
    let coordinator = coordinator(&registry);

    let event = simple_event("ping", "a", &["b"]);
    let first = coordinator
        .dispatch(event.clone(), Arc::new(NoopSink), DispatchOptions::default())
        .await;
    first.wait_complete().await;
    assert_eq!(ep_b.received_count(), 1);

    let sink = RecordingSink::new();
    let second = coordinator
        .dispatch(event, sink.clone(), DispatchOptions::default())
        .await;
    second.wait_complete().await;

    assert_eq!(
        second.state_of(&ent("b")),
        Some(DeliveryState::Error(DeliveryErrorKind::Duplicate))
    );
    // Not redelivered
    assert_eq!(ep_b.received_count(), 1);
    assert_eq!(sink.phases_for("b"), ["sending", "error[duplicate]"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn logically_identical_event_is_duplicate_for_its_recipient() {
    let registry = SpyRegistry::new();
    let ep_b = registry.register("b");
    let ep_c = registry.register("c");
    let coordinator = coordinator(&registry);

    // Same type and payload, addressing-insensitive: same identity.
    let first = simple_event("ping", "a", &["b"]);
    let second = simple_event("ping", "a", &["b", "c"]);
    assert_eq!(first.digest(), second.digest());

    coordinator
        .dispatch(first, Arc::new(NoopSink), DispatchOptions::default())
        .await
        .wait_complete()
        .await;
    let handle = coordinator
        .dispatch(second, Arc::new(NoopSink), DispatchOptions::default())
        .await;
    handle.wait_complete().await;

    // b already observed the identity, c has not.
    assert_eq!(
        handle.state_of(&ent("b")),
        Some(DeliveryState::Error(DeliveryErrorKind::Duplicate))
    );
    assert_eq!(handle.state_of(&ent("c")), Some(DeliveryState::Delivered));
    assert_eq!(ep_b.received_count(), 1);
    assert_eq!(ep_c.received_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_same_identity_dispatches_deliver_once() {
    let registry = SpyRegistry::new();
    let ep_b = SpyEndpoint::delayed(Duration::from_millis(100));
    registry.register_endpoint("b", ep_b.clone());
    let coordinator = coordinator(&registry);

    let first = simple_event("ping", "a", &["b"]);
    let second = simple_event("ping", "a", &["b"]);
    assert_eq!(first.digest(), second.digest());

    // Dispatch the second while the first is still in flight.
    let h1 = coordinator
        .dispatch(first, Arc::new(NoopSink), DispatchOptions::default())
        .await;
    let h2 = coordinator
        .dispatch(second, Arc::new(NoopSink), DispatchOptions::default())
        .await;
    tokio::join!(h1.wait_complete(), h2.wait_complete());

    let states = [
        h1.state_of(&ent("b")).unwrap(),
        h2.state_of(&ent("b")).unwrap(),
    ];
    assert!(states.contains(&DeliveryState::Delivered), "{states:?}");
    assert!(
        states.contains(&DeliveryState::Error(DeliveryErrorKind::Duplicate)),
        "{states:?}"
    );
    assert_eq!(ep_b.received_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn failed_attempt_leaves_the_identity_redispatchable() {
    let registry = SpyRegistry::new();
    registry.register_endpoint(
        "b",
        SpyEndpoint::failing(EndpointError::Refused("busy".into())),
    );
    let coordinator = coordinator(&registry);

    let event = simple_event("ping", "a", &["b"]);
    let first = coordinator
        .dispatch(event.clone(), Arc::new(NoopSink), DispatchOptions::default())
        .await;
    first.wait_complete().await;
    assert_eq!(
        first.state_of(&ent("b")),
        Some(DeliveryState::Error(DeliveryErrorKind::Refused))
    );

    // The endpoint recovers; the refused identity is not burned.
    let ep_b = registry.register("b");
    let second = coordinator
        .dispatch(event, Arc::new(NoopSink), DispatchOptions::default())
        .await;
    second.wait_complete().await;

    assert_eq!(second.state_of(&ent("b")), Some(DeliveryState::Delivered));
    assert_eq!(ep_b.received_count(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn expired_event_is_not_attempted() {
    let registry = SpyRegistry::new();
    let ep_b = registry.register("b");
    let sink = RecordingSink::new();

    let event = Arc::new(
        Event::builder()
            .event_type("ping")
            .addressing(AddressingInput::new().to([ent("b")]))
            .expires(Utc::now() - chrono::Duration::seconds(5))
            .build(&ctx("a"), &AllowAll)
            .unwrap(),
    );

    let handle = coordinator(&registry)
        .dispatch(event, sink.clone(), DispatchOptions::default())
        .await;
    handle.wait_complete().await;

    assert_eq!(
        handle.state_of(&ent("b")),
        Some(DeliveryState::Error(DeliveryErrorKind::Expired))
    );
    assert_eq!(ep_b.received_count(), 0);
    assert_eq!(sink.phases_for("b"), ["sending", "error[expired]"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_dispatch_releases_on_completion_before_expiry() {
    let registry = SpyRegistry::new();
    registry.register_endpoint("b", SpyEndpoint::delayed(Duration::from_millis(40)));
    registry.register_endpoint("c", SpyEndpoint::delayed(Duration::from_millis(40)));

    let event = Arc::new(
        Event::builder()
            .event_type("ping")
            .addressing(AddressingInput::new().to([ent("b"), ent("c")]))
            .expires(Utc::now() + chrono::Duration::seconds(5))
            .build(&ctx("a"), &AllowAll)
            .unwrap(),
    );

    let started = Instant::now();
    let handle = coordinator(&registry)
        .dispatch(
            event,
            Arc::new(NoopSink),
            DispatchOptions {
                sync: true,
                ..Default::default()
            },
        )
        .await;
    let elapsed = started.elapsed();

    // All-terminal won the race against the 5s expiry timer.
    assert!(handle.is_complete());
    assert!(elapsed >= Duration::from_millis(40), "returned too early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "waited for expiry: {elapsed:?}");
    assert_eq!(handle.state_of(&ent("b")), Some(DeliveryState::Delivered));
    assert_eq!(handle.state_of(&ent("c")), Some(DeliveryState::Delivered));
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_dispatch_releases_at_expiry_when_delivery_hangs() {
    let registry = SpyRegistry::new();
    registry.register_endpoint("b", SpyEndpoint::delayed(Duration::from_secs(30)));

    let event = Arc::new(
        Event::builder()
            .event_type("ping")
            .addressing(AddressingInput::new().to([ent("b")]))
            .expires(Utc::now() + chrono::Duration::milliseconds(100))
            .build(&ctx("a"), &AllowAll)
            .unwrap(),
    );

    let started = Instant::now();
    let handle = coordinator(&registry)
        .dispatch(
            event,
            Arc::new(NoopSink),
            DispatchOptions {
                sync: true,
                ..Default::default()
            },
        )
        .await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(100), "returned before expiry: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5), "expiry timer did not release: {elapsed:?}");
    // The recipient is still in flight; the expiry timer released the caller.
    assert_eq!(handle.state_of(&ent("b")), Some(DeliveryState::Sending));
}

#[tokio::test(flavor = "multi_thread")]
async fn sync_dispatch_with_past_deadlines_returns_immediately() {
    let registry = SpyRegistry::new();
    registry.register("b");

    let event = Arc::new(
        Event::builder()
            .event_type("ping")
            .addressing(AddressingInput::new().to([ent("b")]))
            .expires(Utc::now() - chrono::Duration::seconds(1))
            .build(&ctx("a"), &AllowAll)
            .unwrap(),
    );

    let started = Instant::now();
    let handle = coordinator(&registry)
        .dispatch(
            event,
            Arc::new(NoopSink),
            DispatchOptions {
                reference_timeout: Some(Utc::now() - chrono::Duration::seconds(1)),
                sync: true,
            },
        )
        .await;
    assert!(started.elapsed() < Duration::from_millis(200));

    // The deliveries still run their course and observe the expiry.
    eventually(|| handle.is_complete()).await;
    assert_eq!(
        handle.state_of(&ent("b")),
        Some(DeliveryState::Error(DeliveryErrorKind::Expired))
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn reference_timeout_times_out_slow_recipient() {
    let registry = SpyRegistry::new();
    let ep_fast = registry.register("fast");
    registry.register_endpoint("slow", SpyEndpoint::delayed(Duration::from_secs(30)));
    let sink = RecordingSink::new();

    let event = simple_event("ping", "a", &["fast", "slow"]);
    let started = Instant::now();
    let handle = coordinator(&registry)
        .dispatch(
            event,
            sink.clone(),
            DispatchOptions {
                reference_timeout: Some(Utc::now() + chrono::Duration::milliseconds(150)),
                sync: true,
            },
        )
        .await;
    let elapsed = started.elapsed();

    assert!(elapsed >= Duration::from_millis(150));
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(handle.state_of(&ent("fast")), Some(DeliveryState::Delivered));

    eventually(|| handle.state_of(&ent("slow")) == Some(DeliveryState::TimedOut)).await;
    assert_eq!(ep_fast.received_count(), 1);
    assert_eq!(sink.phases_for("slow"), ["sending", "timeout"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn default_reference_hold_bounds_calls_without_an_explicit_timeout() {
    let registry = SpyRegistry::new();
    registry.register_endpoint("slow", SpyEndpoint::delayed(Duration::from_secs(30)));
    let coordinator = DeliveryCoordinator::new(
        registry.clone(),
        CoordinatorConfig {
            default_reference_hold: Some(Duration::from_millis(100)),
            ..Default::default()
        },
    );
    let sink = RecordingSink::new();

    let handle = coordinator
        .dispatch(
            simple_event("ping", "a", &["slow"]),
            sink.clone(),
            DispatchOptions::default(),
        )
        .await;
    handle.wait_complete().await;

    assert_eq!(handle.state_of(&ent("slow")), Some(DeliveryState::TimedOut));
    assert_eq!(sink.phases_for("slow"), ["sending", "timeout"]);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_dispatches_all_complete_under_a_small_limiter() {
    let registry = SpyRegistry::new();
    let ep_b = SpyEndpoint::delayed(Duration::from_millis(5));
    registry.register_endpoint("b", ep_b.clone());
    let coordinator = DeliveryCoordinator::new(
        registry.clone(),
        CoordinatorConfig {
            max_concurrent_deliveries: 2,
            ..Default::default()
        },
    );

    let mut handles = Vec::new();
    for i in 0..8 {
        let event = simple_event(&format!("burst_{i}"), "a", &["b"]);
        handles.push(
            coordinator
                .dispatch(event, Arc::new(NoopSink), DispatchOptions::default())
                .await,
        );
    }
    futures_util::future::join_all(handles.iter().map(|h| h.wait_complete())).await;

    for handle in &handles {
        assert_eq!(handle.state_of(&ent("b")), Some(DeliveryState::Delivered));
    }
    assert_eq!(ep_b.received_count(), 8);
}

#[tokio::test(flavor = "multi_thread")]
async fn async_dispatch_returns_before_delivery_completes() {
    let registry = SpyRegistry::new();
    registry.register_endpoint("b", SpyEndpoint::delayed(Duration::from_millis(80)));

    let event = simple_event("ping", "a", &["b"]);
    let started = Instant::now();
    let handle = coordinator(&registry)
        .dispatch(event, Arc::new(NoopSink), DispatchOptions::default())
        .await;
    assert!(started.elapsed() < Duration::from_millis(50));
    assert!(!handle.is_complete());

    handle.wait_complete().await;
    assert_eq!(handle.state_of(&ent("b")), Some(DeliveryState::Delivered));
}
