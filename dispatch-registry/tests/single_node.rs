use std::time::Duration;

use dispatch_pubsub::MemoryNetwork;
use dispatch_registry::{
    Dispatch,
    DispatchBuilder,
    DispatchError,
    EventKind,
    ServiceEvent,
    ServiceState,
    ServiceWatch,
};

static SERVICE: &str = "uploader";

#[tokio::test]
async fn test_lookup_on_empty_registry() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let node = start_node("node-1").await;
    let registry = node.registry();

    let res = registry.find_service(SERVICE, "file.png");
    assert!(matches!(res, Err(DispatchError::NoServiceForKey)));
    assert!(registry.find_multi_service(3, SERVICE, "file.png").is_empty());

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_single_endpoint_resolves_deterministically() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let node = start_node("node-1").await;
    let registry = node.registry();

    let mailbox = registry.mailbox("worker-1");
    let watch = registry.subscribe(SERVICE).await?;

    registry
        .add_service(SERVICE, mailbox.endpoint().clone())
        .await
        .expect("Register endpoint.");

    let event = next_event(&watch).await;
    assert_eq!(event.kind, EventKind::Join);
    assert_eq!(&event.endpoint, mailbox.endpoint());
    assert_eq!(event.meta.state, ServiceState::Online);

    let resolved = registry
        .find_service(SERVICE, "any_key")
        .expect("Resolve endpoint.");
    assert_eq!(&resolved, mailbox.endpoint());

    // A fixed membership set resolves the same key the same way, always.
    for _ in 0..50 {
        let again = registry
            .find_service(SERVICE, "any_key")
            .expect("Resolve endpoint.");
        assert_eq!(again, resolved);
    }

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_disable_removes_from_ring_but_keeps_listing() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let node = start_node("node-1").await;
    let registry = node.registry();

    let mailbox = registry.mailbox("worker-1");
    let watch = registry.subscribe(SERVICE).await?;
    registry
        .add_service(SERVICE, mailbox.endpoint().clone())
        .await
        .expect("Register endpoint.");
    assert_eq!(next_event(&watch).await.kind, EventKind::Join);

    let disabled = registry
        .disable_service(SERVICE, mailbox.endpoint().clone())
        .await
        .expect("Disable endpoint.");

    // A state flip announces itself as leave of the old meta, then a join
    // carrying the new state.
    let leave = next_event(&watch).await;
    assert_eq!(leave.kind, EventKind::Leave);
    assert_eq!(leave.meta.state, ServiceState::Online);
    let join = next_event(&watch).await;
    assert_eq!(join.kind, EventKind::Join);
    assert_eq!(join.meta.state, ServiceState::Offline);

    // Disabling an already-offline endpoint changes nothing: same token
    // back and no events for subscribers.
    let again = registry
        .disable_service(SERVICE, mailbox.endpoint().clone())
        .await
        .expect("Disable endpoint again.");
    assert_eq!(again, disabled);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(watch.try_recv().is_none());

    let services = registry.get_services(SERVICE).await?;
    assert_eq!(services.len(), 1);
    assert_eq!(services[0].1.state, ServiceState::Offline);

    assert!(registry.get_online_services(SERVICE).await?.is_empty());
    assert!(matches!(
        registry.find_service(SERVICE, "k"),
        Err(DispatchError::NoServiceForKey),
    ));

    // Enabling brings it straight back into the ring.
    registry
        .enable_service(SERVICE, mailbox.endpoint().clone())
        .await
        .expect("Enable endpoint.");
    assert_eq!(
        &registry.find_service(SERVICE, "k").expect("Resolve endpoint."),
        mailbox.endpoint(),
    );

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_remove_emits_leave_and_is_idempotent() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let node = start_node("node-1").await;
    let registry = node.registry();

    let mailbox = registry.mailbox("worker-1");
    let watch = registry.subscribe(SERVICE).await?;
    registry
        .add_service(SERVICE, mailbox.endpoint().clone())
        .await
        .expect("Register endpoint.");
    assert_eq!(next_event(&watch).await.kind, EventKind::Join);

    registry
        .remove_service(SERVICE, mailbox.endpoint().clone())
        .await
        .expect("Remove endpoint.");

    let leave = next_event(&watch).await;
    assert_eq!(leave.kind, EventKind::Leave);
    assert_eq!(&leave.endpoint, mailbox.endpoint());
    assert_eq!(leave.meta.state, ServiceState::Online);

    assert!(registry.get_services(SERVICE).await?.is_empty());

    // Removing again succeeds and must not emit a second leave.
    registry
        .remove_service(SERVICE, mailbox.endpoint().clone())
        .await
        .expect("Remove endpoint again.");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(watch.try_recv().is_none());

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_multi_lookup_is_distinct_and_stable() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let node = start_node("node-1").await;
    let registry = node.registry();

    let workers = [
        registry.mailbox("worker-1"),
        registry.mailbox("worker-2"),
        registry.mailbox("worker-3"),
    ];
    for worker in &workers {
        registry
            .add_service("t", worker.endpoint().clone())
            .await
            .expect("Register endpoint.");
    }

    let pair = registry.find_multi_service(2, "t", "k");
    assert_eq!(pair.len(), 2);
    assert_ne!(pair[0], pair[1]);
    assert!(workers.iter().any(|w| w.endpoint() == &pair[0]));
    assert!(workers.iter().any(|w| w.endpoint() == &pair[1]));

    // The ordered pair is stable for a fixed key and membership.
    for _ in 0..20 {
        assert_eq!(registry.find_multi_service(2, "t", "k"), pair);
    }

    // Asking for more than the ring holds yields everything, once.
    let all = registry.find_multi_service(10, "t", "k");
    assert_eq!(all.len(), 3);

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_owner_only_mutations() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let node = start_node("node-1").await;
    let registry = node.registry();
    let mailbox = registry.mailbox("worker-1");

    // Enable/disable before registration.
    let res = registry
        .enable_service(SERVICE, mailbox.endpoint().clone())
        .await;
    assert!(matches!(res, Err(DispatchError::NotRegistered)));
    let res = registry
        .disable_service(SERVICE, mailbox.endpoint().clone())
        .await;
    assert!(matches!(res, Err(DispatchError::NotRegistered)));

    // Registering an endpoint owned by some other node.
    let foreign = dispatch_registry::Endpoint::new("node-2", b"worker-9".as_ref());
    let res = registry.add_service(SERVICE, foreign).await;
    assert!(matches!(res, Err(DispatchError::NotOwned(_))));

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_reregistration_mints_fresh_refs() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let node = start_node("node-1").await;
    let registry = node.registry();
    let mailbox = registry.mailbox("worker-1");

    let first = registry
        .add_service(SERVICE, mailbox.endpoint().clone())
        .await
        .expect("Register endpoint.");
    let second = registry
        .add_service(SERVICE, mailbox.endpoint().clone())
        .await
        .expect("Re-register endpoint.");
    assert_ne!(first, second);

    let services = registry.get_services(SERVICE).await?;
    assert_eq!(services.len(), 1, "Re-registration replaces in place.");

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_subscribe_after_register_replays_online_set() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let node = start_node("node-1").await;
    let registry = node.registry();

    let online = registry.mailbox("worker-1");
    let offline = registry.mailbox("worker-2");
    registry
        .add_service(SERVICE, online.endpoint().clone())
        .await
        .expect("Register endpoint.");
    registry
        .add_service(SERVICE, offline.endpoint().clone())
        .await
        .expect("Register endpoint.");
    registry
        .disable_service(SERVICE, offline.endpoint().clone())
        .await
        .expect("Disable endpoint.");

    // Subscribing after the fact catches up with the online set only.
    let watch = registry.subscribe(SERVICE).await?;
    let event = next_event(&watch).await;
    assert_eq!(event.kind, EventKind::Join);
    assert_eq!(&event.endpoint, online.endpoint());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(watch.try_recv().is_none(), "Offline endpoints are not replayed.");

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_dropped_mailbox_is_unregistered() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let node = start_node("node-1").await;
    let registry = node.registry();

    let mailbox = registry.mailbox("worker-1");
    registry
        .add_service("t1", mailbox.endpoint().clone())
        .await
        .expect("Register endpoint.");
    registry
        .add_service("t2", mailbox.endpoint().clone())
        .await
        .expect("Register endpoint.");

    drop(mailbox);

    // Termination is observed asynchronously through the death watch.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let t1 = registry.get_services("t1").await?;
        let t2 = registry.get_services("t2").await?;
        if t1.is_empty() && t2.is_empty() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "Dropped mailbox was never unregistered.",
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_operations_fail_after_shutdown() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let node = start_node("node-1").await;
    let registry = node.registry();
    let mailbox = registry.mailbox("worker-1");

    node.shutdown().await;

    let res = registry
        .add_service(SERVICE, mailbox.endpoint().clone())
        .await;
    assert!(matches!(res, Err(DispatchError::Closed)));

    Ok(())
}

async fn start_node(name: &str) -> Dispatch {
    let network = MemoryNetwork::default();
    DispatchBuilder::new(network.join(name))
        .with_broadcast_period(Duration::from_millis(50))
        .with_max_silent_periods(4)
        .start()
}

async fn next_event(watch: &ServiceWatch) -> ServiceEvent {
    tokio::time::timeout(Duration::from_secs(5), watch.recv())
        .await
        .expect("Timed out waiting for a membership event.")
        .expect("Event watch closed unexpectedly.")
}
